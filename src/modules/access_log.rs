use tracing::{debug, info};

use super::{GatewayModule, ModuleError, ModuleId, ModuleRegistrar};
use crate::hooks::{HookDecision, HookEvent, HookPoint};

/// Logs every session lifecycle hook. Never vetoes.
pub struct AccessLogModule;

impl GatewayModule for AccessLogModule {
    fn id(&self) -> ModuleId {
        ModuleId::new("eventgate", "access-log", "1.0")
    }

    fn install(&self, registrar: &ModuleRegistrar<'_>) -> Result<(), ModuleError> {
        for hook in [
            HookPoint::SocketCreated,
            HookPoint::PreRegister,
            HookPoint::PostRegister,
            HookPoint::Unregister,
            HookPoint::SocketClosed,
        ] {
            registrar.register(hook, |event: HookEvent| async move {
                info!(
                    hook = %event.hook,
                    session = %event.session.id(),
                    bridge = event.session.bridge(),
                    peer = %event.session.peer(),
                    address = event.address.as_deref().unwrap_or(""),
                    "session event"
                );
                HookDecision::Allow
            });
        }

        registrar.register(HookPoint::SendOrPub, |event: HookEvent| async move {
            debug!(
                session = %event.session.id(),
                address = event.address.as_deref().unwrap_or(""),
                send = event.send,
                inbound = event.inbound,
                bytes = event.body.as_ref().map_or(0, |b| b.len()),
                "message"
            );
            HookDecision::Allow
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookChain;
    use crate::modules::ModuleRegistry;
    use std::sync::Arc;

    #[test]
    fn test_installs_lifecycle_handlers() {
        let hooks = Arc::new(HookChain::default());
        let registry = ModuleRegistry::new(hooks.clone());
        registry.load("eventgate~access-log~1.0").unwrap();

        assert_eq!(hooks.handler_count(), 6);
        assert!(hooks.has_handlers(HookPoint::SocketClosed));
        assert!(!hooks.has_handlers(HookPoint::Authorise));
    }
}
