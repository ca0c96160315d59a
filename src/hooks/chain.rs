use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use super::{HookDecision, HookError, HookEvent, HookHandler, HookPoint};
use crate::telemetry::counters;

/// A registered hook handler.
pub struct HookRegistration {
    /// Module (or "app") that registered this handler
    pub owner: String,
    /// Registration sequence number
    pub order: u64,
    pub handler: Arc<dyn HookHandler>,
}

impl fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistration")
            .field("owner", &self.owner)
            .field("order", &self.order)
            .finish()
    }
}

/// Registry and executor of hook handlers.
pub struct HookChain {
    handlers: RwLock<HashMap<HookPoint, Vec<Arc<HookRegistration>>>>,
    next_order: AtomicU64,
    timeout: Duration,
}

impl HookChain {
    /// Create an empty chain. Each handler call is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_order: AtomicU64::new(1),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a handler behind the ones already registered for `hook`.
    pub fn register(&self, hook: HookPoint, owner: &str, handler: impl HookHandler) -> u64 {
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .entry(hook)
            .or_default()
            .push(Arc::new(HookRegistration {
                owner: owner.to_string(),
                order,
                handler: Arc::new(handler),
            }));

        debug!(%hook, owner, order, "registered hook handler");
        order
    }

    /// Remove every handler registered by `owner`. Returns how many were
    /// removed.
    pub fn unregister_owner(&self, owner: &str) -> usize {
        let mut handlers = self.handlers.write();
        let mut removed = 0;

        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|r| r.owner != owner);
            removed += before - list.len();
        }
        handlers.retain(|_, list| !list.is_empty());

        debug!(owner, removed, "unregistered hook handlers");
        removed
    }

    pub fn has_handlers(&self, hook: HookPoint) -> bool {
        self.handlers.read().get(&hook).is_some_and(|h| !h.is_empty())
    }

    /// Total number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    pub fn handler_count_for(&self, hook: HookPoint) -> usize {
        self.handlers.read().get(&hook).map_or(0, Vec::len)
    }

    /// Run the handlers for `event.hook` until one rejects. Returns the
    /// event with any body modification applied.
    pub async fn run(&self, mut event: HookEvent) -> Result<HookEvent, HookError> {
        let hook = event.hook;

        for registration in self.snapshot(hook) {
            match self.call(&registration, event.clone()).await? {
                HookDecision::Allow => {}
                HookDecision::Modify(body) => {
                    if hook == HookPoint::SendOrPub {
                        trace!(%hook, owner = %registration.owner, "message body replaced");
                        event.body = Some(body);
                    } else {
                        debug!(%hook, owner = %registration.owner, "modify ignored outside send_or_pub");
                    }
                }
                HookDecision::Reject(reason) => {
                    debug!(%hook, owner = %registration.owner, %reason, session = %event.session.id(), "hook chain rejected");
                    counters::hook_rejected(hook);
                    return Err(HookError::Rejected {
                        hook,
                        owner: registration.owner.clone(),
                        reason,
                    });
                }
            }
        }

        Ok(event)
    }

    /// Run every handler for a notification hook. Decisions are ignored.
    pub async fn notify(&self, event: HookEvent) {
        let hook = event.hook;

        for registration in self.snapshot(hook) {
            if let Err(e) = self.call(&registration, event.clone()).await {
                warn!(%hook, error = %e, "notification handler failed");
            }
        }
    }

    fn snapshot(&self, hook: HookPoint) -> Vec<Arc<HookRegistration>> {
        self.handlers.read().get(&hook).cloned().unwrap_or_default()
    }

    async fn call(&self, registration: &HookRegistration, event: HookEvent) -> Result<HookDecision, HookError> {
        let hook = event.hook;
        let call = AssertUnwindSafe(registration.handler.call(event)).catch_unwind();

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(_)) => {
                error!(%hook, owner = %registration.owner, "hook handler panicked");
                counters::hook_rejected(hook);
                Err(HookError::Rejected {
                    hook,
                    owner: registration.owner.clone(),
                    reason: "handler panicked".to_string(),
                })
            }
            Err(_) => {
                warn!(%hook, owner = %registration.owner, timeout = ?self.timeout, "hook handler timed out");
                counters::hook_timed_out(hook);
                Err(HookError::Timeout {
                    hook,
                    owner: registration.owner.clone(),
                })
            }
        }
    }
}

impl Default for HookChain {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl fmt::Debug for HookChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookChain")
            .field("handlers", &self.handler_count())
            .field("timeout", &self.timeout)
            .finish()
    }
}
