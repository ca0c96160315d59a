use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{BridgeError, Permit, PermittedList};
use crate::bus::{BusMessage, EventBus, HandlerId};
use crate::config::{BridgeConfig, SessionLimits};
use crate::context::ContextPool;
use crate::hooks::{AuthAction, HookChain, HookEvent, HookPoint};
use crate::session::{decode_body, encode_body, ClientFrame, ServerFrame, Session, SessionId, SessionRegistry, SessionState};
use crate::telemetry::counters;

/// Bridges the sessions of one endpoint onto the event bus.
pub struct BusBridge {
    name: String,
    bus: Arc<EventBus>,
    hooks: Arc<HookChain>,
    contexts: Arc<ContextPool>,
    inbound: PermittedList,
    outbound: PermittedList,
    sessions: SessionRegistry,
    /// Bus handlers per session and subscribed address. An entry exists
    /// from accept until the session is detached.
    subscriptions: DashMap<SessionId, HashMap<String, HandlerId>>,
    limits: SessionLimits,
    reply_timeout: Duration,
    dropped: AtomicU64,
    this: Weak<BusBridge>,
}

impl BusBridge {
    /// Create a bridge from its configuration.
    pub fn new(
        config: &BridgeConfig,
        bus: Arc<EventBus>,
        hooks: Arc<HookChain>,
        contexts: Arc<ContextPool>,
        reply_timeout: Duration,
    ) -> Result<Arc<Self>, BridgeError> {
        let inbound = PermittedList::compile(&config.inbound_permitted)
            .map_err(|e| BridgeError::Config(format!("inbound_permitted: {e}")))?;
        let outbound = PermittedList::compile(&config.outbound_permitted)
            .map_err(|e| BridgeError::Config(format!("outbound_permitted: {e}")))?;

        Ok(Arc::new_cyclic(|this| Self {
            name: config.name.clone(),
            bus,
            hooks,
            contexts,
            inbound,
            outbound,
            sessions: SessionRegistry::new(),
            subscriptions: DashMap::new(),
            limits: config.limits.clone(),
            reply_timeout,
            dropped: AtomicU64::new(0),
            this: this.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn hooks(&self) -> &Arc<HookChain> {
        &self.hooks
    }

    /// Live sessions.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.count()
    }

    /// Bus messages withheld from subscribers by the outbound permitted
    /// list, `authorise` or a `send_or_pub` veto.
    pub fn dropped_deliveries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Create a session for an accepted transport connection and run
    /// `socket_created`. A veto closes the session before it is returned.
    pub async fn accept(
        self: &Arc<Self>,
        peer: SocketAddr,
        sink: mpsc::Sender<ServerFrame>,
    ) -> Result<Arc<Session>, BridgeError> {
        if self.sessions.count() >= self.limits.max_sessions {
            warn!(bridge = %self.name, %peer, max = self.limits.max_sessions, "session limit reached");
            counters::session_rejected(&self.name, "session_limit");
            return Err(BridgeError::SessionLimit(self.limits.max_sessions));
        }

        let session = Arc::new(Session::new(&self.name, peer, self.contexts.create(), sink));
        self.subscriptions.insert(session.id().clone(), HashMap::new());
        self.sessions.insert(session.clone());
        counters::session_opened(&self.name);

        let hooks = self.hooks.clone();
        let event = HookEvent::new(HookPoint::SocketCreated, session.clone());
        let created = session.context().call(async move { hooks.run(event).await }).await;

        match created {
            Ok(Ok(_)) => {
                debug!(bridge = %self.name, session = %session.id(), %peer, context = %session.context().id(), "session created");
                Ok(session)
            }
            Ok(Err(veto)) => {
                let err = BridgeError::from_hook(veto, None);
                self.close(&session, &err.to_string()).await;
                Err(err)
            }
            Err(closed) => {
                self.close(&session, "context closed").await;
                Err(closed.into())
            }
        }
    }

    /// Dispatch a client frame on the session's context.
    pub async fn handle_frame(self: &Arc<Self>, session: &Arc<Session>, frame: ClientFrame) -> Result<(), BridgeError> {
        self.on_context(session, move |bridge, session| async move {
            match frame {
                ClientFrame::Send {
                    address,
                    body,
                    reply_address,
                } => bridge.client_send(&session, address, body, reply_address, true).await,
                ClientFrame::Publish { address, body } => bridge.client_send(&session, address, body, None, false).await,
                ClientFrame::Register { address } => bridge.do_subscribe(&session, address).await,
                ClientFrame::Unregister { address } => bridge.do_unsubscribe(&session, address).await,
                ClientFrame::Ping => {
                    session.deliver(ServerFrame::Pong);
                    Ok(())
                }
            }
        })
        .await
    }

    /// Handle a frame and report any failure to the client as an `err`
    /// frame. Used by transports.
    pub async fn dispatch(self: &Arc<Self>, session: &Arc<Session>, frame: ClientFrame) {
        let address = frame.address().map(str::to_string);
        if let Err(e) = self.handle_frame(session, frame).await {
            debug!(session = %session.id(), error = %e, "frame failed");
            session.deliver(ServerFrame::error(e.code(), e.to_string(), address.as_deref()));
        }
    }

    /// Subscribe the session to `address`.
    pub async fn subscribe(self: &Arc<Self>, session: &Arc<Session>, address: &str) -> Result<(), BridgeError> {
        let address = address.to_string();
        self.on_context(session, move |bridge, session| async move { bridge.do_subscribe(&session, address).await })
            .await
    }

    /// Unsubscribe the session from `address`.
    pub async fn unsubscribe(self: &Arc<Self>, session: &Arc<Session>, address: &str) -> Result<(), BridgeError> {
        let address = address.to_string();
        self.on_context(session, move |bridge, session| async move { bridge.do_unsubscribe(&session, address).await })
            .await
    }

    /// Explicit teardown: `unregister` for every subscribed address, then
    /// close. A veto leaves the session active. Calling it again once the
    /// session is closing is a no-op.
    pub async fn unregister(self: &Arc<Self>, session: &Arc<Session>) -> Result<(), BridgeError> {
        if session.is_closed() {
            return Ok(());
        }
        self.on_context(session, |bridge, session| async move { bridge.do_unregister(&session).await })
            .await
    }

    /// Publish a message to every subscribed session.
    pub fn publish(&self, address: &str, body: impl Into<Bytes>) -> usize {
        self.bus.publish(BusMessage::new(address, body))
    }

    /// Send a message to one subscriber.
    pub fn send(&self, address: &str, body: impl Into<Bytes>) -> bool {
        self.bus.send(BusMessage::new(address, body))
    }

    /// Abrupt teardown straight to `CLOSED`. Fires `socket_closed` once;
    /// returns false if the session was already closed.
    pub async fn close(&self, session: &Arc<Session>, reason: &str) -> bool {
        if !session.mark_closed(reason) {
            return false;
        }

        self.detach(session);
        counters::session_closed(&self.name);
        info!(
            bridge = %self.name,
            session = %session.id(),
            peer = %session.peer(),
            reason,
            uptime_ms = session.uptime().as_millis() as u64,
            "session closed"
        );

        let hooks = self.hooks.clone();
        let event = HookEvent::new(HookPoint::SocketClosed, session.clone());
        if let Err(e) = session.context().call(async move { hooks.notify(event).await }).await {
            warn!(session = %session.id(), error = %e, "socket_closed not delivered");
        }
        true
    }

    /// Close every session.
    pub async fn close_all(&self, reason: &str) -> usize {
        let mut closed = 0;
        for session in self.sessions.all() {
            if self.close(&session, reason).await {
                closed += 1;
            }
        }
        closed
    }

    async fn on_context<F, Fut, T>(self: &Arc<Self>, session: &Arc<Session>, f: F) -> Result<T, BridgeError>
    where
        F: FnOnce(Arc<Self>, Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, BridgeError>> + Send + 'static,
        T: Send + 'static,
    {
        if session.is_closed() {
            return Err(BridgeError::SessionClosed);
        }
        let fut = f(self.clone(), session.clone());
        session.context().call(fut).await?
    }

    async fn do_subscribe(self: Arc<Self>, session: &Arc<Session>, address: String) -> Result<(), BridgeError> {
        let state = session.state();
        match state {
            SessionState::Closed => return Err(BridgeError::SessionClosed),
            SessionState::Created | SessionState::Active => {}
            state => return Err(BridgeError::InvalidState(state)),
        }
        if session.is_subscribed(&address) {
            return Ok(());
        }

        let permit = self.outbound.check_address(&address);
        if permit == Permit::Denied {
            return Err(BridgeError::NotPermitted(address));
        }
        self.authorise(session, &address, AuthAction::Subscribe, permit, None).await?;

        let first = state == SessionState::Created;
        if first {
            session.transition(SessionState::Registering)?;
        }

        let event = HookEvent::new(HookPoint::PreRegister, session.clone()).with_address(&address);
        if let Err(veto) = self.hooks.run(event).await {
            let err = BridgeError::from_hook(veto, Some(&address));
            if first {
                self.close(session, &err.to_string()).await;
            }
            return Err(err);
        }

        if first {
            session.transition(SessionState::Active)?;
        }
        self.add_subscription(session, &address)?;

        let event = HookEvent::new(HookPoint::PostRegister, session.clone()).with_address(&address);
        self.hooks.notify(event).await;
        Ok(())
    }

    async fn do_unsubscribe(self: Arc<Self>, session: &Arc<Session>, address: String) -> Result<(), BridgeError> {
        if session.is_closed() {
            return Err(BridgeError::SessionClosed);
        }
        if !session.is_subscribed(&address) {
            return Ok(());
        }

        let event = HookEvent::new(HookPoint::Unregister, session.clone()).with_address(&address);
        self.hooks
            .run(event)
            .await
            .map_err(|veto| BridgeError::from_hook(veto, Some(&address)))?;

        self.remove_subscription(session, &address);
        Ok(())
    }

    async fn do_unregister(self: Arc<Self>, session: &Arc<Session>) -> Result<(), BridgeError> {
        match session.state() {
            SessionState::Closed | SessionState::Unregistering => return Ok(()),
            SessionState::Active => {}
            // nothing registered yet, so nothing to veto
            SessionState::Created | SessionState::Registering => {
                self.close(session, "unregistered").await;
                return Ok(());
            }
        }

        session.transition(SessionState::Unregistering)?;

        let addresses = session.addresses();
        let targets: Vec<Option<&str>> = if addresses.is_empty() {
            vec![None]
        } else {
            addresses.iter().map(|a| Some(a.as_str())).collect()
        };

        for address in targets {
            let mut event = HookEvent::new(HookPoint::Unregister, session.clone());
            event.address = address.map(str::to_string);

            if let Err(veto) = self.hooks.run(event).await {
                let err = BridgeError::from_hook(veto, address);
                // closed meanwhile by the transport
                if session.transition(SessionState::Active).is_err() {
                    return Err(BridgeError::SessionClosed);
                }
                debug!(session = %session.id(), error = %err, "unregister vetoed");
                return Err(err);
            }
        }

        for address in &addresses {
            self.remove_subscription(session, address);
        }
        self.close(session, "unregistered").await;
        Ok(())
    }

    async fn client_send(
        self: Arc<Self>,
        session: &Arc<Session>,
        address: String,
        body: Value,
        reply_address: Option<String>,
        send: bool,
    ) -> Result<(), BridgeError> {
        let state = session.state();
        if state.is_closed() {
            return Err(BridgeError::SessionClosed);
        }
        if !state.can_send() {
            return Err(BridgeError::InvalidState(state));
        }

        let permit = self.inbound.check(&address, Some(&body));
        if permit == Permit::Denied {
            return Err(BridgeError::NotPermitted(address));
        }

        let action = if send { AuthAction::Send } else { AuthAction::Publish };
        let encoded = encode_body(&body);
        self.authorise(session, &address, action, permit, Some(encoded.clone()))
            .await?;

        let message = BusMessage::new(address.clone(), encoded);
        let event = HookEvent::new(HookPoint::SendOrPub, session.clone()).with_message(&message, send, true);
        let event = self
            .hooks
            .run(event)
            .await
            .map_err(|veto| BridgeError::from_hook(veto, Some(&address)))?;
        let message = event.message().unwrap_or(message);

        counters::message_inbound(&self.name);

        match (send, reply_address) {
            (true, Some(reply_to)) => self.forward_request(session, message, reply_to),
            (true, None) => {
                if !self.bus.send(message) {
                    trace!(session = %session.id(), %address, "send with no handlers");
                }
            }
            (false, _) => {
                self.bus.publish(message);
            }
        }
        Ok(())
    }

    /// Send as a bus request and hand the reply, or the failure, back to the
    /// session under the client's reply address.
    fn forward_request(&self, session: &Arc<Session>, message: BusMessage, reply_to: String) {
        let bus = self.bus.clone();
        let timeout = self.reply_timeout;
        let session = session.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = session.closed() => {
                    trace!(session = %session.id(), "request abandoned, session closed");
                    return;
                }
                outcome = bus.request(message, timeout) => outcome,
            };
            let context = session.context().clone();
            let queued = context.run(async move {
                if !session.state().can_receive() {
                    return;
                }
                let frame = match outcome {
                    Ok(reply) => ServerFrame::Message {
                        address: reply_to,
                        body: decode_body(&reply.body),
                        reply_address: reply.reply_address,
                    },
                    Err(e) => {
                        let err = BridgeError::from(e);
                        ServerFrame::error(err.code(), err.to_string(), Some(&reply_to))
                    }
                };
                session.deliver(frame);
            });
            if let Err(e) = queued {
                debug!(error = %e, "reply dropped");
            }
        });
    }

    /// Outbound path for one bus message to one session.
    async fn deliver(self: Arc<Self>, session: Arc<Session>, message: BusMessage) {
        if !session.state().can_receive() || !session.is_subscribed(&message.address) {
            return;
        }

        let body = decode_body(&message.body);
        let permit = self.outbound.check(&message.address, Some(&body));
        if permit == Permit::Denied {
            trace!(session = %session.id(), address = %message.address, "outbound not permitted");
            self.record_dropped("not_permitted");
            return;
        }
        if let Err(e) = self
            .authorise(&session, &message.address, AuthAction::Receive, permit, Some(message.body.clone()))
            .await
        {
            debug!(session = %session.id(), address = %message.address, error = %e, "delivery not authorised");
            self.record_dropped("not_authorised");
            return;
        }

        if session.is_closed() {
            return;
        }
        let event = HookEvent::new(HookPoint::SendOrPub, session.clone()).with_message(&message, false, false);
        let message = match self.hooks.run(event).await {
            Ok(event) => event.message().unwrap_or(message),
            Err(veto) => {
                debug!(session = %session.id(), address = %message.address, error = %veto, "delivery vetoed");
                self.record_dropped("vetoed");
                return;
            }
        };

        if session.deliver(ServerFrame::message(&message)) {
            counters::message_outbound(&self.name);
        }
    }

    fn record_dropped(&self, reason: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        counters::delivery_dropped(&self.name, reason);
    }

    async fn authorise(
        &self,
        session: &Arc<Session>,
        address: &str,
        action: AuthAction,
        permit: Permit,
        body: Option<Bytes>,
    ) -> Result<(), BridgeError> {
        if !self.hooks.has_handlers(HookPoint::Authorise) {
            return match permit {
                Permit::RequiresAuth => Err(BridgeError::NotAuthorised(address.to_string())),
                _ => Ok(()),
            };
        }

        let mut event = HookEvent::new(HookPoint::Authorise, session.clone())
            .with_address(address)
            .with_action(action);
        event.body = body;

        self.hooks
            .run(event)
            .await
            .map(|_| ())
            .map_err(|veto| BridgeError::from_hook(veto, Some(address)))
    }

    fn add_subscription(&self, session: &Arc<Session>, address: &str) -> Result<(), BridgeError> {
        let Some(mut handlers) = self.subscriptions.get_mut(session.id()) else {
            return Err(BridgeError::SessionClosed);
        };
        if handlers.contains_key(address) {
            return Ok(());
        }

        let bridge = self.this.clone();
        let session_id = session.id().clone();
        let id = self.bus.register(address, move |message: BusMessage| {
            let Some(bridge) = bridge.upgrade() else {
                return;
            };
            let Some(session) = bridge.sessions.get(&session_id) else {
                return;
            };
            let context = session.context().clone();
            if let Err(e) = context.run(bridge.deliver(session, message)) {
                debug!(session = %session_id, error = %e, "delivery dropped");
            }
        });

        handlers.insert(address.to_string(), id);
        session.add_address(address);
        debug!(session = %session.id(), address, "subscribed");
        Ok(())
    }

    fn remove_subscription(&self, session: &Arc<Session>, address: &str) {
        let id = self
            .subscriptions
            .get_mut(session.id())
            .and_then(|mut handlers| handlers.remove(address));
        if let Some(id) = id {
            self.bus.unregister(address, id);
        }
        session.remove_address(address);
        debug!(session = %session.id(), address, "unsubscribed");
    }

    /// Drop every bus handler of a closed session and forget it.
    fn detach(&self, session: &Arc<Session>) {
        if let Some((_, handlers)) = self.subscriptions.remove(session.id()) {
            for (address, id) in handlers {
                self.bus.unregister(&address, id);
            }
        }
        session.take_addresses();
        self.sessions.remove(session.id());
    }
}

impl std::fmt::Debug for BusBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusBridge")
            .field("name", &self.name)
            .field("sessions", &self.sessions.count())
            .finish()
    }
}
