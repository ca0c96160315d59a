//! Bus bridge integration tests
//!
//! Session lifecycle through the hook chain, driven directly and over a
//! WebSocket connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use eventgate::bridge::{BridgeError, BusBridge};
use eventgate::bus::{BusMessage, EventBus};
use eventgate::config::Config;
use eventgate::context::{current_context, ContextId, ContextPool, WorkerConfig};
use eventgate::hooks::{HookChain, HookDecision, HookEvent, HookPoint};
use eventgate::session::{encode_body, ServerFrame, Session, SessionState};
use eventgate::transport::WebSocketListener;

const WAIT: Duration = Duration::from_secs(2);

type Log = Arc<Mutex<Vec<String>>>;

struct Fixture {
    bus: Arc<EventBus>,
    hooks: Arc<HookChain>,
    bridge: Arc<BusBridge>,
    log: Log,
}

impl Fixture {
    fn new() -> Self {
        let config = Config::from_yaml(
            r#"
bridges:
  - name: test
    address: "127.0.0.1:0"
    inbound_permitted: [{}]
    outbound_permitted: [{}]
"#,
        )
        .unwrap();

        let contexts = Arc::new(
            ContextPool::new(&WorkerConfig {
                workers: 2,
                ..Default::default()
            })
            .unwrap(),
        );
        let bus = EventBus::new();
        let hooks = Arc::new(HookChain::new(Duration::from_secs(1)));
        let bridge = BusBridge::new(
            &config.bridges[0],
            bus.clone(),
            hooks.clone(),
            contexts,
            Duration::from_secs(1),
        )
        .unwrap();

        let log: Log = Arc::new(Mutex::new(Vec::new()));
        for hook in HookPoint::ALL {
            let log = log.clone();
            hooks.register(hook, "recorder", move |event: HookEvent| {
                let log = log.clone();
                async move {
                    log.lock()
                        .push(format!("{}:{}", event.hook, event.address.unwrap_or_default()));
                    HookDecision::Allow
                }
            });
        }

        Self { bus, hooks, bridge, log }
    }

    async fn accept(&self) -> (Arc<Session>, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(64);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let session = self.bridge.accept(peer, tx).await.unwrap();
        (session, rx)
    }

    /// Recorded hooks, without authorise calls.
    fn lifecycle(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|e| !e.starts_with("authorise"))
            .cloned()
            .collect()
    }

    fn count(&self, hook: HookPoint) -> usize {
        let prefix = format!("{hook}:");
        self.log.lock().iter().filter(|e| e.starts_with(&prefix)).count()
    }
}

async fn next_frame(rx: &mut mpsc::Receiver<ServerFrame>) -> ServerFrame {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("sink closed")
}

#[tokio::test]
async fn test_lifecycle_hook_order() {
    let fx = Fixture::new();
    let (session, mut rx) = fx.accept().await;
    assert_eq!(session.state(), SessionState::Created);

    fx.bridge.subscribe(&session, "news").await.unwrap();
    assert_eq!(session.state(), SessionState::Active);

    assert_eq!(fx.bridge.publish("news", encode_body(&json!({"n": 1}))), 1);
    match next_frame(&mut rx).await {
        ServerFrame::Message { address, body, .. } => {
            assert_eq!(address, "news");
            assert_eq!(body, json!({"n": 1}));
        }
        other => panic!("unexpected frame {other:?}"),
    }

    fx.bridge.unregister(&session).await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);

    assert_eq!(
        fx.lifecycle(),
        vec![
            "socket_created:",
            "pre_register:news",
            "post_register:news",
            "send_or_pub:news",
            "unregister:news",
            "socket_closed:",
        ]
    );

    // Nothing fires once the session is closed
    let before = fx.log.lock().len();
    assert_eq!(
        fx.bridge.subscribe(&session, "other").await,
        Err(BridgeError::SessionClosed)
    );
    assert!(!fx.bridge.close(&session, "again").await);
    assert_eq!(fx.log.lock().len(), before);

    assert_eq!(fx.bus.handler_count("news"), 0);
    assert_eq!(fx.bridge.session_count(), 0);
}

#[tokio::test]
async fn test_pre_register_veto_closes_session() {
    let fx = Fixture::new();
    let seen = Arc::new(Mutex::new(None));
    {
        let seen = seen.clone();
        fx.hooks.register(HookPoint::PreRegister, "gate", move |event: HookEvent| {
            let seen = seen.clone();
            async move {
                *seen.lock() = Some(event.session.state());
                HookDecision::reject("closed for maintenance")
            }
        });
    }

    let (session, _rx) = fx.accept().await;
    let err = fx.bridge.subscribe(&session, "news").await.unwrap_err();

    assert_eq!(
        err,
        BridgeError::RegistrationRejected {
            address: "news".into(),
            reason: "closed for maintenance".into(),
        }
    );
    assert_eq!(*seen.lock(), Some(SessionState::Registering));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(fx.count(HookPoint::PostRegister), 0);
    assert_eq!(fx.count(HookPoint::SocketClosed), 1);
    assert_eq!(fx.bus.handler_count("news"), 0);
}

#[tokio::test]
async fn test_authorise_denies_secret_topic() {
    let fx = Fixture::new();
    fx.hooks.register(HookPoint::Authorise, "acl", |event: HookEvent| async move {
        if event.address.as_deref() == Some("secret.topic") {
            HookDecision::reject("forbidden")
        } else {
            HookDecision::Allow
        }
    });

    let (session, mut rx) = fx.accept().await;
    assert_eq!(
        fx.bridge.subscribe(&session, "secret.topic").await,
        Err(BridgeError::NotAuthorised("secret.topic".into()))
    );
    assert_eq!(session.state(), SessionState::Created);
    assert_eq!(fx.count(HookPoint::PreRegister), 0);

    assert_eq!(fx.bridge.publish("secret.topic", &b"\"classified\""[..]), 0);
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());

    fx.bridge.subscribe(&session, "news").await.unwrap();
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn test_unregister_twice_is_noop() {
    let fx = Fixture::new();
    let (session, _rx) = fx.accept().await;
    fx.bridge.subscribe(&session, "news").await.unwrap();

    fx.bridge.unregister(&session).await.unwrap();
    fx.bridge.unregister(&session).await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);

    assert_eq!(fx.count(HookPoint::Unregister), 1);
    assert_eq!(fx.count(HookPoint::SocketClosed), 1);
}

#[tokio::test]
async fn test_unregister_veto_keeps_session_active() {
    let fx = Fixture::new();
    fx.hooks.register(HookPoint::Unregister, "sticky", |_event: HookEvent| async {
        HookDecision::reject("stay")
    });

    let (session, _rx) = fx.accept().await;
    fx.bridge.subscribe(&session, "news").await.unwrap();

    assert_eq!(
        fx.bridge.unregister(&session).await,
        Err(BridgeError::Rejected("stay".into()))
    );
    assert_eq!(session.state(), SessionState::Active);
    assert!(session.is_subscribed("news"));
    assert_eq!(fx.count(HookPoint::SocketClosed), 0);
}

#[tokio::test]
async fn test_send_or_pub_modifies_outbound() {
    let fx = Fixture::new();
    fx.hooks.register(HookPoint::SendOrPub, "upper", |event: HookEvent| async move {
        if event.inbound {
            return HookDecision::Allow;
        }
        let body = event.body.unwrap_or_default();
        HookDecision::Modify(String::from_utf8_lossy(&body).to_uppercase().into_bytes().into())
    });

    let (session, mut rx) = fx.accept().await;
    fx.bridge.subscribe(&session, "news").await.unwrap();
    fx.bridge.publish("news", &b"\"hello\""[..]);

    match next_frame(&mut rx).await {
        ServerFrame::Message { body, .. } => assert_eq!(body, json!("HELLO")),
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn test_client_send_reaches_bus_and_reply_returns() {
    let fx = Fixture::new();
    let bus = fx.bus.clone();
    fx.bus.register("echo.service", move |message: BusMessage| {
        bus.reply(&message, message.body.clone());
    });

    let (session, mut rx) = fx.accept().await;
    fx.bridge
        .handle_frame(
            &session,
            serde_json::from_value(json!({
                "type": "send",
                "address": "echo.service",
                "body": {"ping": true},
                "reply_address": "my.reply"
            }))
            .unwrap(),
        )
        .await
        .unwrap();

    match next_frame(&mut rx).await {
        ServerFrame::Message { address, body, .. } => {
            assert_eq!(address, "my.reply");
            assert_eq!(body, json!({"ping": true}));
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn test_socket_created_veto_destroys_session() {
    let fx = Fixture::new();
    fx.hooks.register(HookPoint::SocketCreated, "bouncer", |_event: HookEvent| async {
        HookDecision::reject("no")
    });

    let (tx, _rx) = mpsc::channel(8);
    let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
    let err = fx.bridge.accept(peer, tx).await.unwrap_err();

    assert_eq!(err, BridgeError::Rejected("no".into()));
    assert_eq!(fx.bridge.session_count(), 0);
    assert_eq!(fx.count(HookPoint::PreRegister), 0);
    assert_eq!(fx.count(HookPoint::SocketClosed), 1);
}

#[tokio::test]
async fn test_hooks_run_on_session_context() {
    let fx = Fixture::new();
    let seen: Arc<Mutex<Vec<(HookPoint, Option<ContextId>)>>> = Arc::new(Mutex::new(Vec::new()));
    for hook in HookPoint::ALL {
        let seen = seen.clone();
        fx.hooks.register(hook, "where", move |event: HookEvent| {
            let seen = seen.clone();
            async move {
                seen.lock().push((event.hook, current_context().map(|c| c.id())));
                HookDecision::Allow
            }
        });
    }

    let (session, mut rx) = fx.accept().await;
    fx.bridge.subscribe(&session, "news").await.unwrap();
    fx.bridge.publish("news", &b"1"[..]);
    next_frame(&mut rx).await;
    fx.bridge.unregister(&session).await.unwrap();

    let seen = seen.lock();
    for hook in HookPoint::ALL {
        assert!(seen.iter().any(|(h, _)| *h == hook), "{hook} never fired");
    }
    let expected = Some(session.context().id());
    for (hook, context) in seen.iter() {
        assert_eq!(*context, expected, "{hook} ran off the session context");
    }
}

#[tokio::test]
async fn test_outbound_veto_is_counted() {
    let fx = Fixture::new();
    fx.hooks.register(HookPoint::SendOrPub, "mute", |event: HookEvent| async move {
        if event.inbound {
            HookDecision::Allow
        } else {
            HookDecision::reject("muted")
        }
    });

    let (session, mut rx) = fx.accept().await;
    fx.bridge.subscribe(&session, "news").await.unwrap();
    assert_eq!(fx.bridge.publish("news", &b"1"[..]), 1);

    wait_until(|| fx.bridge.dropped_deliveries() == 1).await;
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_pending_request_ends_with_session() {
    let fx = Fixture::new();
    fx.bus.register("slow.service", |_message: BusMessage| {});
    assert_eq!(fx.bus.address_count(), 1);

    let (session, _rx) = fx.accept().await;
    fx.bridge
        .handle_frame(
            &session,
            serde_json::from_value(json!({
                "type": "send",
                "address": "slow.service",
                "body": null,
                "reply_address": "my.reply"
            }))
            .unwrap(),
        )
        .await
        .unwrap();

    // Generated reply address registered while the request is pending
    wait_until(|| fx.bus.address_count() == 2).await;

    fx.bridge.close(&session, "client gone").await;

    // Released well before the one second reply timeout
    tokio::time::timeout(Duration::from_millis(500), async {
        while fx.bus.address_count() > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("request outlived its session");
}

// ============================================================================
// WebSocket transport
// ============================================================================

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_listener(bridge: Arc<BusBridge>) -> (SocketAddr, CancellationToken) {
    let listener = WebSocketListener::bind("127.0.0.1:0".parse().unwrap(), "/eventbus", bridge)
        .await
        .unwrap();
    let addr = listener.local_addr();
    let token = CancellationToken::new();
    tokio::spawn(listener.serve(token.clone()));
    (addr, token)
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/eventbus"))
        .await
        .unwrap();
    ws
}

async fn send_json(ws: &mut Client, value: serde_json::Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn recv_frame(ws: &mut Client) -> ServerFrame {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_websocket_session_round_trip() {
    let fx = Fixture::new();
    let (addr, token) = start_listener(fx.bridge.clone()).await;
    let mut ws = connect(addr).await;

    send_json(&mut ws, json!({"type": "register", "address": "news"})).await;
    send_json(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(recv_frame(&mut ws).await, ServerFrame::Pong);
    assert_eq!(fx.bridge.session_count(), 1);

    fx.bridge.publish("news", encode_body(&json!({"headline": "hi"})));
    assert_eq!(
        recv_frame(&mut ws).await,
        ServerFrame::Message {
            address: "news".into(),
            body: json!({"headline": "hi"}),
            reply_address: None,
        }
    );

    // Published by the client, delivered back to its own subscription
    send_json(&mut ws, json!({"type": "publish", "address": "news", "body": "mine"})).await;
    assert_eq!(
        recv_frame(&mut ws).await,
        ServerFrame::Message {
            address: "news".into(),
            body: json!("mine"),
            reply_address: None,
        }
    );

    ws.send(Message::text("not json")).await.unwrap();
    match recv_frame(&mut ws).await {
        ServerFrame::Err { code, .. } => assert_eq!(code, "invalid_frame"),
        other => panic!("unexpected frame {other:?}"),
    }

    ws.close(None).await.unwrap();
    wait_until(|| fx.count(HookPoint::SocketClosed) == 1).await;
    assert_eq!(fx.bridge.session_count(), 0);
    assert_eq!(fx.bus.handler_count("news"), 0);

    token.cancel();
}

#[tokio::test]
async fn test_websocket_reports_authorise_denial() {
    let fx = Fixture::new();
    fx.hooks.register(HookPoint::Authorise, "acl", |event: HookEvent| async move {
        if event.address.as_deref() == Some("secret.topic") {
            HookDecision::reject("forbidden")
        } else {
            HookDecision::Allow
        }
    });
    let (addr, token) = start_listener(fx.bridge.clone()).await;
    let mut ws = connect(addr).await;

    send_json(&mut ws, json!({"type": "register", "address": "secret.topic"})).await;
    assert_eq!(
        recv_frame(&mut ws).await,
        ServerFrame::Err {
            code: "not_authorised".into(),
            message: "not authorised for address secret.topic".into(),
            address: Some("secret.topic".into()),
        }
    );

    token.cancel();
}

#[tokio::test]
async fn test_server_close_ends_websocket() {
    let fx = Fixture::new();
    let (addr, token) = start_listener(fx.bridge.clone()).await;
    let mut ws = connect(addr).await;

    send_json(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(recv_frame(&mut ws).await, ServerFrame::Pong);

    assert_eq!(fx.bridge.close_all("shutdown").await, 1);

    let closed = tokio::time::timeout(WAIT, async {
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Close(_) = message {
                return true;
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);
    assert_eq!(fx.count(HookPoint::SocketClosed), 1);

    token.cancel();
}
