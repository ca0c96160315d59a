//! WebSocket acceptor for bridge sessions.
//!
//! Each upgraded connection becomes one [`Session`]. Text or binary frames
//! carry JSON [`ClientFrame`]s; the session's outbound queue is drained into
//! the socket by a writer task.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::bridge::BusBridge;
use crate::session::{ClientFrame, ServerFrame, Session};
use crate::telemetry::counters;

/// Close code sent when the server ends the session (1000 = normal).
const CLOSE_NORMAL: u16 = 1000;

/// WebSocket listener for one bridge.
pub struct WebSocketListener {
    bridge: Arc<BusBridge>,
    prefix: String,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl WebSocketListener {
    /// Bind the listener. The bridge's sessions are served at `prefix`.
    pub async fn bind(address: SocketAddr, prefix: &str, bridge: Arc<BusBridge>) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            bridge,
            prefix: prefix.to_string(),
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn bridge(&self) -> &Arc<BusBridge> {
        &self.bridge
    }

    /// Serve connections until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> io::Result<()> {
        info!(
            bridge = %self.bridge.name(),
            address = %self.local_addr,
            prefix = %self.prefix,
            max_sessions = self.bridge.limits().max_sessions,
            "websocket listener started"
        );

        let name = self.bridge.name().to_string();
        let app = Router::new()
            .route(&self.prefix, get(upgrade))
            .with_state(self.bridge);

        axum::serve(self.listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!(bridge = %name, "websocket listener stopped");
        Ok(())
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(bridge): State<Arc<BusBridge>>,
) -> Response {
    let limits = bridge.limits();
    if bridge.session_count() >= limits.max_sessions {
        warn!(bridge = %bridge.name(), %peer, "session limit reached, refusing upgrade");
        counters::session_rejected(bridge.name(), "session_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(limits.max_frame_size)
        .on_upgrade(move |socket| handle_socket(bridge, socket, peer))
}

async fn handle_socket(bridge: Arc<BusBridge>, mut socket: WebSocket, peer: SocketAddr) {
    let (sink, frames) = mpsc::channel(bridge.limits().outbound_queue.max(1));

    let session = match bridge.accept(peer, sink).await {
        Ok(session) => session,
        Err(e) => {
            debug!(bridge = %bridge.name(), %peer, error = %e, "session refused");
            let frame = ServerFrame::error(e.code(), e.to_string(), None);
            let _ = send_frame(&mut socket, &frame).await;
            let _ = socket.send(close_message(&e.to_string())).await;
            return;
        }
    };

    let span = info_span!("ws", bridge = %bridge.name(), session = %session.id(), %peer);

    async move {
        info!("session opened");

        let (tx, rx) = socket.split();
        let done = CancellationToken::new();
        let writer = tokio::spawn(write_loop(tx, frames, done.clone(), session.clone()).in_current_span());

        let reason = read_loop(&bridge, &session, rx).await;
        bridge.close(&session, reason).await;

        done.cancel();
        if let Err(e) = writer.await {
            warn!(error = %e, "websocket writer failed");
        }
        debug!(reason = %session.close_reason().unwrap_or_default(), "connection finished");
    }
    .instrument(span)
    .await
}

/// Pump client frames into the bridge until the connection or the session
/// ends. Returns the close reason.
async fn read_loop(bridge: &Arc<BusBridge>, session: &Arc<Session>, mut rx: SplitStream<WebSocket>) -> &'static str {
    let idle = bridge.limits().idle_timeout;

    loop {
        let next = tokio::select! {
            biased;
            _ = session.closed() => return "session closed",
            next = next_message(&mut rx, idle) => next,
        };

        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "websocket read failed");
                return "transport error";
            }
            Ok(None) => return "client disconnected",
            Err(_) => {
                debug!(idle_ms = idle.as_millis() as u64, "idle timeout");
                return "idle timeout";
            }
        };

        let parsed = match message {
            Message::Text(text) => serde_json::from_str::<ClientFrame>(text.as_str()),
            Message::Binary(data) => serde_json::from_slice::<ClientFrame>(&data),
            Message::Close(_) => return "client closed",
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match parsed {
            Ok(frame) => bridge.dispatch(session, frame).await,
            Err(e) => {
                debug!(error = %e, "invalid client frame");
                session.deliver(ServerFrame::error("invalid_frame", e.to_string(), None));
            }
        }
    }
}

async fn next_message(
    rx: &mut SplitStream<WebSocket>,
    idle: Duration,
) -> Result<Option<Result<Message, axum::Error>>, tokio::time::error::Elapsed> {
    if idle.is_zero() {
        Ok(rx.next().await)
    } else {
        tokio::time::timeout(idle, rx.next()).await
    }
}

/// Drain the session's outbound queue into the socket. Once `done` fires the
/// remaining frames are flushed and the socket is closed.
async fn write_loop(
    mut tx: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<ServerFrame>,
    done: CancellationToken,
    session: Arc<Session>,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = send_frame(&mut tx, &frame).await {
                        debug!(error = %e, "websocket write failed");
                        return;
                    }
                }
                None => break,
            },
            _ = done.cancelled() => {
                while let Ok(frame) = frames.try_recv() {
                    if send_frame(&mut tx, &frame).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }

    let reason = session.close_reason().unwrap_or_default();
    let _ = tx.send(close_message(&reason)).await;
}

async fn send_frame<S>(tx: &mut S, frame: &ServerFrame) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(frame) {
        Ok(json) => tx.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "failed to encode server frame");
            Ok(())
        }
    }
}

fn close_message(reason: &str) -> Message {
    // Close reasons are limited to 123 bytes.
    let mut end = reason.len().min(123);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    Message::Close(Some(CloseFrame {
        code: CLOSE_NORMAL,
        reason: reason[..end].to_string().into(),
    }))
}
