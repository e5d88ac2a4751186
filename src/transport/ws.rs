use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::TransportEvent;
use crate::config::SignalingConfig;
use crate::error::SignalError;
use crate::protocol::SignalMessage;

/// WebSocket connection to a relay endpoint, with capped exponential
/// reconnection.
pub struct WebSocketTransport {
    shared: Arc<WsShared>,
}

struct WsShared {
    config: SignalingConfig,
    /// true between a successful connect() and disconnect()/give-up;
    /// covers the reconnecting window, unlike `connected`
    active: AtomicBool,
    connected: AtomicBool,
    /// bumped by disconnect() so a pending backoff timer is abandoned
    generation: AtomicU64,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events_tx: async_channel::Sender<TransportEvent>,
    events_rx: Mutex<Option<async_channel::Receiver<TransportEvent>>>,
}

impl WebSocketTransport {
    pub fn new(config: SignalingConfig) -> Self {
        let (events_tx, events_rx) = async_channel::unbounded();
        Self {
            shared: Arc::new(WsShared {
                config,
                active: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                writer: Mutex::new(None),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.config.endpoint
    }
}

impl super::Transport for WebSocketTransport {
    async fn connect(&self) -> Result<(), SignalError> {
        // already connected, or a reconnect supervisor owns the socket
        if self.shared.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        dial(self.shared.clone()).await?;
        self.shared.active.store(true, Ordering::SeqCst);
        let _ = self.shared.events_tx.send(TransportEvent::Opened).await;
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.shared.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        let writer = self.shared.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(writer) = writer {
            let _ = writer.send(Message::Close(None));
        }
        let _ = self.shared.events_tx.send(TransportEvent::Closed).await;
        info!("websocket disconnected: {}", self.shared.config.endpoint);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn send(&self, message: SignalMessage) -> Result<(), SignalError> {
        let json = serde_json::to_string(&message)?;
        let writer = self.shared.writer.lock().unwrap_or_else(|e| e.into_inner());
        match writer.as_ref() {
            Some(tx) => tx
                .send(Message::Text(json.into()))
                .map_err(|_| SignalError::Closed),
            None => Err(SignalError::NotConnected),
        }
    }

    fn take_events(&self) -> Option<async_channel::Receiver<TransportEvent>> {
        self.shared
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// Open the socket, install the writer, spawn the read loop.
///
/// Returns a boxed future so the recursive reconnect cycle
/// (`dial` -> `read_loop` -> `supervise_reconnect` -> `dial`) has a
/// concrete `Send` type boundary and the compiler can resolve auto traits.
fn dial(
    shared: Arc<WsShared>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SignalError>> + Send>> {
    Box::pin(dial_inner(shared))
}

async fn dial_inner(shared: Arc<WsShared>) -> Result<(), SignalError> {
    let connect_timeout = shared.config.connect_timeout;
    let ws_stream = timeout(
        connect_timeout,
        tokio_tungstenite::connect_async(shared.config.endpoint.as_str()),
    )
    .await
    .map_err(|_| SignalError::ConnectTimeout(connect_timeout))?
    .map_err(|e| SignalError::Connect(e.to_string()))?
    .0;

    let (mut ws_tx, ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    *shared.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx.clone());
    shared.connected.store(true, Ordering::SeqCst);
    info!("websocket connected: {}", shared.config.endpoint);

    let generation = shared.generation.load(Ordering::SeqCst);
    tokio::spawn(read_loop(shared, ws_rx, tx, generation));
    Ok(())
}

async fn read_loop<S>(
    shared: Arc<WsShared>,
    mut ws_rx: S,
    writer: mpsc::UnboundedSender<Message>,
    generation: u64,
) where
    S: futures_util::Stream<
            Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
        > + Unpin
        + Send,
{
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                Ok(message) => {
                    let _ = shared.events_tx.send(TransportEvent::Message(message)).await;
                }
                Err(e) => warn!("unparseable signaling message dropped: {}", e),
            },
            Ok(Message::Ping(payload)) => {
                let _ = writer.send(Message::Pong(payload));
            }
            Ok(Message::Close(_)) => {
                debug!("close frame received");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("websocket error: {}", e);
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    shared.writer.lock().unwrap_or_else(|e| e.into_inner()).take();

    if shared.generation.load(Ordering::SeqCst) != generation {
        // orderly local close; disconnect() already emitted Closed
        return;
    }
    warn!("websocket closed unexpectedly, starting reconnection");
    supervise_reconnect(shared, generation).await;
}

/// Retry with `base * 2^(attempt-1)` delays up to the configured cap.
/// The attempt after the cap is never scheduled.
async fn supervise_reconnect(shared: Arc<WsShared>, generation: u64) {
    let max_attempts = shared.config.max_reconnect_attempts;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if attempt > max_attempts {
            shared.active.store(false, Ordering::SeqCst);
            let _ = shared
                .events_tx
                .send(TransportEvent::GaveUp {
                    reason: format!("gave up after {} reconnect attempts", max_attempts),
                })
                .await;
            return;
        }
        let _ = shared
            .events_tx
            .send(TransportEvent::Reconnecting { attempt })
            .await;
        tokio::time::sleep(shared.config.backoff_delay(attempt)).await;

        if shared.generation.load(Ordering::SeqCst) != generation {
            debug!("reconnect cancelled by disconnect");
            return;
        }
        match dial(shared.clone()).await {
            Ok(()) => {
                info!("reconnected after {} attempt(s)", attempt);
                let _ = shared.events_tx.send(TransportEvent::Reopened).await;
                return;
            }
            Err(e) => warn!("reconnect attempt {} failed: {}", attempt, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn test_config(endpoint: String) -> SignalingConfig {
        SignalingConfig {
            endpoint,
            max_reconnect_attempts: 2,
            base_backoff: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(2),
            ..SignalingConfig::default()
        }
    }

    async fn next_event(rx: &async_channel::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn send_before_connect_is_rejected() {
        let transport = WebSocketTransport::new(test_config("ws://127.0.0.1:9".into()));
        let result = transport.send(SignalMessage::join_room("r1"));
        assert!(matches!(result, Err(SignalError::NotConnected)));
    }

    #[tokio::test]
    async fn events_can_only_be_taken_once() {
        let transport = WebSocketTransport::new(test_config("ws://127.0.0.1:9".into()));
        assert!(transport.take_events().is_some());
        assert!(transport.take_events().is_none());
    }

    #[tokio::test]
    async fn connect_exchanges_messages_with_a_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            // first client frame must be the join
            let frame = ws.next().await.unwrap().unwrap();
            let text = match frame {
                Message::Text(t) => t.to_string(),
                other => panic!("expected text frame, got {other:?}"),
            };
            let msg: SignalMessage = serde_json::from_str(&text).unwrap();
            assert_eq!(msg.kind, crate::protocol::SignalKind::JoinRoom);

            let reply = serde_json::to_string(&SignalMessage::user_joined("peer_b")).unwrap();
            ws.send(Message::Text(reply.into())).await.unwrap();
            ws.next().await; // hold the socket open until the client closes
        });

        let transport = WebSocketTransport::new(test_config(format!("ws://{}", addr)));
        let events = transport.take_events().unwrap();

        transport.connect().await.unwrap();
        assert!(matches!(next_event(&events).await, TransportEvent::Opened));
        assert!(transport.is_connected());

        transport.send(SignalMessage::join_room("r1")).unwrap();

        match next_event(&events).await {
            TransportEvent::Message(msg) => {
                assert_eq!(msg.participant_id.as_deref(), Some("peer_b"));
            }
            other => panic!("expected message, got {other:?}"),
        }

        transport.disconnect().await;
        assert!(matches!(next_event(&events).await, TransportEvent::Closed));
        server.abort();
    }

    #[tokio::test]
    async fn unexpected_close_retries_then_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.close(None).await;
            drop(listener); // refuse every redial
        });

        let transport = WebSocketTransport::new(test_config(format!("ws://{}", addr)));
        let events = transport.take_events().unwrap();
        transport.connect().await.unwrap();
        assert!(matches!(next_event(&events).await, TransportEvent::Opened));

        assert!(matches!(
            next_event(&events).await,
            TransportEvent::Reconnecting { attempt: 1 }
        ));
        assert!(matches!(
            next_event(&events).await,
            TransportEvent::Reconnecting { attempt: 2 }
        ));
        match next_event(&events).await {
            TransportEvent::GaveUp { reason } => assert!(reason.contains("2")),
            other => panic!("expected GaveUp, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_cancels_a_pending_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.close(None).await;
        });

        let config = SignalingConfig {
            base_backoff: Duration::from_secs(30),
            ..test_config(format!("ws://{}", addr))
        };
        let transport = WebSocketTransport::new(config);
        let events = transport.take_events().unwrap();
        transport.connect().await.unwrap();
        assert!(matches!(next_event(&events).await, TransportEvent::Opened));
        assert!(matches!(
            next_event(&events).await,
            TransportEvent::Reconnecting { attempt: 1 }
        ));

        transport.disconnect().await;
        assert!(matches!(next_event(&events).await, TransportEvent::Closed));
        assert!(!transport.is_connected());
    }
}
