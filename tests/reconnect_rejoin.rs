//! Reconnection re-establishes room membership before consumers see
//! `Connected` again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use parley::{
    SignalEvent, SignalKind, SignalMessage, SignalingClient, SignalingConfig, WebSocketTransport,
};

async fn read_signal(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
) -> SignalMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a client frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("client sent invalid JSON");
        }
    }
}

#[tokio::test]
async fn reconnect_replays_the_room_join_first() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // first connection: receive the join, then die abruptly
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let join = read_signal(&mut ws).await;
        assert_eq!(join.kind, SignalKind::JoinRoom);
        assert_eq!(join.room_id.as_deref(), Some("r1"));
        assert_eq!(join.from.as_deref(), Some("p1"));
        drop(ws);

        // the redialed connection must replay the join before anything
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let replay = read_signal(&mut ws).await;
        assert_eq!(replay.kind, SignalKind::JoinRoom);
        assert_eq!(replay.room_id.as_deref(), Some("r1"));

        let joined = serde_json::to_string(&SignalMessage::user_joined("p2")).unwrap();
        ws.send(Message::Text(joined.into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let config = SignalingConfig {
        endpoint: format!("ws://{}", addr),
        max_reconnect_attempts: 5,
        base_backoff: Duration::from_millis(20),
        connect_timeout: Duration::from_secs(2),
        ..SignalingConfig::default()
    };
    let client = SignalingClient::new(WebSocketTransport::new(config), "p1");

    let events: Arc<Mutex<Vec<SignalEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    client.add_listener(Arc::new(move |event: SignalEvent| {
        sink.lock().unwrap().push(event);
    }));

    client.connect().await.unwrap();
    client.join_room("r1");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        {
            let captured = events.lock().unwrap();
            let connects = captured
                .iter()
                .filter(|e| matches!(e, SignalEvent::Connected))
                .count();
            let reconnecting = captured
                .iter()
                .any(|e| matches!(e, SignalEvent::Reconnecting { attempt: 1 }));
            let rejoined = captured
                .iter()
                .any(|e| matches!(e, SignalEvent::UserJoined { id, .. } if id == "p2"));
            if connects == 2 && reconnecting && rejoined {
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for reconnect cycle; saw {:?}",
            events.lock().unwrap()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // room membership survived the reconnect without caller action
    assert_eq!(client.room_id().as_deref(), Some("r1"));

    client.disconnect().await;
    server.await.unwrap();
}
