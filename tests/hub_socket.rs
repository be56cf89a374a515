//! Live-socket tests for the hub uplink: heartbeat emission, reconnect after
//! an unintentional close, and suppression after a deliberate disconnect.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use cluster_hub::config::HubConfig;
use cluster_hub::hub::{FrameSink, HubClient};
use cluster_hub::types::{ChatPayload, MessageType, WsMessage};

/// Minimal hub: accepts WebSocket connections and forwards every parsed
/// frame, tagged with the 1-based connection number. The first connection is
/// dropped after its first frame to force a reconnect.
async fn start_flaky_hub() -> (String, mpsc::UnboundedReceiver<(usize, WsMessage)>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut conn_no = 0usize;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            conn_no += 1;
            let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    if let Ok(frame) = serde_json::from_str::<WsMessage>(&text) {
                        let _ = frame_tx.send((conn_no, frame));
                        // Kill the first connection after one frame.
                        if conn_no == 1 {
                            break;
                        }
                    }
                }
            }
        }
    });

    (format!("http://{addr}"), frame_rx)
}

async fn next_frame(
    rx: &mut mpsc::UnboundedReceiver<(usize, WsMessage)>,
) -> (usize, WsMessage) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("hub task ended")
}

#[tokio::test]
async fn heartbeats_flow_and_reconnect_resumes_them() {
    let (hub_url, mut frames) = start_flaky_hub().await;
    let config = HubConfig {
        hub_url,
        node_id: Some("self-node".to_string()),
        token: Some("secret token".to_string()),
        heartbeat_interval_ms: 1_000,
        reconnect_interval_ms: 100,
        ..HubConfig::default()
    };
    let (client, _events) = HubClient::new(&config, Arc::new(AtomicUsize::new(0)));

    client.connect().await.unwrap();

    // First connection: the opening heartbeat arrives, stamped with our id.
    let (conn, frame) = next_frame(&mut frames).await;
    assert_eq!(conn, 1);
    assert_eq!(frame.msg_type, MessageType::Heartbeat);
    assert_eq!(frame.from.as_deref(), Some("self-node"));
    assert!(frame.payload.get("load").is_some());
    assert_eq!(frame.payload["activeTasks"], 0);

    // The hub dropped the socket; within a couple of reconnect intervals the
    // client is back and heartbeating on a fresh connection.
    let (conn, frame) = next_frame(&mut frames).await;
    assert_eq!(conn, 2);
    assert_eq!(frame.msg_type, MessageType::Heartbeat);
    assert!(client.is_connected());

    // Outbound frames ride the reconnected socket.
    client
        .send_frame(WsMessage::chat(
            "peer-1",
            &ChatPayload {
                role: "user".to_string(),
                content: Some("hello again".to_string()),
                messages: None,
                config: None,
                reply_to: None,
                timestamp: 0,
                done: None,
            },
        ))
        .await;
    loop {
        let (conn, frame) = next_frame(&mut frames).await;
        if frame.msg_type == MessageType::Chat {
            assert_eq!(conn, 2);
            assert_eq!(frame.to.as_deref(), Some("peer-1"));
            // The sink stamped sender and send time.
            assert_eq!(frame.from.as_deref(), Some("self-node"));
            assert!(frame.timestamp.is_some());
            break;
        }
    }

    // A deliberate disconnect does not re-arm the reconnect timer.
    client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!client.is_connected());
    while let Ok((conn, _)) = frames.try_recv() {
        assert!(conn <= 2, "client reconnected after deliberate disconnect");
    }
}

#[tokio::test]
async fn frames_sent_while_disconnected_are_dropped() {
    let config = HubConfig {
        hub_url: "http://127.0.0.1:1".to_string(),
        node_id: Some("self-node".to_string()),
        token: Some("tok".to_string()),
        ..HubConfig::default()
    };
    let (client, _events) = HubClient::new(&config, Arc::new(AtomicUsize::new(0)));

    // No connection was ever opened; the send is a warn-and-drop no-op.
    client
        .send_frame(WsMessage::new(MessageType::Subscribe, "s1"))
        .await;
    assert!(!client.is_connected());
}
