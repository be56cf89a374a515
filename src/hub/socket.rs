//! The uplink connection task.
//!
//! One spawned task owns the socket for the client's whole lifetime: an outer
//! loop connects, runs the session, and on unintentional close sleeps the
//! fixed reconnect interval and tries again. The outer loop *is* the
//! reconnect timer — it is armed exactly once, and a deliberate
//! `disconnect()` breaks it via the `intentionally_closed` flag.
//!
//! While connected, a single `select!` multiplexes three directions:
//! outbound frames queued by [`FrameSink`](super::FrameSink), inbound frames
//! off the socket, and the heartbeat interval.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{HubError, HubResult};
use crate::types::{now_ms, WsMessage};

use super::client::{ClientInner, HubEvent};

/// Outer connect/reconnect loop; exits only on deliberate disconnect.
pub(crate) async fn run(inner: Arc<ClientInner>) {
    loop {
        if inner.intentionally_closed.load(Ordering::Acquire) {
            break;
        }

        match session(&inner).await {
            Ok(()) => info!("hub connection closed"),
            Err(e) => warn!(error = %e, "hub connection failed"),
        }

        if inner.intentionally_closed.load(Ordering::Acquire) {
            break;
        }
        debug!(delay = ?inner.reconnect_interval, "reconnecting to hub");
        tokio::time::sleep(inner.reconnect_interval).await;
    }

    let mut conn = inner.conn.lock().await;
    conn.outbound = None;
    conn.running = false;
}

/// Build `wss://<hub>/ws?token=<token>` from the HTTP base URL.
fn ws_url(base_url: &str, token: &str) -> HubResult<String> {
    let mut url = url::Url::parse(base_url)
        .map_err(|e| HubError::transport(format!("bad hub URL `{base_url}`: {e}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| HubError::transport(format!("bad hub URL scheme in `{base_url}`")))?;
    url.set_path("/ws");
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url.to_string())
}

/// One connected session: open the socket, pump frames until it closes.
async fn session(inner: &Arc<ClientInner>) -> HubResult<()> {
    let (token, node_id) = {
        let identity = inner.identity.read().await;
        match identity.token.clone() {
            Some(token) => (token, identity.node_id.clone()),
            None => return Err(HubError::NotRegistered),
        }
    };

    let url = ws_url(&inner.base_url, &token)?;
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| HubError::transport(format!("hub connect: {e}")))?;
    let (mut sink, mut stream) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    {
        let mut conn = inner.conn.lock().await;
        conn.outbound = Some(tx);
    }
    inner.connected.store(true, Ordering::Release);
    let _ = inner.events.send(HubEvent::Connected);
    info!("connected to hub");

    let mut heartbeat = tokio::time::interval(inner.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval fires immediately; the first heartbeat doubles as a hello.

    let outcome = loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(msg) => {
                    if let Err(e) = send(&mut sink, &msg).await {
                        break Err(e);
                    }
                }
                // Sender dropped by disconnect(): clean exit.
                None => break Ok(()),
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<WsMessage>(&text) {
                        Ok(msg) => inner.dispatch_frame(msg),
                        Err(e) => debug!(error = %e, "unparseable hub frame, dropped"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(HubError::transport(format!("hub recv: {e}"))),
            },
            _ = heartbeat.tick() => {
                let mut frame = WsMessage::heartbeat(
                    0.0,
                    inner.active_tasks.load(Ordering::Acquire),
                );
                frame.from = node_id.clone();
                frame.timestamp = Some(now_ms());
                if let Err(e) = send(&mut sink, &frame).await {
                    break Err(e);
                }
            }
        }
    };

    {
        let mut conn = inner.conn.lock().await;
        conn.outbound = None;
    }
    inner.connected.store(false, Ordering::Release);
    let _ = inner.events.send(HubEvent::Disconnected);
    outcome
}

async fn send<S>(sink: &mut S, msg: &WsMessage) -> HubResult<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(msg)?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| HubError::transport(format!("hub send: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_upgrades_scheme_and_encodes_token() {
        let url = ws_url("https://hub.example.com", "a b+c").unwrap();
        assert_eq!(url, "wss://hub.example.com/ws?token=a+b%2Bc");

        let plain = ws_url("http://127.0.0.1:8080", "tok").unwrap();
        assert_eq!(plain, "ws://127.0.0.1:8080/ws?token=tok");
    }

    #[test]
    fn ws_url_rejects_garbage() {
        assert!(ws_url("not a url", "tok").is_err());
    }
}
