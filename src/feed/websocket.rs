//! WebSocket change feed
//!
//! Connects to a realtime endpoint, sends one subscribe frame per channel and
//! relays change and status frames. Frames may be JSON text or MessagePack
//! binary; a few envelope shapes are accepted.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ChangeFeed, FeedChannel, FeedMessage, FeedStatus};
use crate::model::RawChange;
use crate::subscription::SubscriptionKey;
use crate::types::{Result, SyncError};

/// WebSocket feed configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Realtime endpoint URL
    pub url: String,
    /// Database schema the topics live in
    pub schema: String,
    /// Ping interval for keepalive
    pub ping_interval: Duration,
    /// Timeout for the TCP/WebSocket handshake
    pub connect_timeout: Duration,
    /// Messages buffered between the socket task and the subscriber
    pub buffer_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:4000/realtime".to_string(),
            schema: "public".to_string(),
            ping_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            buffer_size: 1000,
        }
    }
}

/// Subscribe frame sent after connecting
#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    topic: &'a str,
    schema: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
    client_id: Uuid,
}

/// [`ChangeFeed`] over tokio-tungstenite
pub struct WebSocketFeed {
    config: WebSocketConfig,
    client_id: Uuid,
}

impl WebSocketFeed {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            client_id: Uuid::new_v4(),
        }
    }
}

#[async_trait]
impl ChangeFeed for WebSocketFeed {
    async fn open(&self, key: &SubscriptionKey) -> Result<FeedChannel> {
        let (ws_stream, _) = tokio::time::timeout(self.config.connect_timeout, connect_async(&self.config.url))
            .await
            .map_err(|_| SyncError::Transport(format!("connect to {} timed out", self.config.url)))??;

        let (mut write, read) = ws_stream.split();

        let frame = SubscribeFrame {
            kind: "subscribe",
            topic: &key.topic,
            schema: &self.config.schema,
            filter: key.filter.to_feed_filter(),
            client_id: self.client_id,
        };
        write.send(Message::Text(serde_json::to_string(&frame)?)).await?;

        info!(%key, url = %self.config.url, "Feed channel connected");

        let (tx, rx) = mpsc::channel(self.config.buffer_size);
        let (close_tx, close_rx) = oneshot::channel();
        tokio::spawn(pump(write, read, tx, close_rx, self.config.ping_interval, key.clone()));

        Ok(FeedChannel::with_close_signal(rx, close_tx))
    }
}

/// Relay socket frames to the subscriber until either side goes away
async fn pump<W, R>(
    mut write: W,
    mut read: R,
    tx: mpsc::Sender<FeedMessage>,
    mut close_rx: oneshot::Receiver<()>,
    ping_every: Duration,
    key: SubscriptionKey,
) where
    W: futures_util::Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
    R: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut ping_interval = tokio::time::interval(ping_every);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            // Fires on explicit close and when the FeedChannel is dropped
            _ = &mut close_rx => {
                debug!(%key, "Closing feed channel");
                let _ = write.close().await;
                return;
            }

            _ = ping_interval.tick() => {
                if let Err(e) = write.send(Message::Ping(vec![])).await {
                    warn!(%key, error = %e, "Ping failed");
                    let _ = tx.send(FeedMessage::Status(FeedStatus::ChannelError)).await;
                    return;
                }
            }

            msg = read.next() => {
                let decoded = match msg {
                    Some(Ok(Message::Text(text))) => decode_text(&text),
                    Some(Ok(Message::Binary(data))) => decode_binary(&data),
                    Some(Ok(Message::Pong(_))) => {
                        debug!(%key, "Received pong");
                        continue;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(%key, "Server closed feed channel");
                        let _ = tx.send(FeedMessage::Status(FeedStatus::Closed)).await;
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(%key, error = %e, "Feed socket error");
                        let _ = tx.send(FeedMessage::Status(FeedStatus::ChannelError)).await;
                        return;
                    }
                    None => {
                        warn!(%key, "Feed socket ended");
                        return;
                    }
                };

                if let Some(message) = decoded {
                    if tx.send(message).await.is_err() {
                        let _ = write.close().await;
                        return;
                    }
                }
            }
        }
    }
}

fn decode_text(text: &str) -> Option<FeedMessage> {
    match serde_json::from_str::<JsonValue>(text) {
        Ok(value) => decode_frame(&value),
        Err(e) => {
            debug!("Failed to parse feed frame as JSON: {}", e);
            None
        }
    }
}

fn decode_binary(data: &[u8]) -> Option<FeedMessage> {
    match rmp_serde::from_slice::<JsonValue>(data) {
        Ok(value) => decode_frame(&value),
        Err(e) => {
            debug!("Failed to decode msgpack frame: {}", e);
            std::str::from_utf8(data).ok().and_then(decode_text)
        }
    }
}

/// Interpret one decoded frame.
///
/// Accepted shapes:
/// - `{"type": "status", "status": "SUBSCRIBED"}`
/// - `{"type": "change", "payload": <change>}`
/// - `{"payload": {"data": <change>}}`
/// - a bare change record
pub(crate) fn decode_frame(value: &JsonValue) -> Option<FeedMessage> {
    if value.get("type").and_then(|t| t.as_str()) == Some("status") {
        let status = value.get("status").and_then(|s| s.as_str())?;
        return match status.parse::<FeedStatus>() {
            Ok(status) => Some(FeedMessage::Status(status)),
            Err(e) => {
                debug!("{}", e);
                None
            }
        };
    }

    if value.get("event_type").is_some() {
        if let Ok(change) = serde_json::from_value::<RawChange>(value.clone()) {
            return Some(FeedMessage::Change(change));
        }
    }

    if let Some(payload) = value.get("payload") {
        if let Some(data) = payload.get("data") {
            return decode_frame(data);
        }
        return decode_frame(payload);
    }

    debug!("Unrecognized feed frame: {}", value);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.schema, "public");
        assert_eq!(config.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_decode_status_frame() {
        let frame = json!({ "type": "status", "status": "CHANNEL_ERROR" });
        assert!(matches!(
            decode_frame(&frame),
            Some(FeedMessage::Status(FeedStatus::ChannelError))
        ));
    }

    #[test]
    fn test_decode_change_envelopes() {
        let change = json!({
            "event_type": "INSERT",
            "schema": "public",
            "table": "properties",
            "old": null,
            "new": { "id": "a", "version": 1 }
        });

        for frame in [
            change.clone(),
            json!({ "type": "change", "payload": change.clone() }),
            json!({ "event": "postgres_changes", "payload": { "data": change.clone() } }),
        ] {
            match decode_frame(&frame) {
                Some(FeedMessage::Change(raw)) => assert_eq!(raw.table, "properties"),
                other => panic!("expected change from {}, got {:?}", frame, other),
            }
        }
    }

    #[test]
    fn test_decode_msgpack_frame() {
        let frame = json!({ "type": "status", "status": "SUBSCRIBED" });
        let bytes = rmp_serde::to_vec_named(&frame).unwrap();
        assert!(matches!(
            decode_binary(&bytes),
            Some(FeedMessage::Status(FeedStatus::Subscribed))
        ));
    }

    #[test]
    fn test_unknown_frames_are_ignored() {
        assert!(decode_frame(&json!({ "hello": "world" })).is_none());
        assert!(decode_text("not json").is_none());
        assert!(decode_frame(&json!({ "type": "status", "status": "WAT" })).is_none());
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let key = SubscriptionKey::entity("properties", "p1");
        let frame = SubscribeFrame {
            kind: "subscribe",
            topic: &key.topic,
            schema: "public",
            filter: key.filter.to_feed_filter(),
            client_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["filter"], "id=eq.p1");
    }
}
