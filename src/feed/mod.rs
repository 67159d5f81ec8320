//! Change-feed transports
//!
//! A [`ChangeFeed`] opens one underlying channel per subscription key and
//! delivers [`FeedMessage`]s until the channel ends. The subscription manager
//! owns reconnection; transports only report what happened.
//!
//! - [`websocket`]: tokio-tungstenite client for a remote realtime endpoint
//! - [`memory`]: in-process feed for embedding and tests

pub mod memory;
pub mod websocket;

pub use memory::MemoryFeed;
pub use websocket::{WebSocketConfig, WebSocketFeed};

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::model::{Property, RawChange};
use crate::subscription::SubscriptionKey;
use crate::types::{Result, SyncError};

/// Channel status reported by the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Subscribed,
    ChannelError,
    Closed,
    TimedOut,
}

impl FeedStatus {
    /// Whether this status means the channel is gone
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Subscribed)
    }
}

impl FromStr for FeedStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SUBSCRIBED" => Ok(Self::Subscribed),
            "CHANNEL_ERROR" => Ok(Self::ChannelError),
            "CLOSED" => Ok(Self::Closed),
            "TIMED_OUT" => Ok(Self::TimedOut),
            other => Err(SyncError::MalformedEvent(format!("unknown feed status '{}'", other))),
        }
    }
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Subscribed => "SUBSCRIBED",
            Self::ChannelError => "CHANNEL_ERROR",
            Self::Closed => "CLOSED",
            Self::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

/// One message from an open feed channel
#[derive(Debug, Clone)]
pub enum FeedMessage {
    Change(RawChange),
    Status(FeedStatus),
}

/// Receiving half of an open feed channel.
///
/// Dropping it tells the transport to close the underlying connection.
pub struct FeedChannel {
    rx: mpsc::Receiver<FeedMessage>,
    _close: Option<oneshot::Sender<()>>,
}

impl FeedChannel {
    pub fn new(rx: mpsc::Receiver<FeedMessage>) -> Self {
        Self { rx, _close: None }
    }

    /// Channel whose drop fires `close` so the transport task can shut down
    pub fn with_close_signal(rx: mpsc::Receiver<FeedMessage>, close: oneshot::Sender<()>) -> Self {
        Self {
            rx,
            _close: Some(close),
        }
    }

    /// Next message, or `None` once the transport has gone away
    pub async fn recv(&mut self) -> Option<FeedMessage> {
        self.rx.recv().await
    }
}

/// Source of change events for subscription keys
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    /// Open one underlying channel for `key`.
    ///
    /// Errors are transport failures; the caller decides whether to retry.
    async fn open(&self, key: &SubscriptionKey) -> Result<FeedChannel>;
}

/// Full re-fetch collaborator used to seed the cache
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_all(&self, topic: &str) -> Result<Vec<Property>>;
}
