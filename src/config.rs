//! Configuration for listing-sync
//!
//! CLI arguments and environment variable handling using clap.

use std::time::Duration;

use clap::{Args as ClapArgs, Parser};

use crate::cache::CacheConfig;
use crate::feed::WebSocketConfig;
use crate::notify::NotificationConfig;
use crate::subscription::{BackoffPolicy, ManagerConfig};

/// listing-sync - live property listings from a realtime change feed
#[derive(Parser, Debug, Clone)]
#[command(name = "listing-sync")]
#[command(about = "Keeps a reconciled listing cache and notification queue in sync with a change feed")]
pub struct Args {
    /// Realtime change-feed WebSocket URL
    #[arg(long, env = "FEED_URL", default_value = "ws://localhost:4000/realtime")]
    pub feed_url: String,

    /// Topic (table) to follow
    #[arg(long, env = "TOPIC", default_value = "properties")]
    pub topic: String,

    /// Database schema the topic lives in
    #[arg(long, env = "FEED_SCHEMA", default_value = "public")]
    pub schema: String,

    /// Keepalive ping interval in seconds
    #[arg(long, env = "PING_INTERVAL_SECS", default_value = "30")]
    pub ping_interval_secs: u64,

    /// Connect timeout in milliseconds
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value = "10000")]
    pub connect_timeout_ms: u64,

    /// Reconnection configuration
    #[command(flatten)]
    pub reconnect: ReconnectArgs,

    /// Notifications retained
    #[arg(long, env = "NOTIFICATION_CAPACITY", default_value = "10")]
    pub notification_capacity: usize,

    /// Deleted ids remembered by the cache
    #[arg(long, env = "CACHE_MAX_TOMBSTONES", default_value = "10000")]
    pub max_tombstones: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

/// Reconnection backoff arguments
#[derive(ClapArgs, Debug, Clone)]
pub struct ReconnectArgs {
    /// Delay before the first retry, in milliseconds
    #[arg(long = "reconnect-base-ms", env = "RECONNECT_BASE_MS", default_value = "500")]
    pub base_ms: u64,

    /// Upper bound on any retry delay, in milliseconds
    #[arg(long = "reconnect-cap-ms", env = "RECONNECT_CAP_MS", default_value = "30000")]
    pub cap_ms: u64,

    /// Jitter as a fraction of the delay (0.0 - 1.0)
    #[arg(long = "reconnect-jitter", env = "RECONNECT_JITTER", default_value = "0.2")]
    pub jitter: f64,

    /// Consecutive failures before giving up (0 = retry forever)
    #[arg(long = "reconnect-max-attempts", env = "RECONNECT_MAX_ATTEMPTS", default_value = "10")]
    pub max_attempts: u32,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.feed_url.starts_with("ws://") && !self.feed_url.starts_with("wss://") {
            return Err(format!("FEED_URL must be a ws:// or wss:// URL, got '{}'", self.feed_url));
        }

        if self.topic.trim().is_empty() {
            return Err("TOPIC must not be empty".to_string());
        }

        if self.reconnect.base_ms == 0 {
            return Err("RECONNECT_BASE_MS must be greater than 0".to_string());
        }

        if self.reconnect.base_ms > self.reconnect.cap_ms {
            return Err("RECONNECT_BASE_MS must be less than or equal to RECONNECT_CAP_MS".to_string());
        }

        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err("RECONNECT_JITTER must be between 0.0 and 1.0".to_string());
        }

        if self.notification_capacity == 0 {
            return Err("NOTIFICATION_CAPACITY must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl From<&ReconnectArgs> for BackoffPolicy {
    fn from(args: &ReconnectArgs) -> Self {
        Self {
            base: Duration::from_millis(args.base_ms),
            cap: Duration::from_millis(args.cap_ms),
            jitter: args.jitter,
            max_attempts: (args.max_attempts > 0).then_some(args.max_attempts),
        }
    }
}

/// Everything needed to run a sync session
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub topic: String,
    pub feed: WebSocketConfig,
    pub manager: ManagerConfig,
}

impl From<&Args> for SyncConfig {
    fn from(args: &Args) -> Self {
        Self {
            topic: args.topic.clone(),
            feed: WebSocketConfig {
                url: args.feed_url.clone(),
                schema: args.schema.clone(),
                ping_interval: Duration::from_secs(args.ping_interval_secs),
                connect_timeout: Duration::from_millis(args.connect_timeout_ms),
                ..Default::default()
            },
            manager: ManagerConfig {
                backoff: BackoffPolicy::from(&args.reconnect),
                cache: CacheConfig {
                    max_tombstones: args.max_tombstones,
                },
                notifications: NotificationConfig {
                    capacity: args.notification_capacity,
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }
}
