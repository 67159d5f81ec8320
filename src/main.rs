//! listing-sync - follow a listing topic from the command line

use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use listing_sync::{
    config::{Args, SyncConfig},
    Dispatcher, SubscriptionManager, WebSocketFeed,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("listing_sync={},info", log_level).into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let config = SyncConfig::from(&args);

    info!("======================================");
    info!("  listing-sync");
    info!("======================================");
    info!("Feed: {}", config.feed.url);
    info!("Topic: {}.{}", config.feed.schema, config.topic);
    info!(
        "Reconnect: base {:?}, cap {:?}, max attempts {}",
        config.manager.backoff.base,
        config.manager.backoff.cap,
        config
            .manager
            .backoff
            .max_attempts
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string())
    );
    info!("Notifications kept: {}", config.manager.notifications.capacity);
    info!("======================================");

    let feed = Arc::new(WebSocketFeed::new(config.feed.clone()));
    let manager = SubscriptionManager::new(feed, config.manager.clone());
    let dispatcher = Dispatcher::start(manager.clone(), &config.topic);

    // Log notifications as they are created
    let mut notifications = dispatcher.subscribe_notifications();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(n) => info!(id = n.id, kind = ?n.kind, entity_id = %n.related_entity_id, "{}", n.summary),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notification log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Log connectivity transitions
    let mut status_events = manager.status_events();
    tokio::spawn(async move {
        loop {
            match status_events.recv().await {
                Ok(event) => info!(key = %event.key, "Status: {}", event.status),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut status = dispatcher.watch_status();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        _ = async { let _ = status.wait_for(|s| s.is_closed()).await; } => {
            if let Some(e) = dispatcher.terminal_error() {
                error!("{}; refresh to see latest listings", e);
            }
        }
    }

    let stats = dispatcher.cache_stats().await;
    info!(
        entries = stats.entries,
        applied = stats.applied,
        stale = stats.stale,
        unread = dispatcher.unread_count().await,
        "Final state"
    );

    dispatcher.shutdown().await;
    manager.shutdown().await;
    info!("listing-sync stopped");
    Ok(())
}
