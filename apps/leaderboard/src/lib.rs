#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    cache::{CacheSettings, MemorySharedCache},
    calendar::StaticCalendar,
    config::Config,
    db::LeaderboardDb,
    engine::{EngineDeps, EngineSettings, LeaderboardEngine},
    enrollment::MembershipDirectory,
    ledger::PointsLedger,
    server::{AppState, build_router},
    snapshot::SnapshotService,
    webhook::{
        DeliverySettings, HttpWebhookTransport, OutboxStore, WebhookNotifier, WebhookTransport,
    },
};

pub mod aggregation;
pub mod cache;
pub mod calendar;
pub mod config;
pub mod context_config;
pub mod db;
pub mod engine;
pub mod enrollment;
pub mod ledger;
pub mod ranking;
pub mod server;
pub mod snapshot;
pub mod types;
pub mod webhook;

/// Wires the engine from config: Postgres-backed ledger, snapshots, configs and webhook
/// outbox when a database is configured, memory otherwise.
pub async fn build_engine(config: &Config) -> Result<LeaderboardEngine> {
    let mut deps = EngineDeps::memory(MembershipDirectory::shared());
    let mut outbox: Option<Arc<dyn OutboxStore>> = None;
    if let Some(url) = config.db_url.as_deref() {
        let db = Arc::new(LeaderboardDb::connect(url).await?);
        db.migrate().await?;
        deps.ledger = PointsLedger::new(ledger::store::postgres(db.clone()));
        deps.snapshots = SnapshotService::new(snapshot::store::postgres(db.clone()));
        deps.configs = context_config::postgres(db.clone());
        outbox = Some(webhook::postgres_outbox(db));
    }
    deps.calendar = StaticCalendar::shared(config.calendar_terms.clone());
    deps.shared_cache = Arc::new(MemorySharedCache::new(
        Duration::from_millis(config.cache_shared_ttl_ms),
        config.cache_local_capacity,
    ));
    if let Some(url) = config.webhook_url.clone() {
        let transport: Arc<dyn WebhookTransport> = Arc::new(HttpWebhookTransport::new(
            url,
            config.webhook_auth_token.clone(),
            Duration::from_millis(config.webhook_timeout_ms),
        ));
        let mut notifier = WebhookNotifier::new(
            Some(transport),
            DeliverySettings {
                max_attempts: config.webhook_max_attempts,
                backoff: Duration::from_millis(config.webhook_backoff_ms),
            },
        );
        if let Some(outbox) = outbox {
            notifier = notifier.with_outbox_store(outbox);
            if let Err(error) = notifier.restore_outbox().await {
                warn!(reason = %error, "failed to restore webhook outbox");
            }
        }
        deps.webhooks = notifier;
    }

    let settings = EngineSettings {
        ranking_max_population: config.ranking_max_population,
        ranking_timeout: config.ranking_timeout(),
        invalidation_window: config.invalidation_window(),
        aggregation_max_attempts: config.aggregation_max_attempts,
        webhook_retry_interval: config.webhook_retry_interval(),
        cache: CacheSettings {
            local_ttl: Duration::from_millis(config.cache_local_ttl_ms),
            shared_ttl: Duration::from_millis(config.cache_shared_ttl_ms),
            local_capacity: config.cache_local_capacity,
            last_good_capacity: config.cache_local_capacity,
        },
    };
    Ok(LeaderboardEngine::new(deps, settings))
}

pub async fn build_app(config: &Config) -> Result<axum::Router> {
    let engine = build_engine(config).await?;
    Ok(build_router(AppState::new(engine, config.service_name.clone())))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        persistent = config.db_url.is_some(),
        webhooks = config.webhook_url.is_some(),
        "leaderboard service listening"
    );
    axum::serve(listener, build_app(&config).await?).await?;
    Ok(())
}
