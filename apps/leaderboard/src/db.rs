use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

const SCHEMA: &str = r#"
CREATE SCHEMA IF NOT EXISTS leaderboard;

CREATE TABLE IF NOT EXISTS leaderboard.point_transactions (
    transaction_id TEXT PRIMARY KEY,
    student_id TEXT NOT NULL,
    context_type TEXT NOT NULL,
    context_id TEXT NOT NULL,
    amount BIGINT NOT NULL,
    category TEXT NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL,
    source_event_id TEXT NOT NULL,
    reverses_transaction_id TEXT NULL,
    recorded_at TIMESTAMPTZ NOT NULL,
    UNIQUE (context_type, context_id, source_event_id)
);

CREATE INDEX IF NOT EXISTS point_transactions_context_time
    ON leaderboard.point_transactions (context_type, context_id, occurred_at);

CREATE UNIQUE INDEX IF NOT EXISTS point_transactions_single_reversal
    ON leaderboard.point_transactions (reverses_transaction_id)
    WHERE reverses_transaction_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS leaderboard.snapshots (
    snapshot_id TEXT PRIMARY KEY,
    context_type TEXT NOT NULL,
    context_id TEXT NOT NULL,
    partition_key TEXT NOT NULL DEFAULT '',
    period TEXT NOT NULL,
    snapshot_date DATE NOT NULL,
    as_of TIMESTAMPTZ NOT NULL,
    bucket_start TIMESTAMPTZ NULL,
    bucket_end TIMESTAMPTZ NULL,
    entries JSONB NOT NULL,
    degraded BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL,
    UNIQUE (context_type, context_id, partition_key, period, snapshot_date)
);

CREATE INDEX IF NOT EXISTS snapshots_history
    ON leaderboard.snapshots (context_type, context_id, as_of);

CREATE TABLE IF NOT EXISTS leaderboard.configs (
    context_type TEXT NOT NULL,
    context_id TEXT NOT NULL,
    config JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (context_type, context_id)
);

CREATE TABLE IF NOT EXISTS leaderboard.webhook_outbox (
    seq BIGSERIAL PRIMARY KEY,
    event_id TEXT NOT NULL UNIQUE,
    envelope JSONB NOT NULL,
    enqueued_at TIMESTAMPTZ NOT NULL
);
"#;

#[derive(Clone)]
pub struct LeaderboardDb {
    client: Arc<Mutex<Client>>,
}

impl LeaderboardDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "leaderboard postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub async fn migrate(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(SCHEMA)
            .await
            .context("apply leaderboard schema")?;
        tracing::info!("leaderboard schema applied");
        Ok(())
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }
}
