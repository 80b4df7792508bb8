use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::context_config::LeaderboardConfig;
use crate::db::LeaderboardDb;
use crate::types::{ContextType, LeaderboardSnapshot, Period, sha256_hex};

const SEEN_EVENT_CAPACITY: u64 = 100_000;
const MAX_RETRY_BACKOFF_SHIFT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventKind {
    RankChanged,
    NewLeader,
    MilestoneReached,
}

impl WebhookEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RankChanged => "rank_changed",
            Self::NewLeader => "new_leader",
            Self::MilestoneReached => "milestone_reached",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEventData {
    pub student_id: String,
    pub context_type: ContextType,
    pub context_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    pub period: Period,
    pub old_rank: Option<u32>,
    pub new_rank: u32,
    pub points: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone: Option<i64>,
    pub snapshot_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    pub event_id: String,
    pub event: WebhookEventKind,
    pub timestamp: DateTime<Utc>,
    pub data: WebhookEventData,
}

/// Significant changes between a new snapshot and the one before it.
///
/// Event ids derive from the snapshot id, so re-evaluating the same snapshot yields the
/// same ids and consumers can deduplicate.
pub fn evaluate(
    current: &LeaderboardSnapshot,
    previous: Option<&LeaderboardSnapshot>,
    config: &LeaderboardConfig,
) -> Vec<WebhookEnvelope> {
    let previous_points: HashMap<&str, i64> = previous
        .map(|snapshot| {
            snapshot
                .entries
                .iter()
                .map(|entry| (entry.student_id.as_str(), entry.points))
                .collect()
        })
        .unwrap_or_default();
    let threshold = i64::from(config.rank_change_threshold.max(1));

    let mut events = Vec::new();
    for entry in &current.entries {
        let data = |milestone: Option<i64>| WebhookEventData {
            student_id: entry.student_id.clone(),
            context_type: current.context_type,
            context_id: current.context_id.clone(),
            partition_key: current.partition_key.clone(),
            period: current.period,
            old_rank: entry.previous_rank,
            new_rank: entry.rank,
            points: entry.points,
            milestone,
            snapshot_id: current.id.clone(),
        };

        if entry.rank_delta.is_some_and(|delta| delta.abs() >= threshold) {
            events.push(envelope(current, WebhookEventKind::RankChanged, data(None)));
        }
        if entry.rank == 1 && entry.previous_rank != Some(1) {
            events.push(envelope(current, WebhookEventKind::NewLeader, data(None)));
        }

        let before = previous_points
            .get(entry.student_id.as_str())
            .copied()
            .unwrap_or(0);
        for milestone in &config.point_milestones {
            if before < *milestone && *milestone <= entry.points {
                events.push(envelope(
                    current,
                    WebhookEventKind::MilestoneReached,
                    data(Some(*milestone)),
                ));
            }
        }
    }
    events
}

fn envelope(
    snapshot: &LeaderboardSnapshot,
    event: WebhookEventKind,
    data: WebhookEventData,
) -> WebhookEnvelope {
    let milestone = data.milestone.map(|value| value.to_string()).unwrap_or_default();
    let digest = sha256_hex(&[
        event.as_str(),
        snapshot.id.as_str(),
        data.student_id.as_str(),
        milestone.as_str(),
    ]);
    WebhookEnvelope {
        event_id: format!("lbe_{}", &digest[..24]),
        event,
        timestamp: snapshot.as_of,
        data,
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WebhookTransportError {
    #[error("webhook transport error: {0}")]
    Transport(String),
    #[error("webhook rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl WebhookTransportError {
    fn retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
        }
    }
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(&self, envelope: &WebhookEnvelope) -> Result<(), WebhookTransportError>;
}

pub struct HttpWebhookTransport {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpWebhookTransport {
    pub fn new(url: String, auth_token: Option<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            auth_token,
            timeout,
        }
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn deliver(&self, envelope: &WebhookEnvelope) -> Result<(), WebhookTransportError> {
        let mut request = self
            .client
            .post(self.url.as_str())
            .timeout(self.timeout)
            .header("x-event-id", envelope.event_id.as_str())
            .json(envelope);
        if let Some(token) = self.auth_token.as_deref() {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        let response = request
            .send()
            .await
            .map_err(|error| WebhookTransportError::Transport(error.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(WebhookTransportError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Records deliveries in memory. `fail_next` makes upcoming attempts fail.
#[derive(Default)]
pub struct MemoryWebhookTransport {
    delivered: Mutex<Vec<WebhookEnvelope>>,
    failures_remaining: AtomicU32,
}

impl MemoryWebhookTransport {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, attempts: u32) {
        self.failures_remaining.store(attempts, Ordering::SeqCst);
    }

    pub async fn delivered(&self) -> Vec<WebhookEnvelope> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl WebhookTransport for MemoryWebhookTransport {
    async fn deliver(&self, envelope: &WebhookEnvelope) -> Result<(), WebhookTransportError> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if failing {
            return Err(WebhookTransportError::Transport(
                "simulated delivery failure".to_string(),
            ));
        }
        self.delivered.lock().await.push(envelope.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("webhook outbox store error: {0}")]
    Db(String),
}

/// Durable copy of events that exhausted their delivery attempts, oldest first.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn load(&self) -> Result<Vec<WebhookEnvelope>, OutboxStoreError>;
    async fn push(&self, envelope: &WebhookEnvelope) -> Result<(), OutboxStoreError>;
    async fn remove(&self, event_id: &str) -> Result<(), OutboxStoreError>;
}

pub fn memory_outbox() -> Arc<dyn OutboxStore> {
    Arc::new(MemoryOutboxStore::default())
}

pub fn postgres_outbox(db: Arc<LeaderboardDb>) -> Arc<dyn OutboxStore> {
    Arc::new(PostgresOutboxStore { db })
}

#[derive(Default)]
struct MemoryOutboxStore {
    events: Mutex<Vec<WebhookEnvelope>>,
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn load(&self) -> Result<Vec<WebhookEnvelope>, OutboxStoreError> {
        Ok(self.events.lock().await.clone())
    }

    async fn push(&self, envelope: &WebhookEnvelope) -> Result<(), OutboxStoreError> {
        let mut events = self.events.lock().await;
        if !events.iter().any(|event| event.event_id == envelope.event_id) {
            events.push(envelope.clone());
        }
        Ok(())
    }

    async fn remove(&self, event_id: &str) -> Result<(), OutboxStoreError> {
        self.events
            .lock()
            .await
            .retain(|event| event.event_id != event_id);
        Ok(())
    }
}

struct PostgresOutboxStore {
    db: Arc<LeaderboardDb>,
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn load(&self) -> Result<Vec<WebhookEnvelope>, OutboxStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                "SELECT envelope FROM leaderboard.webhook_outbox ORDER BY seq ASC",
                &[],
            )
            .await
            .map_err(|error| OutboxStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(|row| {
                let envelope: serde_json::Value = row
                    .try_get("envelope")
                    .map_err(|error| OutboxStoreError::Db(error.to_string()))?;
                serde_json::from_value(envelope)
                    .map_err(|error| OutboxStoreError::Db(format!("stored webhook event: {error}")))
            })
            .collect()
    }

    async fn push(&self, envelope: &WebhookEnvelope) -> Result<(), OutboxStoreError> {
        let value = serde_json::to_value(envelope)
            .map_err(|error| OutboxStoreError::Db(error.to_string()))?;
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO leaderboard.webhook_outbox (event_id, envelope, enqueued_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (event_id) DO NOTHING
                "#,
                &[&envelope.event_id, &value, &Utc::now()],
            )
            .await
            .map_err(|error| OutboxStoreError::Db(error.to_string()))?;
        Ok(())
    }

    async fn remove(&self, event_id: &str) -> Result<(), OutboxStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                "DELETE FROM leaderboard.webhook_outbox WHERE event_id = $1",
                &[&event_id],
            )
            .await
            .map_err(|error| OutboxStoreError::Db(error.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeliverySettings {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(150),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMetrics {
    pub emitted: u64,
    pub duplicates: u64,
    pub delivered: u64,
    pub failed_attempts: u64,
    pub outboxed: u64,
    pub outbox_depth: u64,
}

/// At-least-once delivery off the request path.
#[derive(Clone)]
pub struct WebhookNotifier {
    transport: Option<Arc<dyn WebhookTransport>>,
    settings: DeliverySettings,
    seen: Cache<String, ()>,
    outbox: Arc<Mutex<VecDeque<WebhookEnvelope>>>,
    outbox_store: Arc<dyn OutboxStore>,
    metrics: Arc<Mutex<WebhookMetrics>>,
    delivery: Arc<Mutex<()>>,
}

impl WebhookNotifier {
    pub fn new(transport: Option<Arc<dyn WebhookTransport>>, settings: DeliverySettings) -> Self {
        Self {
            transport,
            settings: DeliverySettings {
                max_attempts: settings.max_attempts.max(1),
                backoff: settings.backoff,
            },
            seen: Cache::builder().max_capacity(SEEN_EVENT_CAPACITY).build(),
            outbox: Arc::new(Mutex::new(VecDeque::new())),
            outbox_store: memory_outbox(),
            metrics: Arc::new(Mutex::new(WebhookMetrics::default())),
            delivery: Arc::new(Mutex::new(())),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, DeliverySettings::default())
    }

    #[must_use]
    pub fn with_outbox_store(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.outbox_store = store;
        self
    }

    /// Queues events a previous process left undelivered. Their ids count as seen.
    pub async fn restore_outbox(&self) -> Result<usize, OutboxStoreError> {
        let stored = self.outbox_store.load().await?;
        let mut restored = 0;
        {
            let mut outbox = self.outbox.lock().await;
            for event in stored {
                if outbox.iter().any(|queued| queued.event_id == event.event_id) {
                    continue;
                }
                self.seen.insert(event.event_id.clone(), ()).await;
                outbox.push_back(event);
                restored += 1;
            }
        }
        self.set_outbox_depth().await;
        if restored > 0 {
            tracing::info!(events = restored, "webhook outbox restored");
        }
        Ok(restored)
    }

    /// Drains the outbox on its own so queued events do not wait for the next snapshot.
    /// The delay doubles while the outbox keeps failing. `None` without a transport.
    pub fn spawn_retrier(&self, interval: Duration) -> Option<JoinHandle<()>> {
        let transport = self.transport.clone()?;
        let notifier = self.clone();
        Some(tokio::spawn(async move {
            let mut failures: u32 = 0;
            loop {
                let delay = interval.saturating_mul(1 << failures.min(MAX_RETRY_BACKOFF_SHIFT));
                tokio::time::sleep(delay).await;
                if notifier.outbox.lock().await.is_empty() {
                    failures = 0;
                    continue;
                }
                let _serial = notifier.delivery.lock().await;
                if notifier.flush_outbox(transport.as_ref()).await {
                    failures = 0;
                    tracing::info!("webhook outbox drained");
                } else {
                    failures = failures.saturating_add(1);
                }
            }
        }))
    }

    pub async fn metrics(&self) -> WebhookMetrics {
        self.metrics.lock().await.clone()
    }

    /// Drops already-seen event ids and spawns delivery of the rest.
    pub async fn notify(&self, events: Vec<WebhookEnvelope>) -> Option<JoinHandle<()>> {
        let Some(transport) = self.transport.clone() else {
            if !events.is_empty() {
                tracing::debug!(events = events.len(), "webhook transport not configured");
            }
            return None;
        };

        let mut fresh = Vec::with_capacity(events.len());
        let mut duplicates = 0_u64;
        for event in events {
            if self
                .seen
                .entry(event.event_id.clone())
                .or_insert(())
                .await
                .is_fresh()
            {
                fresh.push(event);
            } else {
                duplicates += 1;
            }
        }
        {
            let mut metrics = self.metrics.lock().await;
            metrics.emitted = metrics.emitted.saturating_add(fresh.len() as u64);
            metrics.duplicates = metrics.duplicates.saturating_add(duplicates);
        }
        if fresh.is_empty() {
            return None;
        }

        let notifier = self.clone();
        Some(tokio::spawn(async move {
            notifier.deliver_all(transport.as_ref(), fresh).await;
        }))
    }

    async fn deliver_all(&self, transport: &dyn WebhookTransport, events: Vec<WebhookEnvelope>) {
        let _serial = self.delivery.lock().await;
        if !self.flush_outbox(transport).await {
            for event in events {
                self.enqueue_outbox(event).await;
            }
            return;
        }
        for event in events {
            match self.deliver_with_retry(transport, &event).await {
                Ok(()) => self.record_delivered().await,
                Err(error) => {
                    tracing::warn!(
                        event_id = %event.event_id,
                        event = event.event.as_str(),
                        reason = %error,
                        "webhook delivery failed; queued in outbox"
                    );
                    self.enqueue_outbox(event).await;
                }
            }
        }
    }

    /// Retries outboxed events in order. Returns false if one still fails.
    async fn flush_outbox(&self, transport: &dyn WebhookTransport) -> bool {
        loop {
            let pending = self.outbox.lock().await.front().cloned();
            let Some(event) = pending else {
                self.set_outbox_depth().await;
                return true;
            };
            match self.deliver_with_retry(transport, &event).await {
                Ok(()) => {
                    self.record_delivered().await;
                    let _ = self.outbox.lock().await.pop_front();
                    if let Err(error) = self.outbox_store.remove(&event.event_id).await {
                        tracing::warn!(
                            event_id = %event.event_id,
                            reason = %error,
                            "failed to remove delivered webhook from outbox store"
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        event_id = %event.event_id,
                        reason = %error,
                        "webhook outbox flush failed"
                    );
                    self.set_outbox_depth().await;
                    return false;
                }
            }
        }
    }

    async fn deliver_with_retry(
        &self,
        transport: &dyn WebhookTransport,
        event: &WebhookEnvelope,
    ) -> Result<(), WebhookTransportError> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match transport.deliver(event).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    self.record_failed_attempt().await;
                    if attempt >= self.settings.max_attempts || !error.retryable() {
                        return Err(error);
                    }
                    let delay = self.settings.backoff.saturating_mul(attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn record_delivered(&self) {
        let mut metrics = self.metrics.lock().await;
        metrics.delivered = metrics.delivered.saturating_add(1);
    }

    async fn record_failed_attempt(&self) {
        let mut metrics = self.metrics.lock().await;
        metrics.failed_attempts = metrics.failed_attempts.saturating_add(1);
    }

    async fn enqueue_outbox(&self, event: WebhookEnvelope) {
        if let Err(error) = self.outbox_store.push(&event).await {
            tracing::warn!(
                event_id = %event.event_id,
                reason = %error,
                "failed to persist webhook outbox"
            );
        }
        self.outbox.lock().await.push_back(event);
        {
            let mut metrics = self.metrics.lock().await;
            metrics.outboxed = metrics.outboxed.saturating_add(1);
        }
        self.set_outbox_depth().await;
    }

    async fn set_outbox_depth(&self) {
        let depth = self.outbox.lock().await.len() as u64;
        let mut metrics = self.metrics.lock().await;
        metrics.outbox_depth = depth;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::{Context, Result};
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::*;
    use crate::types::{LeaderboardEntry, PeriodRange};

    fn entry(student: &str, rank: u32, previous: Option<u32>, points: i64) -> LeaderboardEntry {
        LeaderboardEntry {
            student_id: student.to_string(),
            context_type: ContextType::Class,
            context_id: "class-1".to_string(),
            partition_key: None,
            period: Period::AllTime,
            points,
            rank,
            previous_rank: previous,
            rank_delta: previous.map(|p| i64::from(p) - i64::from(rank)),
            level: 0,
            achievements_count: 0,
            computed_at: Utc::now(),
        }
    }

    fn snapshot(id: &str, day: u32, entries: Vec<LeaderboardEntry>) -> LeaderboardSnapshot {
        let as_of = Utc
            .with_ymd_and_hms(2026, 3, day, 0, 0, 0)
            .single()
            .unwrap_or_default();
        LeaderboardSnapshot {
            id: id.to_string(),
            context_type: ContextType::Class,
            context_id: "class-1".to_string(),
            partition_key: None,
            period: Period::AllTime,
            snapshot_date: NaiveDate::from_ymd_opt(2026, 3, day).unwrap_or_default(),
            as_of,
            bucket: PeriodRange::unbounded(),
            entries,
            degraded: false,
            created_at: as_of,
        }
    }

    fn kinds(events: &[WebhookEnvelope], student: &str) -> Vec<WebhookEventKind> {
        events
            .iter()
            .filter(|event| event.data.student_id == student)
            .map(|event| event.event)
            .collect()
    }

    #[test]
    fn small_rank_drop_below_threshold_is_silent() {
        let config = LeaderboardConfig {
            rank_change_threshold: 2,
            point_milestones: Vec::new(),
            ..LeaderboardConfig::default()
        };
        let previous = snapshot("lbs_prev", 2, vec![entry("a", 1, None, 50)]);
        let current = snapshot(
            "lbs_next",
            9,
            vec![entry("b", 1, None, 80), entry("a", 2, Some(1), 50)],
        );
        let events = evaluate(&current, Some(&previous), &config);
        assert!(kinds(&events, "a").is_empty());
        assert_eq!(kinds(&events, "b"), vec![WebhookEventKind::NewLeader]);
    }

    #[test]
    fn large_moves_and_milestones_emit_events() {
        let config = LeaderboardConfig {
            rank_change_threshold: 2,
            point_milestones: vec![100, 200, 300],
            ..LeaderboardConfig::default()
        };
        let previous = snapshot(
            "lbs_prev",
            2,
            vec![entry("a", 1, None, 150), entry("c", 3, None, 90)],
        );
        let current = snapshot(
            "lbs_next",
            9,
            vec![entry("c", 1, Some(3), 250), entry("a", 2, Some(1), 150)],
        );
        let events = evaluate(&current, Some(&previous), &config);
        assert_eq!(
            kinds(&events, "c"),
            vec![
                WebhookEventKind::RankChanged,
                WebhookEventKind::NewLeader,
                WebhookEventKind::MilestoneReached,
                WebhookEventKind::MilestoneReached,
            ]
        );
        let milestones: Vec<Option<i64>> = events
            .iter()
            .filter(|event| event.event == WebhookEventKind::MilestoneReached)
            .map(|event| event.data.milestone)
            .collect();
        assert_eq!(milestones, vec![Some(100), Some(200)]);
        assert!(kinds(&events, "a").is_empty());

        let again = evaluate(&current, Some(&previous), &config);
        assert_eq!(events, again);
    }

    #[test]
    fn envelope_wire_format_matches_consumers() -> Result<()> {
        let current = snapshot("lbs_next", 9, vec![entry("a", 1, Some(4), 20)]);
        let events = evaluate(&current, None, &LeaderboardConfig::default());
        let event = events.first().context("rank change event")?;
        let json = serde_json::to_value(event)?;
        assert_eq!(json["event"], "rank_changed");
        assert!(json["eventId"].as_str().is_some_and(|id| id.starts_with("lbe_")));
        assert_eq!(json["data"]["studentId"], "a");
        assert_eq!(json["data"]["oldRank"], 4);
        assert_eq!(json["data"]["newRank"], 1);
        assert_eq!(json["data"]["contextType"], "class");
        Ok(())
    }

    fn sample_events() -> Vec<WebhookEnvelope> {
        let current = snapshot("lbs_next", 9, vec![entry("a", 1, Some(5), 20)]);
        evaluate(&current, None, &LeaderboardConfig::default())
    }

    fn fast_settings() -> DeliverySettings {
        DeliverySettings {
            max_attempts: 2,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_delivered_once() -> Result<()> {
        let transport = MemoryWebhookTransport::shared();
        let notifier = WebhookNotifier::new(Some(transport.clone()), fast_settings());
        let events = sample_events();
        let expected = events.len();

        notifier
            .notify(events.clone())
            .await
            .context("first delivery spawned")?
            .await?;
        assert!(notifier.notify(events).await.is_none());

        assert_eq!(transport.delivered().await.len(), expected);
        let metrics = notifier.metrics().await;
        assert_eq!(metrics.delivered, expected as u64);
        assert_eq!(metrics.duplicates, expected as u64);
        Ok(())
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_from_outbox() -> Result<()> {
        let transport = MemoryWebhookTransport::shared();
        let notifier = WebhookNotifier::new(Some(transport.clone()), fast_settings());
        let first = sample_events();
        let first_count = first.len();

        transport.fail_next(2 * first_count as u32);
        notifier.notify(first).await.context("spawned")?.await?;
        let metrics = notifier.metrics().await;
        assert_eq!(metrics.outbox_depth, first_count as u64);
        assert!(transport.delivered().await.is_empty());

        let later = snapshot("lbs_later", 16, vec![entry("z", 1, Some(9), 5)]);
        let second = evaluate(&later, None, &LeaderboardConfig::default());
        let second_count = second.len();
        notifier.notify(second).await.context("spawned")?.await?;

        let delivered = transport.delivered().await;
        assert_eq!(delivered.len(), first_count + second_count);
        assert_eq!(delivered[0].data.student_id, "a");
        assert_eq!(notifier.metrics().await.outbox_depth, 0);
        Ok(())
    }

    #[tokio::test]
    async fn retrier_drains_outbox_without_new_notifications() -> Result<()> {
        let transport = MemoryWebhookTransport::shared();
        let notifier = WebhookNotifier::new(Some(transport.clone()), fast_settings());
        let events = sample_events();
        let count = events.len();

        transport.fail_next(2 * count as u32);
        notifier.notify(events).await.context("spawned")?.await?;
        assert_eq!(notifier.metrics().await.outbox_depth, count as u64);

        let retrier = notifier
            .spawn_retrier(Duration::from_millis(10))
            .context("retrier spawned")?;
        for _ in 0..100 {
            if notifier.metrics().await.outbox_depth == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        retrier.abort();

        assert_eq!(transport.delivered().await.len(), count);
        assert_eq!(notifier.metrics().await.outbox_depth, 0);
        Ok(())
    }

    #[tokio::test]
    async fn undelivered_events_survive_a_new_notifier() -> Result<()> {
        let store = memory_outbox();
        let failing = MemoryWebhookTransport::shared();
        let first = WebhookNotifier::new(Some(failing.clone()), fast_settings())
            .with_outbox_store(store.clone());
        let events = sample_events();
        let count = events.len();
        failing.fail_next(2 * count as u32);
        first.notify(events.clone()).await.context("spawned")?.await?;
        assert_eq!(store.load().await?.len(), count);

        let transport = MemoryWebhookTransport::shared();
        let second = WebhookNotifier::new(Some(transport.clone()), fast_settings())
            .with_outbox_store(store.clone());
        assert_eq!(second.restore_outbox().await?, count);
        assert!(second.notify(events).await.is_none());

        let retrier = second
            .spawn_retrier(Duration::from_millis(10))
            .context("retrier spawned")?;
        for _ in 0..100 {
            if store.load().await?.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        retrier.abort();

        assert_eq!(transport.delivered().await.len(), count);
        assert!(store.load().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn disabled_notifier_drops_events() {
        let notifier = WebhookNotifier::disabled();
        assert!(notifier.notify(sample_events()).await.is_none());
        assert!(notifier.spawn_retrier(Duration::from_millis(10)).is_none());
        assert_eq!(notifier.metrics().await, WebhookMetrics::default());
    }
}
