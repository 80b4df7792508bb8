use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::aggregation::store::AggregateStore;
use crate::aggregation::{AggregationEngine, AggregationError, RecomputeSummary, totals_from_transactions};
use crate::cache::invalidation::{InvalidationBus, InvalidationStats};
use crate::cache::single_flight::SingleFlight;
use crate::cache::{BoardCache, CacheSettings, Generation, MemorySharedCache, SharedBoardCache};
use crate::calendar::{AcademicCalendar, PeriodBucketer, StaticCalendar};
use crate::context_config::{self, ConfigStore, ConfigStoreError, LeaderboardConfig};
use crate::enrollment::{Enrollment, MembershipDirectory, ScopeMember};
use crate::ledger::types::{RecordOutcome, RecordPointsRequest, RecordReversalRequest};
use crate::ledger::{LedgerError, PointsLedger};
use crate::ranking::{RankingError, assemble_population, rank_candidates};
use crate::snapshot::store::{HistoryFilter, SeriesKey, SnapshotStoreError};
use crate::snapshot::{SnapshotService, snapshot_id_for};
use crate::types::{
    BoardKey, BucketKey, ComputedBoard, ContextRef, LeaderboardPage, LeaderboardSnapshot, Period,
    PeriodRange, StudentRank, percentile,
};
use crate::webhook::{self, WebhookMetrics, WebhookNotifier};


pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaderboardError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("config validation failed: {0}")]
    Validation(String),
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl LeaderboardError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation_failed",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidRequest(message)
            | Self::NotFound(message)
            | Self::Conflict(message)
            | Self::Validation(message)
            | Self::ConcurrencyConflict(message)
            | Self::Unavailable(message)
            | Self::Internal(message) => message.clone(),
        }
    }
}

impl From<LedgerError> for LeaderboardError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::InvalidRequest(message) => Self::InvalidRequest(message),
            LedgerError::NotFound(message) => Self::NotFound(message),
            LedgerError::Conflict(message) => Self::Conflict(message),
            LedgerError::Store(message) => Self::Internal(message),
        }
    }
}

impl From<AggregationError> for LeaderboardError {
    fn from(error: AggregationError) -> Self {
        match error {
            AggregationError::ConcurrencyConflict { .. } => {
                Self::ConcurrencyConflict(error.to_string())
            }
            AggregationError::Calendar(error) => Self::InvalidRequest(error.to_string()),
            AggregationError::Store(message) => Self::Internal(message),
        }
    }
}

impl From<SnapshotStoreError> for LeaderboardError {
    fn from(error: SnapshotStoreError) -> Self {
        Self::Internal(error.to_string())
    }
}

impl From<ConfigStoreError> for LeaderboardError {
    fn from(error: ConfigStoreError) -> Self {
        Self::Unavailable(error.to_string())
    }
}

impl From<RankingError> for LeaderboardError {
    fn from(error: RankingError) -> Self {
        Self::Unavailable(error.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub ranking_max_population: usize,
    pub ranking_timeout: Duration,
    pub invalidation_window: Duration,
    pub aggregation_max_attempts: u32,
    pub webhook_retry_interval: Duration,
    pub cache: CacheSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ranking_max_population: 100_000,
            ranking_timeout: Duration::from_secs(2),
            invalidation_window: Duration::from_secs(2),
            aggregation_max_attempts: 3,
            webhook_retry_interval: Duration::from_secs(30),
            cache: CacheSettings {
                local_ttl: Duration::from_secs(60),
                shared_ttl: Duration::from_secs(300),
                local_capacity: 10_000,
                last_good_capacity: 10_000,
            },
        }
    }
}

/// Collaborators and stores the engine is wired from.
pub struct EngineDeps {
    pub ledger: PointsLedger,
    pub aggregates: Arc<dyn AggregateStore>,
    pub snapshots: SnapshotService,
    pub configs: Arc<dyn ConfigStore>,
    pub calendar: Arc<dyn AcademicCalendar>,
    pub enrollment: Arc<dyn Enrollment>,
    /// Writable membership, when enrollment is served in-process.
    pub directory: Option<Arc<MembershipDirectory>>,
    pub shared_cache: Arc<dyn SharedBoardCache>,
    pub webhooks: WebhookNotifier,
}

impl EngineDeps {
    /// Everything in memory, with the directory doubling as the enrollment source.
    pub fn memory(directory: Arc<MembershipDirectory>) -> Self {
        Self {
            ledger: PointsLedger::memory(),
            aggregates: crate::aggregation::store::memory(),
            snapshots: SnapshotService::memory(),
            configs: context_config::memory(),
            calendar: StaticCalendar::shared(Vec::new()),
            enrollment: directory.clone(),
            directory: Some(directory),
            shared_cache: Arc::new(MemorySharedCache::new(Duration::from_secs(300), 10_000)),
            webhooks: WebhookNotifier::disabled(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardQuery {
    #[serde(default)]
    pub period: Option<Period>,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    pub period: Period,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotOutcome {
    pub snapshot: LeaderboardSnapshot,
    pub created: bool,
    pub webhook_events: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub computations: u64,
    pub coalesced: u64,
    pub cas_retries: u64,
    pub invalidations: InvalidationStats,
}

type BoardResult = Result<Arc<ComputedBoard>, LeaderboardError>;

struct Inner {
    ledger: PointsLedger,
    aggregation: AggregationEngine,
    snapshots: SnapshotService,
    configs: Arc<dyn ConfigStore>,
    enrollment: Arc<dyn Enrollment>,
    directory: Option<Arc<MembershipDirectory>>,
    cache: Arc<BoardCache>,
    invalidation: Arc<InvalidationBus>,
    flights: SingleFlight<(BoardKey, Generation), BoardResult>,
    webhooks: WebhookNotifier,
    settings: EngineSettings,
    flusher: JoinHandle<()>,
    retrier: Option<JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.flusher.abort();
        if let Some(retrier) = &self.retrier {
            retrier.abort();
        }
    }
}

/// Ledger writes, derived totals, ranking reads and snapshots for every context.
#[derive(Clone)]
pub struct LeaderboardEngine {
    inner: Arc<Inner>,
}

impl LeaderboardEngine {
    /// Spawns the invalidation flusher and the webhook outbox retrier, so this must run
    /// inside a Tokio runtime.
    pub fn new(deps: EngineDeps, settings: EngineSettings) -> Self {
        let cache = Arc::new(BoardCache::new(settings.cache.clone(), deps.shared_cache));
        let invalidation = InvalidationBus::new(cache.clone(), settings.invalidation_window);
        let flusher = invalidation.spawn_flusher();
        let retrier = deps.webhooks.spawn_retrier(settings.webhook_retry_interval);
        let aggregation = AggregationEngine::new(
            deps.aggregates,
            PeriodBucketer::new(deps.calendar),
            settings.aggregation_max_attempts,
        );
        Self {
            inner: Arc::new(Inner {
                ledger: deps.ledger,
                aggregation,
                snapshots: deps.snapshots,
                configs: deps.configs,
                enrollment: deps.enrollment,
                directory: deps.directory,
                cache,
                invalidation,
                flights: SingleFlight::new(),
                webhooks: deps.webhooks,
                settings,
                flusher,
                retrier,
            }),
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            computations: self.inner.flights.executions(),
            coalesced: self.inner.flights.coalesced(),
            cas_retries: self.inner.aggregation.cas_retries(),
            invalidations: self.inner.invalidation.stats(),
        }
    }

    pub async fn webhook_metrics(&self) -> WebhookMetrics {
        self.inner.webhooks.metrics().await
    }

    /// Evicts pending invalidations now instead of waiting for the window.
    pub async fn flush_invalidations(&self) -> usize {
        self.inner.invalidation.flush().await
    }

    pub async fn record_points(
        &self,
        request: RecordPointsRequest,
    ) -> Result<RecordOutcome, LeaderboardError> {
        let context = ContextRef::new(request.context_type, request.context_id.trim());
        self.ensure_rebuilt(&context).await?;
        let gate = self.inner.aggregation.ingest_gate(&context).await;
        let _ingest = gate.read().await;
        let outcome = self.inner.ledger.record(request, Utc::now()).await?;
        self.apply_award(&outcome).await?;
        Ok(outcome)
    }

    pub async fn record_reversal(
        &self,
        request: RecordReversalRequest,
    ) -> Result<RecordOutcome, LeaderboardError> {
        let context = ContextRef::new(request.context_type, request.context_id.trim());
        self.ensure_rebuilt(&context).await?;
        let gate = self.inner.aggregation.ingest_gate(&context).await;
        let _ingest = gate.read().await;
        let outcome = self.inner.ledger.record_reversal(request, Utc::now()).await?;
        self.apply_award(&outcome).await?;
        Ok(outcome)
    }

    async fn apply_award(&self, outcome: &RecordOutcome) -> Result<(), LeaderboardError> {
        let Some(awarded) = outcome.awarded() else {
            return Ok(());
        };
        let config = self.config_for(&awarded.context).await?;
        match self
            .inner
            .aggregation
            .apply(&awarded, &config.enabled_periods)
            .await
        {
            Ok(applied) => {
                self.inner
                    .invalidation
                    .publish(applied.buckets.iter().map(|(period, bucket)| BucketKey {
                        context: awarded.context.clone(),
                        period: *period,
                        bucket_start: bucket.start,
                    }));
                Ok(())
            }
            Err(error @ AggregationError::ConcurrencyConflict { .. }) => {
                // The ledger row is durable; a rebuild restores the aggregates it missed.
                tracing::warn!(
                    transaction_id = %awarded.transaction_id,
                    context = %awarded.context,
                    reason = %error,
                    "aggregate increment exhausted retries; scheduling recompute"
                );
                self.spawn_recompute(awarded.context.clone());
                Err(error.into())
            }
            Err(error) => Err(error.into()),
        }
    }

    fn spawn_recompute(&self, context: ContextRef) {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.recompute(&context).await {
                Ok(summary) => tracing::info!(
                    context = %context,
                    drift_corrected = summary.drift_corrected,
                    "background recompute finished"
                ),
                Err(error) => tracing::warn!(
                    context = %context,
                    reason = %error,
                    "background recompute failed"
                ),
            }
        });
    }

    pub async fn get_total(
        &self,
        student_id: &str,
        context: &ContextRef,
        range: PeriodRange,
    ) -> Result<i64, LeaderboardError> {
        Ok(self.inner.ledger.get_total(student_id, context, range).await?)
    }

    /// Rebuilds every aggregate of the context from the ledger. Blocks ingest for the context
    /// while it runs.
    pub async fn recompute(&self, context: &ContextRef) -> Result<RecomputeSummary, LeaderboardError> {
        let config = self.config_for(context).await?;
        let gate = self.inner.aggregation.ingest_gate(context).await;
        let _exclusive = gate.write().await;
        self.recompute_locked(context, &config).await
    }

    /// The caller holds the write side of the context's ingest gate.
    async fn recompute_locked(
        &self,
        context: &ContextRef,
        config: &LeaderboardConfig,
    ) -> Result<RecomputeSummary, LeaderboardError> {
        let transactions = self
            .inner
            .ledger
            .transactions(context, PeriodRange::unbounded())
            .await?;
        let summary = self
            .inner
            .aggregation
            .recompute(context, &transactions, &config.enabled_periods)
            .await?;
        self.inner.aggregation.mark_rebuilt(context).await;
        self.inner.invalidation.publish(summary.touched.clone());
        Ok(summary)
    }

    /// Aggregates are memory-only and start empty in a new process, while the ledger may
    /// already hold rows for the context. The first use of such a context rebuilds its
    /// aggregates from the ledger. Returns true when a rebuild ran.
    async fn ensure_rebuilt(&self, context: &ContextRef) -> Result<bool, LeaderboardError> {
        if self.inner.aggregation.is_rebuilt(context).await
            || !self.inner.ledger.has_transactions(context).await?
        {
            return Ok(false);
        }
        let config = self.config_for(context).await?;
        let gate = self.inner.aggregation.ingest_gate(context).await;
        let _exclusive = gate.write().await;
        if self.inner.aggregation.is_rebuilt(context).await {
            return Ok(false);
        }
        let summary = self.recompute_locked(context, &config).await?;
        tracing::debug!(
            context = %context,
            rows_rebuilt = summary.rows_rebuilt,
            "aggregates rebuilt on first use"
        );
        Ok(true)
    }

    pub async fn get_config(&self, context: &ContextRef) -> Result<LeaderboardConfig, LeaderboardError> {
        self.config_for(context).await
    }

    /// Rejects invalid configs without applying them. Newly enabled periods are back-filled
    /// from the ledger before this returns.
    pub async fn update_config(
        &self,
        context: &ContextRef,
        config: LeaderboardConfig,
    ) -> Result<LeaderboardConfig, LeaderboardError> {
        config
            .validate()
            .map_err(|error| LeaderboardError::Validation(error.to_string()))?;
        let previous = self.config_for(context).await?;
        self.inner.configs.put(context, config.clone()).await?;
        self.inner.cache.invalidate_context(context).await;
        tracing::info!(
            context = %context,
            default_period = config.default_period.as_str(),
            partitioned = config.partition.is_some(),
            "leaderboard config updated"
        );

        let backfill = config.newly_enabled(&previous);
        if !backfill.is_empty() {
            if let Err(error) = self.recompute(context).await {
                tracing::warn!(
                    context = %context,
                    reason = %error,
                    "back-fill of newly enabled periods failed; rerun recompute"
                );
            }
        }
        Ok(config)
    }

    async fn config_for(&self, context: &ContextRef) -> Result<LeaderboardConfig, LeaderboardError> {
        Ok(self.inner.configs.get(context).await?.unwrap_or_default())
    }

    pub async fn get_leaderboard(
        &self,
        context: &ContextRef,
        query: LeaderboardQuery,
    ) -> Result<LeaderboardPage, LeaderboardError> {
        let config = self.config_for(context).await?;
        let period = resolve_period(&config, query.period)?;
        let partition_key = resolve_partition(&config, query.partition_key)?;
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        let offset = query.offset.unwrap_or(0);

        let (board, stale) = self
            .board(context, partition_key, period, &config, Utc::now())
            .await?;
        Ok(LeaderboardPage {
            context_type: context.context_type,
            context_id: context.context_id.clone(),
            partition_key: board.key.partition_key.clone(),
            period,
            bucket: board.key.bucket,
            entries: board.entries.iter().skip(offset).take(limit).cloned().collect(),
            total_students: board.entries.len(),
            limit,
            offset,
            stale,
            degraded: board.degraded,
            computed_at: board.computed_at,
        })
    }

    /// Without an explicit partition on a partitioned context, the student's own
    /// partition is looked up from enrollment.
    pub async fn get_student_rank(
        &self,
        student_id: &str,
        context: &ContextRef,
        period: Option<Period>,
        partition_key: Option<String>,
    ) -> Result<StudentRank, LeaderboardError> {
        let config = self.config_for(context).await?;
        let period = resolve_period(&config, period)?;
        let partition_key = match (&config.partition, partition_key) {
            (Some(rule), None) => {
                let member = self
                    .inner
                    .enrollment
                    .member(context, student_id)
                    .await
                    .map_err(|error| LeaderboardError::Unavailable(error.to_string()))?
                    .ok_or_else(|| {
                        LeaderboardError::NotFound(format!("student {student_id} in {context}"))
                    })?;
                Some(rule.partition_of(&member).map(str::to_string).ok_or_else(|| {
                    LeaderboardError::NotFound(format!(
                        "student {student_id} has no {} attribute",
                        rule.attribute
                    ))
                })?)
            }
            (_, explicit) => resolve_partition(&config, explicit)?,
        };

        let (board, stale) = self
            .board(context, partition_key, period, &config, Utc::now())
            .await?;
        let entry = board.entry(student_id).ok_or_else(|| {
            LeaderboardError::NotFound(format!("student {student_id} in {context}"))
        })?;
        let total_students = board.entries.len();
        Ok(StudentRank {
            student_id: entry.student_id.clone(),
            rank: entry.rank,
            total_students,
            points: entry.points,
            previous_rank: entry.previous_rank,
            rank_delta: entry.rank_delta,
            percentile: percentile(entry.rank, total_students),
            stale,
        })
    }

    /// Cached board for the bucket containing `at`, computing it single-flight on a miss.
    /// Returns whether the board is a stale fallback.
    async fn board(
        &self,
        context: &ContextRef,
        partition_key: Option<String>,
        period: Period,
        config: &LeaderboardConfig,
        at: DateTime<Utc>,
    ) -> Result<(Arc<ComputedBoard>, bool), LeaderboardError> {
        let (bucket, bucket_degraded) = self.inner.aggregation.bucket_for(context, period, at).await?;
        let key = BoardKey {
            context: context.clone(),
            partition_key,
            period,
            bucket,
        };
        if let Some((board, tier)) = self.inner.cache.lookup(&key).await {
            tracing::debug!(context = %context, period = period.as_str(), ?tier, "leaderboard cache hit");
            return Ok((board, false));
        }

        let generation = self.inner.cache.generation(&key.bucket_key());
        let engine = self.clone();
        let flight_key = key.clone();
        let config = config.clone();
        let result = self
            .inner
            .flights
            .run((key.clone(), generation), move || async move {
                engine
                    .compute_and_store(flight_key, generation, config, bucket_degraded)
                    .await
            })
            .await;

        match result {
            Ok(board) => Ok((board, false)),
            Err(LeaderboardError::Unavailable(reason)) => self.stale_fallback(&key, reason).await,
            Err(error) => Err(error),
        }
    }

    async fn compute_and_store(
        &self,
        key: BoardKey,
        generation: Generation,
        config: LeaderboardConfig,
        bucket_degraded: bool,
    ) -> BoardResult {
        // A rebuild bumps the context's buckets; the board computed after it is current.
        let generation = if self.ensure_rebuilt(&key.context).await? {
            self.inner.cache.generation(&key.bucket_key())
        } else {
            generation
        };
        let budget = self.inner.settings.ranking_timeout;
        let board = tokio::time::timeout(
            budget,
            self.compute_board(&key, &config, Utc::now(), bucket_degraded),
        )
        .await
        .map_err(|_| {
            LeaderboardError::Unavailable(format!(
                "ranking exceeded its {}ms budget",
                budget.as_millis()
            ))
        })??;
        let board = Arc::new(board);
        self.inner.cache.store(&key, board.clone(), generation).await;
        Ok(board)
    }

    async fn compute_board(
        &self,
        key: &BoardKey,
        config: &LeaderboardConfig,
        computed_at: DateTime<Utc>,
        bucket_degraded: bool,
    ) -> Result<ComputedBoard, LeaderboardError> {
        let totals = self
            .inner
            .aggregation
            .bucket_totals(&key.context, key.period, key.bucket)
            .await?;
        let (members, membership_degraded) = self.members_for(key).await?;
        if members.is_none()
            && !membership_degraded
            && totals.is_empty()
            && !self.inner.ledger.has_transactions(&key.context).await?
        {
            return Err(LeaderboardError::NotFound(format!("context {}", key.context)));
        }

        let series = series_of(key);
        let previous = self.inner.snapshots.previous_ranks(&series, computed_at).await?;
        let partition = partition_filter(config, key);
        let candidates = assemble_population(members.as_deref(), partition, &totals);
        let tie_break = config.tie_break;
        let max_population = self.inner.settings.ranking_max_population;
        let ranking_key = key.clone();
        let entries = tokio::task::spawn_blocking(move || {
            rank_candidates(
                candidates,
                tie_break,
                &previous.ranks,
                &ranking_key,
                computed_at,
                max_population,
            )
        })
        .await
        .map_err(|error| LeaderboardError::Internal(format!("ranking task failed: {error}")))??;

        tracing::debug!(
            context = %key.context,
            period = key.period.as_str(),
            entries = entries.len(),
            "leaderboard computed"
        );
        Ok(ComputedBoard {
            key: key.clone(),
            entries,
            computed_at,
            degraded: bucket_degraded || membership_degraded,
            previous_snapshot_id: previous.snapshot_id,
        })
    }

    /// Scope members, or `None` when enrollment does not know the context.
    /// An enrollment outage degrades unpartitioned boards to students with points and
    /// makes partitioned boards unavailable.
    async fn members_for(
        &self,
        key: &BoardKey,
    ) -> Result<(Option<Vec<ScopeMember>>, bool), LeaderboardError> {
        match self.inner.enrollment.members(&key.context).await {
            Ok(members) => Ok((members, false)),
            Err(error) if key.partition_key.is_some() => Err(LeaderboardError::Unavailable(
                format!("partition membership unknown: {error}"),
            )),
            Err(error) => {
                tracing::warn!(
                    context = %key.context,
                    reason = %error,
                    "enrollment unavailable; ranking students with points only"
                );
                Ok((None, true))
            }
        }
    }

    async fn stale_fallback(
        &self,
        key: &BoardKey,
        reason: String,
    ) -> Result<(Arc<ComputedBoard>, bool), LeaderboardError> {
        if let Some(board) = self.inner.cache.last_good(key).await {
            tracing::warn!(
                context = %key.context,
                period = key.period.as_str(),
                reason = %reason,
                "serving last known good leaderboard"
            );
            return Ok((board, true));
        }
        let snapshot = self
            .inner
            .snapshots
            .latest_before(&series_of(key), Utc::now())
            .await?;
        let Some(snapshot) = snapshot else {
            return Err(LeaderboardError::Unavailable(reason));
        };
        tracing::warn!(
            context = %key.context,
            period = key.period.as_str(),
            snapshot_id = %snapshot.id,
            reason = %reason,
            "serving latest snapshot as stale leaderboard"
        );
        Ok((
            Arc::new(ComputedBoard {
                key: key.clone(),
                entries: snapshot.entries,
                computed_at: snapshot.as_of,
                degraded: snapshot.degraded,
                previous_snapshot_id: Some(snapshot.id),
            }),
            true,
        ))
    }

    /// Captures the board as of `as_of` straight from the ledger. Idempotent per
    /// (context, partition, period, date); only a newly created snapshot emits webhooks.
    pub async fn create_snapshot(
        &self,
        context: &ContextRef,
        request: SnapshotRequest,
    ) -> Result<SnapshotOutcome, LeaderboardError> {
        let now = Utc::now();
        let as_of = request.as_of.unwrap_or(now);
        if as_of > now {
            return Err(LeaderboardError::InvalidRequest(
                "asOf must not be in the future".to_string(),
            ));
        }
        let config = self.config_for(context).await?;
        let period = resolve_period(&config, Some(request.period))?;
        let partition_key = resolve_partition(&config, request.partition_key)?;
        let series = SeriesKey {
            context: context.clone(),
            partition_key: partition_key.clone(),
            period,
        };
        let id = snapshot_id_for(&series, as_of.date_naive());
        if let Some(existing) = self.inner.snapshots.get(context, &id).await? {
            return Ok(SnapshotOutcome {
                snapshot: existing,
                created: false,
                webhook_events: 0,
            });
        }

        let (bucket, bucket_degraded) = self.inner.aggregation.bucket_for(context, period, as_of).await?;
        let key = BoardKey {
            context: context.clone(),
            partition_key,
            period,
            bucket,
        };
        let transactions = self.inner.ledger.transactions(context, bucket).await?;
        let totals = totals_from_transactions(
            context,
            period,
            bucket,
            transactions.iter().filter(|row| row.timestamp <= as_of),
        );
        let (members, membership_degraded) = self.members_for(&key).await?;
        let previous = self.inner.snapshots.latest_before(&series, as_of).await?;
        let previous_ranks = previous
            .as_ref()
            .map(|snapshot| {
                snapshot
                    .entries
                    .iter()
                    .map(|entry| (entry.student_id.clone(), entry.rank))
                    .collect()
            })
            .unwrap_or_default();
        let candidates =
            assemble_population(members.as_deref(), partition_filter(&config, &key), &totals);
        let entries = rank_candidates(
            candidates,
            config.tie_break,
            &previous_ranks,
            &key,
            as_of,
            self.inner.settings.ranking_max_population,
        )?;

        let snapshot = LeaderboardSnapshot {
            id,
            context_type: context.context_type,
            context_id: context.context_id.clone(),
            partition_key: key.partition_key.clone(),
            period,
            snapshot_date: as_of.date_naive(),
            as_of,
            bucket,
            entries,
            degraded: bucket_degraded || membership_degraded,
            created_at: now,
        };
        let (stored, created) = self.inner.snapshots.create(snapshot).await?;
        let mut webhook_events = 0;
        if created {
            let events = webhook::evaluate(&stored, previous.as_ref(), &config);
            webhook_events = events.len();
            self.inner.webhooks.notify(events).await;
            // Live boards read previous ranks from the newest snapshot.
            let (live, _) = self.inner.aggregation.bucket_for(context, period, now).await?;
            self.inner.invalidation.publish([BucketKey {
                context: context.clone(),
                period,
                bucket_start: live.start,
            }]);
        }
        Ok(SnapshotOutcome {
            snapshot: stored,
            created,
            webhook_events,
        })
    }

    pub async fn get_history(
        &self,
        context: &ContextRef,
        filter: HistoryFilter,
    ) -> Result<Vec<LeaderboardSnapshot>, LeaderboardError> {
        Ok(self.inner.snapshots.history(context, filter).await?)
    }

    pub fn history_stream(
        &self,
        context: ContextRef,
        filter: HistoryFilter,
    ) -> impl Stream<Item = Result<LeaderboardSnapshot, SnapshotStoreError>> + Send + 'static {
        self.inner.snapshots.history_stream(context, filter)
    }

    pub async fn prune_snapshots(
        &self,
        context: &ContextRef,
        period: Period,
        partition_key: Option<String>,
        keep_latest: usize,
    ) -> Result<u64, LeaderboardError> {
        let series = SeriesKey {
            context: context.clone(),
            partition_key,
            period,
        };
        Ok(self.inner.snapshots.prune(&series, keep_latest).await?)
    }

    /// Adds or updates a member in the in-process directory. Returns true for a new member.
    pub async fn enroll(
        &self,
        context: &ContextRef,
        member: ScopeMember,
    ) -> Result<bool, LeaderboardError> {
        let directory = self.directory()?;
        let student_id = member.student_id.trim().to_string();
        if student_id.is_empty() {
            return Err(LeaderboardError::InvalidRequest(
                "studentId is required".to_string(),
            ));
        }
        let added = directory
            .enroll(
                context,
                ScopeMember {
                    student_id,
                    ..member
                },
            )
            .await;
        self.inner.cache.bump_context(context);
        Ok(added)
    }

    /// Excludes the student from future computations. Snapshots keep them.
    pub async fn unenroll(
        &self,
        context: &ContextRef,
        student_id: &str,
    ) -> Result<(), LeaderboardError> {
        let directory = self.directory()?;
        if !directory.unenroll(context, student_id).await {
            return Err(LeaderboardError::NotFound(format!(
                "student {student_id} in {context}"
            )));
        }
        self.inner.cache.bump_context(context);
        Ok(())
    }

    fn directory(&self) -> Result<&Arc<MembershipDirectory>, LeaderboardError> {
        self.inner.directory.as_ref().ok_or_else(|| {
            LeaderboardError::InvalidRequest(
                "membership is managed by the external enrollment service".to_string(),
            )
        })
    }
}

fn resolve_period(
    config: &LeaderboardConfig,
    requested: Option<Period>,
) -> Result<Period, LeaderboardError> {
    let period = requested.unwrap_or(config.default_period);
    if !config.is_enabled(period) {
        return Err(LeaderboardError::InvalidRequest(format!(
            "period {} is not enabled for this context",
            period.as_str()
        )));
    }
    Ok(period)
}

fn resolve_partition(
    config: &LeaderboardConfig,
    requested: Option<String>,
) -> Result<Option<String>, LeaderboardError> {
    let requested = requested
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    match (&config.partition, requested) {
        (Some(_), Some(value)) => Ok(Some(value)),
        (Some(rule), None) => Err(LeaderboardError::InvalidRequest(format!(
            "partitionKey ({}) is required for this context",
            rule.attribute
        ))),
        (None, Some(_)) => Err(LeaderboardError::InvalidRequest(
            "context is not partitioned".to_string(),
        )),
        (None, None) => Ok(None),
    }
}

fn partition_filter<'a>(
    config: &'a LeaderboardConfig,
    key: &'a BoardKey,
) -> Option<(&'a str, &'a str)> {
    match (&config.partition, key.partition_key.as_deref()) {
        (Some(rule), Some(value)) => Some((rule.attribute.as_str(), value)),
        _ => None,
    }
}

fn series_of(key: &BoardKey) -> SeriesKey {
    SeriesKey {
        context: key.context.clone(),
        partition_key: key.partition_key.clone(),
        period: key.period,
    }
}
