use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::ledger::store::{LedgerStore, LedgerStoreError};
use crate::ledger::types::{
    DEFAULT_CATEGORY, PointTransaction, RecordOutcome, RecordPointsRequest, RecordReversalRequest,
    transaction_id_for,
};
use crate::types::{ContextRef, PeriodRange, normalize_required};

pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("ledger store error: {0}")]
    Store(String),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Store(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidRequest(message)
            | Self::NotFound(message)
            | Self::Conflict(message)
            | Self::Store(message) => message.clone(),
        }
    }
}

fn map_store_error(error: LedgerStoreError) -> LedgerError {
    match error {
        LedgerStoreError::Conflict(message) => LedgerError::Conflict(message),
        LedgerStoreError::Db(message) => LedgerError::Store(message),
    }
}

/// Append-only points ledger. The source of truth every derived total is rebuilt from.
#[derive(Clone)]
pub struct PointsLedger {
    store: Arc<dyn LedgerStore>,
}

impl PointsLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn memory() -> Self {
        Self::new(store::memory())
    }

    pub async fn record(
        &self,
        request: RecordPointsRequest,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, LedgerError> {
        let student_id = normalize_required(&request.student_id, "studentId")
            .map_err(LedgerError::InvalidRequest)?;
        let context_id = normalize_required(&request.context_id, "contextId")
            .map_err(LedgerError::InvalidRequest)?;
        let source_event_id = normalize_required(&request.source_event_id, "sourceEventId")
            .map_err(LedgerError::InvalidRequest)?;
        if request.amount == 0 {
            return Err(LedgerError::InvalidRequest(
                "amount must be non-zero".to_string(),
            ));
        }
        let category = request
            .category
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_CATEGORY)
            .to_string();

        let context = ContextRef::new(request.context_type, context_id);
        let candidate = PointTransaction {
            transaction_id: transaction_id_for(&context, &source_event_id),
            student_id,
            context_type: context.context_type,
            context_id: context.context_id.clone(),
            amount: request.amount,
            category,
            timestamp: request.timestamp.unwrap_or(now),
            source_event_id,
            reverses_transaction_id: None,
            recorded_at: now,
        };
        self.append(candidate, request.timestamp.is_some()).await
    }

    /// Records `-original.amount` against the original's student. The original row is untouched.
    pub async fn record_reversal(
        &self,
        request: RecordReversalRequest,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, LedgerError> {
        let context_id = normalize_required(&request.context_id, "contextId")
            .map_err(LedgerError::InvalidRequest)?;
        let original_id =
            normalize_required(&request.original_transaction_id, "originalTransactionId")
                .map_err(LedgerError::InvalidRequest)?;
        let source_event_id = normalize_required(&request.source_event_id, "sourceEventId")
            .map_err(LedgerError::InvalidRequest)?;
        let context = ContextRef::new(request.context_type, context_id);

        let original = self
            .store
            .get(&context, &original_id)
            .await
            .map_err(map_store_error)?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {original_id}")))?;
        if original.is_reversal() {
            return Err(LedgerError::InvalidRequest(
                "cannot reverse a reversal transaction".to_string(),
            ));
        }

        let candidate = PointTransaction {
            transaction_id: transaction_id_for(&context, &source_event_id),
            student_id: original.student_id.clone(),
            context_type: context.context_type,
            context_id: context.context_id.clone(),
            amount: original.amount.saturating_neg(),
            category: original.category.clone(),
            timestamp: request.timestamp.unwrap_or(now),
            source_event_id,
            reverses_transaction_id: Some(original.transaction_id.clone()),
            recorded_at: now,
        };
        self.append(candidate, request.timestamp.is_some()).await
    }

    async fn append(
        &self,
        candidate: PointTransaction,
        compare_timestamp: bool,
    ) -> Result<RecordOutcome, LedgerError> {
        let (stored, inserted) = self
            .store
            .append_or_get(candidate.clone())
            .await
            .map_err(map_store_error)?;
        if inserted {
            tracing::info!(
                transaction_id = %stored.transaction_id,
                context = %stored.context(),
                student_id = %stored.student_id,
                amount = stored.amount,
                "points transaction recorded"
            );
        } else if stored.payload_differs(&candidate, compare_timestamp) {
            tracing::warn!(
                transaction_id = %stored.transaction_id,
                source_event_id = %stored.source_event_id,
                context = %stored.context(),
                "duplicate source event replayed with a different payload; keeping the original"
            );
        }
        Ok(RecordOutcome {
            transaction: stored,
            duplicate: !inserted,
        })
    }

    pub async fn get(
        &self,
        context: &ContextRef,
        transaction_id: &str,
    ) -> Result<Option<PointTransaction>, LedgerError> {
        self.store
            .get(context, transaction_id)
            .await
            .map_err(map_store_error)
    }

    /// Sum of every amount, reversals included, with timestamp in `[start, end)`.
    pub async fn get_total(
        &self,
        student_id: &str,
        context: &ContextRef,
        range: PeriodRange,
    ) -> Result<i64, LedgerError> {
        self.store
            .sum_points(context, student_id, range)
            .await
            .map_err(map_store_error)
    }

    pub async fn transactions(
        &self,
        context: &ContextRef,
        range: PeriodRange,
    ) -> Result<Vec<PointTransaction>, LedgerError> {
        self.store
            .list(context, range, None)
            .await
            .map_err(map_store_error)
    }

    pub async fn has_transactions(&self, context: &ContextRef) -> Result<bool, LedgerError> {
        self.store
            .has_context(context)
            .await
            .map_err(map_store_error)
    }
}
