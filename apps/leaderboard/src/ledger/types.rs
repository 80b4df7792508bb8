use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ContextRef, ContextType, sha256_hex};

pub const DEFAULT_CATEGORY: &str = "general";

/// Immutable ledger row. Negative amounts are reversals or penalties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointTransaction {
    pub transaction_id: String,
    pub student_id: String,
    pub context_type: ContextType,
    pub context_id: String,
    pub amount: i64,
    pub category: String,
    pub timestamp: DateTime<Utc>,
    pub source_event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverses_transaction_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl PointTransaction {
    pub fn context(&self) -> ContextRef {
        ContextRef::new(self.context_type, self.context_id.clone())
    }

    pub fn is_reversal(&self) -> bool {
        self.reverses_transaction_id.is_some()
    }

    /// Fields that a replayed event must agree on. `recorded_at` is excluded.
    pub(crate) fn payload_differs(&self, other: &Self, compare_timestamp: bool) -> bool {
        self.student_id != other.student_id
            || self.amount != other.amount
            || self.category != other.category
            || self.reverses_transaction_id != other.reverses_transaction_id
            || (compare_timestamp && self.timestamp != other.timestamp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPointsRequest {
    pub student_id: String,
    pub context_type: ContextType,
    pub context_id: String,
    pub amount: i64,
    #[serde(default)]
    pub category: Option<String>,
    pub source_event_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordReversalRequest {
    pub context_type: ContextType,
    pub context_id: String,
    pub original_transaction_id: String,
    pub source_event_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub transaction: PointTransaction,
    pub duplicate: bool,
}

impl RecordOutcome {
    /// Event fanned out to aggregation and invalidation. Duplicates emit nothing.
    pub fn awarded(&self) -> Option<PointAwarded> {
        (!self.duplicate).then(|| PointAwarded::from(&self.transaction))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointAwarded {
    pub transaction_id: String,
    pub student_id: String,
    pub context: ContextRef,
    pub amount: i64,
    pub timestamp: DateTime<Utc>,
}

impl From<&PointTransaction> for PointAwarded {
    fn from(transaction: &PointTransaction) -> Self {
        Self {
            transaction_id: transaction.transaction_id.clone(),
            student_id: transaction.student_id.clone(),
            context: transaction.context(),
            amount: transaction.amount,
            timestamp: transaction.timestamp,
        }
    }
}

pub fn transaction_id_for(context: &ContextRef, source_event_id: &str) -> String {
    let digest = sha256_hex(&[
        context.context_type.as_str(),
        context.context_id.as_str(),
        source_event_id,
    ]);
    format!("ptx_{}", &digest[..24])
}
