use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};

use crate::ledger::types::{RecordPointsRequest, RecordReversalRequest, transaction_id_for};
use crate::ledger::{LedgerError, PointsLedger};
use crate::types::{ContextRef, ContextType, PeriodRange};

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0)
        .single()
        .unwrap_or_default()
}

fn award(student: &str, amount: i64, event: &str, timestamp: DateTime<Utc>) -> RecordPointsRequest {
    RecordPointsRequest {
        student_id: student.to_string(),
        context_type: ContextType::Class,
        context_id: "class-4a".to_string(),
        amount,
        category: Some("quiz".to_string()),
        source_event_id: event.to_string(),
        timestamp: Some(timestamp),
    }
}

fn class() -> ContextRef {
    ContextRef::new(ContextType::Class, "class-4a")
}

#[tokio::test]
async fn duplicate_source_event_is_a_no_op() -> Result<()> {
    let ledger = PointsLedger::memory();
    let first = ledger
        .record(award("s1", 10, "evt-1", at(2, 9)), at(2, 9))
        .await
        .context("first record")?;
    assert!(!first.duplicate);
    assert!(first.awarded().is_some());

    let replay = ledger
        .record(award("s1", 10, "evt-1", at(2, 9)), at(2, 10))
        .await
        .context("replay")?;
    assert!(replay.duplicate);
    assert!(replay.awarded().is_none());
    assert_eq!(replay.transaction, first.transaction);

    let total = ledger
        .get_total("s1", &class(), PeriodRange::unbounded())
        .await?;
    assert_eq!(total, 10);
    Ok(())
}

#[tokio::test]
async fn same_source_event_in_other_context_is_independent() -> Result<()> {
    let ledger = PointsLedger::memory();
    ledger
        .record(award("s1", 10, "evt-1", at(2, 9)), at(2, 9))
        .await?;
    let mut other = award("s1", 10, "evt-1", at(2, 9));
    other.context_type = ContextType::Subject;
    other.context_id = "math".to_string();
    let outcome = ledger.record(other, at(2, 9)).await?;
    assert!(!outcome.duplicate);
    assert_ne!(
        outcome.transaction.transaction_id,
        transaction_id_for(&class(), "evt-1")
    );
    Ok(())
}

#[tokio::test]
async fn totals_use_half_open_ranges_and_include_reversals() -> Result<()> {
    let ledger = PointsLedger::memory();
    let original = ledger
        .record(award("s1", 30, "evt-1", at(2, 9)), at(2, 9))
        .await?;
    ledger
        .record(award("s1", 5, "evt-2", at(3, 0)), at(3, 0))
        .await?;
    let reversal = ledger
        .record_reversal(
            RecordReversalRequest {
                context_type: ContextType::Class,
                context_id: "class-4a".to_string(),
                original_transaction_id: original.transaction.transaction_id.clone(),
                source_event_id: "evt-1-void".to_string(),
                timestamp: Some(at(2, 12)),
            },
            at(2, 12),
        )
        .await?;
    assert_eq!(reversal.transaction.amount, -30);
    assert_eq!(
        reversal.transaction.reverses_transaction_id.as_deref(),
        Some(original.transaction.transaction_id.as_str())
    );

    let march_second = PeriodRange::between(at(2, 0), at(3, 0));
    assert_eq!(ledger.get_total("s1", &class(), march_second).await?, 0);
    assert_eq!(
        ledger
            .get_total("s1", &class(), PeriodRange::unbounded())
            .await?,
        5
    );

    let unchanged = ledger
        .get(&class(), &original.transaction.transaction_id)
        .await?
        .context("original still present")?;
    assert_eq!(unchanged.amount, 30);
    Ok(())
}

#[tokio::test]
async fn reversal_rules_are_enforced() -> Result<()> {
    let ledger = PointsLedger::memory();
    let original = ledger
        .record(award("s1", 30, "evt-1", at(2, 9)), at(2, 9))
        .await?;
    let reverse = |event: &str, target: &str| RecordReversalRequest {
        context_type: ContextType::Class,
        context_id: "class-4a".to_string(),
        original_transaction_id: target.to_string(),
        source_event_id: event.to_string(),
        timestamp: None,
    };

    let missing = ledger.record_reversal(reverse("void-x", "ptx_missing"), at(2, 10)).await;
    assert!(matches!(missing, Err(LedgerError::NotFound(_))));

    let reversal = ledger
        .record_reversal(
            reverse("void-1", &original.transaction.transaction_id),
            at(2, 10),
        )
        .await?;
    let again = ledger
        .record_reversal(
            reverse("void-2", &original.transaction.transaction_id),
            at(2, 11),
        )
        .await;
    assert!(matches!(again, Err(LedgerError::Conflict(_))));

    let of_reversal = ledger
        .record_reversal(
            reverse("void-3", &reversal.transaction.transaction_id),
            at(2, 11),
        )
        .await;
    assert!(matches!(of_reversal, Err(LedgerError::InvalidRequest(_))));
    Ok(())
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let ledger = PointsLedger::memory();
    let zero = ledger.record(award("s1", 0, "evt-0", at(2, 9)), at(2, 9)).await;
    assert!(matches!(zero, Err(LedgerError::InvalidRequest(_))));

    let blank = ledger.record(award("  ", 5, "evt-0", at(2, 9)), at(2, 9)).await;
    assert!(matches!(blank, Err(LedgerError::InvalidRequest(_))));

    let mut no_category = award("s1", 5, "evt-9", at(2, 9));
    no_category.category = None;
    let outcome = ledger.record(no_category, at(2, 9)).await;
    assert_eq!(
        outcome.map(|outcome| outcome.transaction.category).ok().as_deref(),
        Some("general")
    );
}
