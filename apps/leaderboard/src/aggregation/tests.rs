use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::aggregation::store::{self, AggregateKey, AggregateRow, AggregateStore, AggregateStoreError};
use crate::aggregation::{AggregationEngine, AggregationError, totals_from_transactions};
use crate::calendar::{PeriodBucketer, StaticCalendar};
use crate::ledger::PointsLedger;
use crate::ledger::types::{PointAwarded, RecordPointsRequest};
use crate::types::{ContextRef, ContextType, Period, PeriodRange};

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0)
        .single()
        .unwrap_or_default()
}

fn class() -> ContextRef {
    ContextRef::new(ContextType::Class, "class-9")
}

fn engine_with(store: Arc<dyn AggregateStore>) -> AggregationEngine {
    let bucketer = PeriodBucketer::new(StaticCalendar::shared(Vec::new()));
    AggregationEngine::new(store, bucketer, 3)
}

fn awarded(student: &str, amount: i64, timestamp: DateTime<Utc>) -> PointAwarded {
    PointAwarded {
        transaction_id: format!("ptx_{student}_{amount}"),
        student_id: student.to_string(),
        context: class(),
        amount,
        timestamp,
    }
}

#[tokio::test]
async fn award_updates_every_enabled_bucket() -> Result<()> {
    let engine = engine_with(store::memory());
    let applied = engine
        .apply(&awarded("s1", 15, at(4, 10)), &Period::ALL)
        .await?;
    assert_eq!(applied.buckets.len(), 5);
    assert!(!applied.degraded);

    for (period, bucket) in &applied.buckets {
        let rows = engine.bucket_totals(&class(), *period, *bucket).await?;
        assert_eq!(rows.len(), 1, "period {}", period.as_str());
        assert_eq!(rows[0].points, 15);
        assert_eq!(rows[0].first_point_at, Some(at(4, 10)));
    }
    Ok(())
}

#[tokio::test]
async fn disabled_periods_are_not_maintained() -> Result<()> {
    let engine = engine_with(store::memory());
    engine
        .apply(&awarded("s1", 15, at(4, 10)), &[Period::Weekly])
        .await?;
    let (daily, _) = engine.bucket_for(&class(), Period::Daily, at(4, 10)).await?;
    assert!(engine
        .bucket_totals(&class(), Period::Daily, daily)
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn negative_amounts_do_not_move_first_point_time() -> Result<()> {
    let engine = engine_with(store::memory());
    engine
        .apply(&awarded("s1", 10, at(4, 10)), &[Period::AllTime])
        .await?;
    engine
        .apply(&awarded("s1", -4, at(4, 8)), &[Period::AllTime])
        .await?;
    let rows = engine
        .bucket_totals(&class(), Period::AllTime, PeriodRange::unbounded())
        .await?;
    assert_eq!(rows[0].points, 6);
    assert_eq!(rows[0].first_point_at, Some(at(4, 10)));
    Ok(())
}

#[tokio::test]
async fn recompute_matches_incremental_totals_and_corrects_drift() -> Result<()> {
    let ledger = PointsLedger::memory();
    let engine = engine_with(store::memory());
    let periods = [Period::Daily, Period::Weekly, Period::AllTime];

    for (index, (student, amount, day)) in [("s1", 10, 2), ("s2", 7, 3), ("s1", -3, 9), ("s3", 4, 9)]
        .into_iter()
        .enumerate()
    {
        let outcome = ledger
            .record(
                RecordPointsRequest {
                    student_id: student.to_string(),
                    context_type: ContextType::Class,
                    context_id: "class-9".to_string(),
                    amount,
                    category: None,
                    source_event_id: format!("evt-{index}"),
                    timestamp: Some(at(day, 12)),
                },
                at(day, 12),
            )
            .await?;
        let event = outcome.awarded().context("new award")?;
        engine.apply(&event, &periods).await?;
    }

    let transactions = ledger
        .transactions(&class(), PeriodRange::unbounded())
        .await?;
    let clean = engine.recompute(&class(), &transactions, &periods).await?;
    assert_eq!(clean.drift_corrected, 0);
    assert_eq!(clean.transactions_scanned, 4);

    // A lost increment leaves the store behind the ledger.
    engine
        .apply(&awarded("s2", 100, at(3, 13)), &periods)
        .await?;
    let repaired = engine.recompute(&class(), &transactions, &periods).await?;
    assert!(repaired.drift_corrected >= 3);
    assert!(!repaired.touched.is_empty());

    let all_time = engine
        .bucket_totals(&class(), Period::AllTime, PeriodRange::unbounded())
        .await?;
    let s2 = all_time
        .iter()
        .find(|row| row.student_id == "s2")
        .context("s2 row")?;
    assert_eq!(s2.points, 7);

    let direct = totals_from_transactions(
        &class(),
        Period::AllTime,
        PeriodRange::unbounded(),
        &transactions,
    );
    assert_eq!(direct.len(), all_time.len());
    for row in &direct {
        let stored = all_time
            .iter()
            .find(|stored| stored.student_id == row.student_id)
            .context("matching row")?;
        assert!(stored.same_totals(row));
    }
    Ok(())
}

struct AlwaysConflicting;

#[async_trait]
impl AggregateStore for AlwaysConflicting {
    async fn load(
        &self,
        _context: &ContextRef,
        _key: &AggregateKey,
    ) -> Result<Option<AggregateRow>, AggregateStoreError> {
        Ok(None)
    }

    async fn compare_and_swap(
        &self,
        _expected_version: Option<u64>,
        _row: AggregateRow,
    ) -> Result<bool, AggregateStoreError> {
        Ok(false)
    }

    async fn bucket_rows(
        &self,
        _context: &ContextRef,
        _period: Period,
        _bucket_start: Option<DateTime<Utc>>,
    ) -> Result<Vec<AggregateRow>, AggregateStoreError> {
        Ok(Vec::new())
    }

    async fn context_rows(
        &self,
        _context: &ContextRef,
    ) -> Result<Vec<AggregateRow>, AggregateStoreError> {
        Ok(Vec::new())
    }

    async fn replace_context(
        &self,
        _context: &ContextRef,
        _rows: Vec<AggregateRow>,
    ) -> Result<(), AggregateStoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn exhausted_compare_and_swap_surfaces_conflict() {
    let engine = engine_with(Arc::new(AlwaysConflicting));
    let result = engine
        .apply(&awarded("s1", 5, at(4, 10)), &[Period::AllTime])
        .await;
    assert!(matches!(
        result,
        Err(AggregationError::ConcurrencyConflict { attempts: 3, .. })
    ));
    assert_eq!(engine.cas_retries(), 3);
}

#[tokio::test]
async fn concurrent_increments_do_not_lose_updates() -> Result<()> {
    let engine = Arc::new(engine_with(store::memory()));
    let mut handles = Vec::new();
    for amount in 1..=4_i64 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let result = engine
                .apply(&awarded("s1", amount, at(4, 10)), &[Period::AllTime])
                .await;
            (amount, result.is_ok())
        }));
    }
    let mut accepted = 0;
    for handle in handles {
        let (amount, ok) = handle.await?;
        if ok {
            accepted += amount;
        }
    }
    let rows = engine
        .bucket_totals(&class(), Period::AllTime, PeriodRange::unbounded())
        .await?;
    assert_eq!(rows[0].points, accepted);
    Ok(())
}
