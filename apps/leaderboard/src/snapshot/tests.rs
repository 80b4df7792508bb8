use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use futures::StreamExt;

use crate::snapshot::store::{HistoryFilter, SeriesKey};
use crate::snapshot::{SnapshotService, snapshot_id_for};
use crate::types::{
    ContextRef, ContextType, LeaderboardEntry, LeaderboardSnapshot, Period, PeriodRange,
};

fn monday(week: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0)
        .single()
        .unwrap_or_default()
        + Duration::weeks(i64::from(week))
}

fn series() -> SeriesKey {
    SeriesKey {
        context: ContextRef::new(ContextType::Class, "class-1"),
        partition_key: None,
        period: Period::Weekly,
    }
}

fn entry(student: &str, rank: u32, points: i64, at: DateTime<Utc>) -> LeaderboardEntry {
    LeaderboardEntry {
        student_id: student.to_string(),
        context_type: ContextType::Class,
        context_id: "class-1".to_string(),
        partition_key: None,
        period: Period::Weekly,
        points,
        rank,
        previous_rank: None,
        rank_delta: None,
        level: 0,
        achievements_count: 0,
        computed_at: at,
    }
}

fn snapshot(week: u32, entries: Vec<LeaderboardEntry>) -> LeaderboardSnapshot {
    let as_of = monday(week);
    let snapshot_date: NaiveDate = as_of.date_naive();
    LeaderboardSnapshot {
        id: snapshot_id_for(&series(), snapshot_date),
        context_type: ContextType::Class,
        context_id: "class-1".to_string(),
        partition_key: None,
        period: Period::Weekly,
        snapshot_date,
        as_of,
        bucket: PeriodRange::between(as_of - Duration::weeks(1), as_of),
        entries,
        degraded: false,
        created_at: as_of,
    }
}

#[tokio::test]
async fn create_is_idempotent_on_series_and_date() -> Result<()> {
    let service = SnapshotService::memory();
    let first = snapshot(0, vec![entry("a", 1, 50, monday(0))]);
    let (stored, created) = service.create(first.clone()).await?;
    assert!(created);

    let mut retry = snapshot(0, vec![entry("b", 1, 99, monday(0))]);
    retry.created_at = monday(0) + Duration::hours(1);
    let (again, created_again) = service.create(retry).await?;
    assert!(!created_again);
    assert_eq!(again, stored);
    assert_eq!(again.entries[0].student_id, "a");
    Ok(())
}

#[tokio::test]
async fn previous_ranks_come_from_strictly_earlier_snapshot() -> Result<()> {
    let service = SnapshotService::memory();
    service
        .create(snapshot(0, vec![entry("a", 1, 50, monday(0))]))
        .await?;
    service
        .create(snapshot(
            1,
            vec![entry("b", 1, 80, monday(1)), entry("a", 2, 50, monday(1))],
        ))
        .await?;

    let at_week_one = service.previous_ranks(&series(), monday(1)).await?;
    assert_eq!(at_week_one.ranks.get("a"), Some(&1));
    assert_eq!(at_week_one.ranks.get("b"), None);

    let later = service
        .previous_ranks(&series(), monday(1) + Duration::seconds(1))
        .await?;
    assert_eq!(later.ranks.get("a"), Some(&2));
    assert_eq!(
        later.snapshot_id,
        Some(snapshot_id_for(&series(), monday(1).date_naive()))
    );

    let none = service.previous_ranks(&series(), monday(0)).await?;
    assert!(none.snapshot_id.is_none());
    Ok(())
}

#[tokio::test]
async fn history_stream_pages_in_time_order_and_restarts() -> Result<()> {
    let service = SnapshotService::memory().with_page_size(2);
    for week in [3, 0, 4, 1, 2] {
        service.create(snapshot(week, Vec::new())).await?;
    }
    let context = series().context;

    let streamed: Vec<LeaderboardSnapshot> = service
        .history_stream(context.clone(), HistoryFilter::default())
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;
    let weeks: Vec<DateTime<Utc>> = streamed.iter().map(|s| s.as_of).collect();
    assert_eq!(weeks, (0..5).map(monday).collect::<Vec<_>>());

    let windowed = service
        .history(
            &context,
            HistoryFilter {
                range: PeriodRange::between(monday(1), monday(3)),
                ..HistoryFilter::default()
            },
        )
        .await?;
    assert_eq!(windowed.len(), 2);
    assert_eq!(windowed[0].as_of, monday(1));

    let replay = service.history(&context, HistoryFilter::default()).await?;
    assert_eq!(replay, streamed);
    Ok(())
}

#[tokio::test]
async fn prune_keeps_latest_and_never_everything() -> Result<()> {
    let service = SnapshotService::memory();
    for week in 0..4 {
        service.create(snapshot(week, Vec::new())).await?;
    }
    assert_eq!(service.prune(&series(), 2).await?, 2);
    let remaining = service
        .history(&series().context, HistoryFilter::default())
        .await?;
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0].as_of, monday(2));

    assert_eq!(service.prune(&series(), 0).await?, 1);
    let last = service
        .latest_before(&series(), monday(10))
        .await?
        .context("latest snapshot survives")?;
    assert_eq!(last.as_of, monday(3));
    Ok(())
}

#[test]
fn snapshot_ids_depend_on_every_key_part() {
    let date = monday(0).date_naive();
    let base = snapshot_id_for(&series(), date);
    assert!(base.starts_with("lbs_"));
    assert_eq!(base.len(), 28);
    assert_eq!(base, snapshot_id_for(&series(), date));

    let partitioned = SeriesKey {
        partition_key: Some("red".to_string()),
        ..series()
    };
    assert_ne!(base, snapshot_id_for(&partitioned, date));
    assert_ne!(base, snapshot_id_for(&series(), monday(1).date_naive()));
}
