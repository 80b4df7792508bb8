use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Class,
    Subject,
    Campus,
}

impl ContextType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Subject => "subject",
            Self::Campus => "campus",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "class" => Some(Self::Class),
            "subject" => Some(Self::Subject),
            "campus" => Some(Self::Campus),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
    Term,
    AllTime,
}

impl Period {
    pub const ALL: [Self; 5] = [
        Self::Daily,
        Self::Weekly,
        Self::Monthly,
        Self::Term,
        Self::AllTime,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Term => "term",
            Self::AllTime => "all_time",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "term" => Some(Self::Term),
            "all_time" => Some(Self::AllTime),
            _ => None,
        }
    }
}

/// Half-open time window `[start, end)`. A missing bound is unbounded on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl PeriodRange {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| at >= start) && self.end.is_none_or(|end| at < end)
    }

    pub fn is_empty(&self) -> bool {
        matches!((self.start, self.end), (Some(start), Some(end)) if end <= start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRef {
    pub context_type: ContextType,
    pub context_id: String,
}

impl ContextRef {
    pub fn new(context_type: ContextType, context_id: impl Into<String>) -> Self {
        Self {
            context_type,
            context_id: context_id.into(),
        }
    }
}

impl std::fmt::Display for ContextRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.context_type.as_str(), self.context_id)
    }
}

/// Invalidation granularity: one period bucket of one context, across all partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub context: ContextRef,
    pub period: Period,
    pub bucket_start: Option<DateTime<Utc>>,
}

/// Identity of one computed leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BoardKey {
    pub context: ContextRef,
    pub partition_key: Option<String>,
    pub period: Period,
    pub bucket: PeriodRange,
}

impl BoardKey {
    pub fn bucket_key(&self) -> BucketKey {
        BucketKey {
            context: self.context.clone(),
            period: self.period,
            bucket_start: self.bucket.start,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub student_id: String,
    pub context_type: ContextType,
    pub context_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    pub period: Period,
    pub points: i64,
    pub rank: u32,
    pub previous_rank: Option<u32>,
    pub rank_delta: Option<i64>,
    pub level: u32,
    pub achievements_count: u32,
    pub computed_at: DateTime<Utc>,
}

/// A fully ranked leaderboard as held by the cache tiers.
#[derive(Debug, Clone)]
pub struct ComputedBoard {
    pub key: BoardKey,
    pub entries: Vec<LeaderboardEntry>,
    pub computed_at: DateTime<Utc>,
    pub degraded: bool,
    pub previous_snapshot_id: Option<String>,
}

impl ComputedBoard {
    pub fn entry(&self, student_id: &str) -> Option<&LeaderboardEntry> {
        self.entries
            .iter()
            .find(|entry| entry.student_id == student_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardPage {
    pub context_type: ContextType,
    pub context_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    pub period: Period,
    pub bucket: PeriodRange,
    pub entries: Vec<LeaderboardEntry>,
    pub total_students: usize,
    pub limit: usize,
    pub offset: usize,
    pub stale: bool,
    pub degraded: bool,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRank {
    pub student_id: String,
    pub rank: u32,
    pub total_students: usize,
    pub points: i64,
    pub previous_rank: Option<u32>,
    pub rank_delta: Option<i64>,
    pub percentile: f64,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardSnapshot {
    pub id: String,
    pub context_type: ContextType,
    pub context_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    pub period: Period,
    pub snapshot_date: NaiveDate,
    pub as_of: DateTime<Utc>,
    pub bucket: PeriodRange,
    pub entries: Vec<LeaderboardEntry>,
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
}

impl LeaderboardSnapshot {
    pub fn context(&self) -> ContextRef {
        ContextRef::new(self.context_type, self.context_id.clone())
    }
}

/// Percentage of the population ranked at or below `rank` (rank 1 of N is 100).
pub fn percentile(rank: u32, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    let at_or_below = total - f64::from(rank) + 1.0;
    ((at_or_below / total) * 10_000.0).round() / 100.0
}

pub(crate) fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

pub(crate) fn normalize_required(value: &str, field: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{field} is required"));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn period_range_is_half_open() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).unwrap();
        let range = PeriodRange::between(start, end);
        assert!(range.contains(start));
        assert!(!range.contains(end));
        assert!(PeriodRange::unbounded().contains(end));
    }

    #[test]
    fn percentile_puts_leader_at_top() {
        assert_eq!(percentile(1, 4), 100.0);
        assert_eq!(percentile(4, 4), 25.0);
        assert_eq!(percentile(1, 0), 0.0);
    }

    #[test]
    fn period_wire_names_round_trip() {
        for period in Period::ALL {
            assert_eq!(Period::parse(period.as_str()), Some(period));
        }
        assert_eq!(
            serde_json::to_string(&Period::AllTime).unwrap(),
            "\"all_time\""
        );
    }
}
