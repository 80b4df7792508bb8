use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregation::store::AggregateRow;
use crate::enrollment::ScopeMember;
use crate::types::{BoardKey, LeaderboardEntry, sha256_hex};

/// Ordering applied between students with equal points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TieBreak {
    /// Earliest positive-point timestamp first, students without one last, then student id.
    #[default]
    EarliestPoint,
    StudentId,
    /// Stable pseudo-random order derived from the seed and the student id.
    Seeded { seed: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankCandidate {
    pub student_id: String,
    pub points: i64,
    pub first_point_at: Option<DateTime<Utc>>,
    pub level: u32,
    pub achievements_count: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RankingError {
    #[error("population of {population} exceeds the ranking budget of {max}")]
    BudgetExceeded { population: usize, max: usize },
}

/// Builds the ranked population for one partition.
///
/// With a membership list every (partition-matching) member is ranked, zero points
/// included, and non-members are dropped. Without one the population is whoever
/// has a total in the bucket.
pub fn assemble_population(
    members: Option<&[ScopeMember]>,
    partition: Option<(&str, &str)>,
    totals: &[AggregateRow],
) -> Vec<RankCandidate> {
    let by_student: HashMap<&str, &AggregateRow> = totals
        .iter()
        .map(|row| (row.student_id.as_str(), row))
        .collect();

    match members {
        Some(members) => members
            .iter()
            .filter(|member| {
                partition.is_none_or(|(attribute, value)| member.attribute(attribute) == Some(value))
            })
            .map(|member| {
                let total = by_student.get(member.student_id.as_str());
                RankCandidate {
                    student_id: member.student_id.clone(),
                    points: total.map_or(0, |row| row.points),
                    first_point_at: total.and_then(|row| row.first_point_at),
                    level: member.level,
                    achievements_count: member.achievements_count,
                }
            })
            .collect(),
        None => totals
            .iter()
            .map(|row| RankCandidate {
                student_id: row.student_id.clone(),
                points: row.points,
                first_point_at: row.first_point_at,
                level: 0,
                achievements_count: 0,
            })
            .collect(),
    }
}

/// Assigns contiguous ranks `1..=N` and rank deltas against `previous_ranks`.
pub fn rank_candidates(
    mut candidates: Vec<RankCandidate>,
    tie_break: TieBreak,
    previous_ranks: &HashMap<String, u32>,
    key: &BoardKey,
    computed_at: DateTime<Utc>,
    max_population: usize,
) -> Result<Vec<LeaderboardEntry>, RankingError> {
    if candidates.len() > max_population {
        return Err(RankingError::BudgetExceeded {
            population: candidates.len(),
            max: max_population,
        });
    }

    let seeded_keys: HashMap<String, String> = match tie_break {
        TieBreak::Seeded { seed } => candidates
            .iter()
            .map(|candidate| {
                let seed = seed.to_string();
                (
                    candidate.student_id.clone(),
                    sha256_hex(&[seed.as_str(), candidate.student_id.as_str()]),
                )
            })
            .collect(),
        _ => HashMap::new(),
    };

    candidates.sort_by(|left, right| {
        right
            .points
            .cmp(&left.points)
            .then_with(|| match tie_break {
                TieBreak::EarliestPoint => {
                    compare_first_point(left.first_point_at, right.first_point_at)
                }
                TieBreak::StudentId => Ordering::Equal,
                TieBreak::Seeded { .. } => seeded_keys
                    .get(&left.student_id)
                    .cmp(&seeded_keys.get(&right.student_id)),
            })
            .then_with(|| left.student_id.cmp(&right.student_id))
    });

    Ok(candidates
        .into_iter()
        .enumerate()
        .map(|(index, candidate)| {
            let rank = u32::try_from(index + 1).unwrap_or(u32::MAX);
            let previous_rank = previous_ranks.get(&candidate.student_id).copied();
            LeaderboardEntry {
                rank_delta: previous_rank.map(|previous| i64::from(previous) - i64::from(rank)),
                previous_rank,
                rank,
                student_id: candidate.student_id,
                context_type: key.context.context_type,
                context_id: key.context.context_id.clone(),
                partition_key: key.partition_key.clone(),
                period: key.period,
                points: candidate.points,
                level: candidate.level,
                achievements_count: candidate.achievements_count,
                computed_at,
            }
        })
        .collect())
}

fn compare_first_point(left: Option<DateTime<Utc>>, right: Option<DateTime<Utc>>) -> Ordering {
    match (left, right) {
        (Some(left), Some(right)) => left.cmp(&right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContextRef, ContextType, Period, PeriodRange};
    use chrono::TimeZone;

    fn key() -> BoardKey {
        BoardKey {
            context: ContextRef::new(ContextType::Class, "class-1"),
            partition_key: None,
            period: Period::Weekly,
            bucket: PeriodRange::unbounded(),
        }
    }

    fn candidate(student: &str, points: i64, first_hour: Option<u32>) -> RankCandidate {
        RankCandidate {
            student_id: student.to_string(),
            points,
            first_point_at: first_hour
                .map(|hour| Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap()),
            level: 1,
            achievements_count: 0,
        }
    }

    fn order(entries: &[LeaderboardEntry]) -> Vec<&str> {
        entries.iter().map(|entry| entry.student_id.as_str()).collect()
    }

    #[test]
    fn ties_break_on_earliest_point_then_student_id() {
        let entries = rank_candidates(
            vec![
                candidate("s3", 50, Some(9)),
                candidate("s1", 50, Some(10)),
                candidate("s4", 0, None),
                candidate("s2", 50, Some(9)),
                candidate("s5", 80, Some(12)),
            ],
            TieBreak::EarliestPoint,
            &HashMap::new(),
            &key(),
            Utc::now(),
            100,
        )
        .unwrap();

        assert_eq!(order(&entries), vec!["s5", "s2", "s3", "s1", "s4"]);
        let ranks: Vec<u32> = entries.iter().map(|entry| entry.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn ranking_is_independent_of_input_order() {
        let base = vec![
            candidate("a", 10, Some(1)),
            candidate("b", 10, Some(1)),
            candidate("c", 10, None),
            candidate("d", 3, Some(2)),
        ];
        for tie_break in [
            TieBreak::EarliestPoint,
            TieBreak::StudentId,
            TieBreak::Seeded { seed: 42 },
        ] {
            let forward =
                rank_candidates(base.clone(), tie_break, &HashMap::new(), &key(), Utc::now(), 10)
                    .unwrap();
            let mut reversed_input = base.clone();
            reversed_input.reverse();
            let backward =
                rank_candidates(reversed_input, tie_break, &HashMap::new(), &key(), Utc::now(), 10)
                    .unwrap();
            assert_eq!(order(&forward), order(&backward));
        }
    }

    #[test]
    fn student_id_tie_break_ignores_timestamps() {
        let entries = rank_candidates(
            vec![candidate("b", 5, Some(1)), candidate("a", 5, Some(9))],
            TieBreak::StudentId,
            &HashMap::new(),
            &key(),
            Utc::now(),
            10,
        )
        .unwrap();
        assert_eq!(order(&entries), vec!["a", "b"]);
    }

    #[test]
    fn rank_delta_is_positive_for_climbers() {
        let previous = HashMap::from([("s1".to_string(), 3_u32), ("s2".to_string(), 1_u32)]);
        let entries = rank_candidates(
            vec![
                candidate("s1", 90, Some(1)),
                candidate("s2", 40, Some(1)),
                candidate("s3", 10, Some(1)),
            ],
            TieBreak::EarliestPoint,
            &previous,
            &key(),
            Utc::now(),
            10,
        )
        .unwrap();
        assert_eq!(entries[0].rank_delta, Some(2));
        assert_eq!(entries[1].rank_delta, Some(-1));
        assert_eq!(entries[2].previous_rank, None);
        assert_eq!(entries[2].rank_delta, None);
    }

    #[test]
    fn population_over_budget_is_rejected() {
        let result = rank_candidates(
            vec![candidate("a", 1, None), candidate("b", 1, None)],
            TieBreak::EarliestPoint,
            &HashMap::new(),
            &key(),
            Utc::now(),
            1,
        );
        assert!(matches!(
            result,
            Err(RankingError::BudgetExceeded { population: 2, max: 1 })
        ));
    }

    #[test]
    fn members_without_points_are_ranked_and_partitions_filter() {
        let members = vec![
            ScopeMember::new("s1").with_attribute("cohort", "red"),
            ScopeMember::new("s2").with_attribute("cohort", "blue"),
            ScopeMember::new("s3").with_attribute("cohort", "red"),
        ];
        let totals = vec![AggregateRow {
            student_id: "s3".to_string(),
            context: ContextRef::new(ContextType::Class, "class-1"),
            period: Period::Weekly,
            bucket: PeriodRange::unbounded(),
            points: 12,
            first_point_at: None,
            version: 1,
        }];

        let red = assemble_population(Some(&members), Some(("cohort", "red")), &totals);
        let ids: Vec<&str> = red.iter().map(|c| c.student_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s3"]);
        assert_eq!(red[0].points, 0);
        assert_eq!(red[1].points, 12);

        let degraded = assemble_population(None, None, &totals);
        assert_eq!(degraded.len(), 1);
    }
}
