use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::db::LeaderboardDb;
use crate::enrollment::ScopeMember;
use crate::ranking::TieBreak;
use crate::types::{ContextRef, Period};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderboardColumn {
    Rank,
    Student,
    Points,
    Level,
    Achievements,
    RankChange,
}

impl LeaderboardColumn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rank => "rank",
            Self::Student => "student",
            Self::Points => "points",
            Self::Level => "level",
            Self::Achievements => "achievements",
            Self::RankChange => "rank_change",
        }
    }
}

/// Splits one context into independent leaderboards keyed by a member attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionRule {
    pub attribute: String,
}

impl PartitionRule {
    pub fn partition_of<'a>(&self, member: &'a ScopeMember) -> Option<&'a str> {
        member.attribute(&self.attribute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardConfig {
    pub visible_columns: Vec<LeaderboardColumn>,
    pub enabled_periods: Vec<Period>,
    pub default_period: Period,
    #[serde(default)]
    pub partition: Option<PartitionRule>,
    #[serde(default)]
    pub tie_break: TieBreak,
    #[serde(default = "default_rank_change_threshold")]
    pub rank_change_threshold: u32,
    #[serde(default)]
    pub point_milestones: Vec<i64>,
}

fn default_rank_change_threshold() -> u32 {
    3
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            visible_columns: vec![
                LeaderboardColumn::Rank,
                LeaderboardColumn::Student,
                LeaderboardColumn::Points,
                LeaderboardColumn::Level,
                LeaderboardColumn::Achievements,
                LeaderboardColumn::RankChange,
            ],
            enabled_periods: Period::ALL.to_vec(),
            default_period: Period::Weekly,
            partition: None,
            tie_break: TieBreak::EarliestPoint,
            rank_change_threshold: default_rank_change_threshold(),
            point_milestones: vec![100, 500, 1_000],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("visibleColumns must not be empty")]
    EmptyColumns,
    #[error("visibleColumns contains {0} more than once")]
    DuplicateColumn(&'static str),
    #[error("visibleColumns must include {0}")]
    MissingRequiredColumn(&'static str),
    #[error("enabledPeriods must not be empty")]
    EmptyPeriods,
    #[error("enabledPeriods contains {0} more than once")]
    DuplicatePeriod(&'static str),
    #[error("defaultPeriod {0} is not enabled")]
    DefaultPeriodDisabled(&'static str),
    #[error("partition attribute is invalid: {0}")]
    InvalidPartitionAttribute(String),
    #[error("rankChangeThreshold must be at least 1")]
    InvalidThreshold,
    #[error("pointMilestones must be positive and strictly increasing")]
    InvalidMilestones,
}

impl LeaderboardConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.visible_columns.is_empty() {
            return Err(ConfigValidationError::EmptyColumns);
        }
        let mut seen_columns = HashSet::new();
        for column in &self.visible_columns {
            if !seen_columns.insert(*column) {
                return Err(ConfigValidationError::DuplicateColumn(column.as_str()));
            }
        }
        for required in [LeaderboardColumn::Rank, LeaderboardColumn::Student] {
            if !seen_columns.contains(&required) {
                return Err(ConfigValidationError::MissingRequiredColumn(required.as_str()));
            }
        }

        if self.enabled_periods.is_empty() {
            return Err(ConfigValidationError::EmptyPeriods);
        }
        let mut seen_periods = HashSet::new();
        for period in &self.enabled_periods {
            if !seen_periods.insert(*period) {
                return Err(ConfigValidationError::DuplicatePeriod(period.as_str()));
            }
        }
        if !seen_periods.contains(&self.default_period) {
            return Err(ConfigValidationError::DefaultPeriodDisabled(
                self.default_period.as_str(),
            ));
        }

        if let Some(partition) = &self.partition {
            let attribute = partition.attribute.as_str();
            if attribute.is_empty() || attribute.len() > 64 {
                return Err(ConfigValidationError::InvalidPartitionAttribute(
                    "must be 1-64 characters".to_string(),
                ));
            }
            if !attribute
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(ConfigValidationError::InvalidPartitionAttribute(format!(
                    "unsupported characters in {attribute}"
                )));
            }
        }

        if self.rank_change_threshold == 0 {
            return Err(ConfigValidationError::InvalidThreshold);
        }
        let increasing = self
            .point_milestones
            .windows(2)
            .all(|pair| pair[0] < pair[1]);
        if !increasing || self.point_milestones.iter().any(|milestone| *milestone <= 0) {
            return Err(ConfigValidationError::InvalidMilestones);
        }
        Ok(())
    }

    pub fn is_enabled(&self, period: Period) -> bool {
        self.enabled_periods.contains(&period)
    }

    /// Periods enabled here that `previous` did not maintain.
    pub fn newly_enabled(&self, previous: &Self) -> Vec<Period> {
        self.enabled_periods
            .iter()
            .copied()
            .filter(|period| !previous.is_enabled(*period))
            .collect()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigStoreError {
    #[error("config store error: {0}")]
    Db(String),
}

/// Per-context configs. A context without a stored config uses the defaults.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, context: &ContextRef) -> Result<Option<LeaderboardConfig>, ConfigStoreError>;
    async fn put(
        &self,
        context: &ContextRef,
        config: LeaderboardConfig,
    ) -> Result<(), ConfigStoreError>;
}

pub fn memory() -> Arc<dyn ConfigStore> {
    Arc::new(MemoryConfigStore::default())
}

pub fn postgres(db: Arc<LeaderboardDb>) -> Arc<dyn ConfigStore> {
    Arc::new(PostgresConfigStore { db })
}

#[derive(Default)]
struct MemoryConfigStore {
    configs: RwLock<HashMap<ContextRef, LeaderboardConfig>>,
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, context: &ContextRef) -> Result<Option<LeaderboardConfig>, ConfigStoreError> {
        Ok(self.configs.read().await.get(context).cloned())
    }

    async fn put(
        &self,
        context: &ContextRef,
        config: LeaderboardConfig,
    ) -> Result<(), ConfigStoreError> {
        self.configs.write().await.insert(context.clone(), config);
        Ok(())
    }
}

struct PostgresConfigStore {
    db: Arc<LeaderboardDb>,
}

#[async_trait]
impl ConfigStore for PostgresConfigStore {
    async fn get(&self, context: &ContextRef) -> Result<Option<LeaderboardConfig>, ConfigStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT config
                  FROM leaderboard.configs
                 WHERE context_type = $1 AND context_id = $2
                "#,
                &[&context.context_type.as_str(), &context.context_id],
            )
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let config: serde_json::Value = row
            .try_get("config")
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;
        let config = serde_json::from_value(config)
            .map_err(|error| ConfigStoreError::Db(format!("stored config for {context}: {error}")))?;
        Ok(Some(config))
    }

    async fn put(
        &self,
        context: &ContextRef,
        config: LeaderboardConfig,
    ) -> Result<(), ConfigStoreError> {
        let config = serde_json::to_value(&config)
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO leaderboard.configs (context_type, context_id, config, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (context_type, context_id)
                DO UPDATE SET config = EXCLUDED.config, updated_at = EXCLUDED.updated_at
                "#,
                &[
                    &context.context_type.as_str(),
                    &context.context_id,
                    &config,
                    &Utc::now(),
                ],
            )
            .await
            .map_err(|error| ConfigStoreError::Db(error.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(LeaderboardConfig::default().validate(), Ok(()));
    }

    #[test]
    fn default_period_must_be_enabled() {
        let config = LeaderboardConfig {
            enabled_periods: vec![Period::Daily],
            default_period: Period::Weekly,
            ..LeaderboardConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::DefaultPeriodDisabled("weekly"))
        );
    }

    #[test]
    fn columns_must_be_unique_and_include_rank() {
        let duplicate = LeaderboardConfig {
            visible_columns: vec![
                LeaderboardColumn::Rank,
                LeaderboardColumn::Student,
                LeaderboardColumn::Rank,
            ],
            ..LeaderboardConfig::default()
        };
        assert_eq!(
            duplicate.validate(),
            Err(ConfigValidationError::DuplicateColumn("rank"))
        );

        let missing = LeaderboardConfig {
            visible_columns: vec![LeaderboardColumn::Student, LeaderboardColumn::Points],
            ..LeaderboardConfig::default()
        };
        assert_eq!(
            missing.validate(),
            Err(ConfigValidationError::MissingRequiredColumn("rank"))
        );
    }

    #[test]
    fn partition_attribute_and_milestones_are_checked() {
        let bad_partition = LeaderboardConfig {
            partition: Some(PartitionRule {
                attribute: "co hort".to_string(),
            }),
            ..LeaderboardConfig::default()
        };
        assert!(matches!(
            bad_partition.validate(),
            Err(ConfigValidationError::InvalidPartitionAttribute(_))
        ));

        let bad_milestones = LeaderboardConfig {
            point_milestones: vec![100, 100],
            ..LeaderboardConfig::default()
        };
        assert_eq!(
            bad_milestones.validate(),
            Err(ConfigValidationError::InvalidMilestones)
        );

        let zero_threshold = LeaderboardConfig {
            rank_change_threshold: 0,
            ..LeaderboardConfig::default()
        };
        assert_eq!(
            zero_threshold.validate(),
            Err(ConfigValidationError::InvalidThreshold)
        );
    }

    #[test]
    fn newly_enabled_lists_added_periods() {
        let before = LeaderboardConfig {
            enabled_periods: vec![Period::Weekly],
            ..LeaderboardConfig::default()
        };
        let after = LeaderboardConfig {
            enabled_periods: vec![Period::Weekly, Period::Monthly],
            ..LeaderboardConfig::default()
        };
        assert_eq!(after.newly_enabled(&before), vec![Period::Monthly]);
    }

    #[test]
    fn config_json_uses_camel_case_and_tagged_tie_break() {
        let json = serde_json::json!({
            "visibleColumns": ["rank", "student", "points"],
            "enabledPeriods": ["weekly", "all_time"],
            "defaultPeriod": "weekly",
            "partition": { "attribute": "cohort" },
            "tieBreak": { "mode": "seeded", "seed": 7 },
            "rankChangeThreshold": 2,
            "pointMilestones": [50, 100]
        });
        let config: LeaderboardConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.tie_break, TieBreak::Seeded { seed: 7 });
        assert_eq!(config.validate(), Ok(()));
    }
}
