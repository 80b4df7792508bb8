use std::{
    env,
    net::{AddrParseError, SocketAddr},
    time::Duration,
};

use thiserror::Error;

use crate::calendar::{StaticCalendar, TermWindow};

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub db_url: Option<String>,
    pub cache_local_ttl_ms: u64,
    pub cache_local_capacity: u64,
    pub cache_shared_ttl_ms: u64,
    pub invalidation_window_ms: u64,
    pub ranking_max_population: usize,
    pub ranking_timeout_ms: u64,
    pub aggregation_max_attempts: u32,
    pub webhook_url: Option<String>,
    pub webhook_auth_token: Option<String>,
    pub webhook_max_attempts: u32,
    pub webhook_backoff_ms: u64,
    pub webhook_timeout_ms: u64,
    pub webhook_retry_interval_ms: u64,
    pub calendar_terms: Vec<TermWindow>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid LEADERBOARD_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid LEADERBOARD_CACHE_LOCAL_TTL_MS: {0}")]
    InvalidCacheLocalTtl(String),
    #[error("invalid LEADERBOARD_CACHE_LOCAL_CAPACITY: {0}")]
    InvalidCacheLocalCapacity(String),
    #[error("invalid LEADERBOARD_CACHE_SHARED_TTL_MS: {0}")]
    InvalidCacheSharedTtl(String),
    #[error("invalid LEADERBOARD_INVALIDATION_WINDOW_MS: {0}")]
    InvalidInvalidationWindow(String),
    #[error("invalid LEADERBOARD_RANKING_MAX_POPULATION: {0}")]
    InvalidRankingMaxPopulation(String),
    #[error("invalid LEADERBOARD_RANKING_TIMEOUT_MS: {0}")]
    InvalidRankingTimeout(String),
    #[error("invalid LEADERBOARD_AGGREGATION_MAX_ATTEMPTS: {0}")]
    InvalidAggregationMaxAttempts(String),
    #[error("invalid LEADERBOARD_WEBHOOK_URL: {0}")]
    InvalidWebhookUrl(String),
    #[error("invalid webhook delivery setting: {0}")]
    InvalidWebhookDelivery(String),
    #[error("invalid LEADERBOARD_CALENDAR_TERMS: {0}")]
    InvalidCalendarTerms(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = lookup("LEADERBOARD_BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:4200".to_string())
            .parse()?;
        let service_name =
            lookup("LEADERBOARD_SERVICE_NAME").unwrap_or_else(|| "leaderboard".to_string());
        let db_url = lookup("DB_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let cache_local_ttl_ms = parse_u64(&lookup, "LEADERBOARD_CACHE_LOCAL_TTL_MS", 60_000)
            .map_err(ConfigError::InvalidCacheLocalTtl)?
            .clamp(100, 3_600_000);
        let cache_local_capacity = parse_u64(&lookup, "LEADERBOARD_CACHE_LOCAL_CAPACITY", 10_000)
            .map_err(ConfigError::InvalidCacheLocalCapacity)?
            .clamp(16, 1_000_000);
        let cache_shared_ttl_ms = parse_u64(&lookup, "LEADERBOARD_CACHE_SHARED_TTL_MS", 300_000)
            .map_err(ConfigError::InvalidCacheSharedTtl)?
            .clamp(100, 86_400_000);
        let invalidation_window_ms =
            parse_u64(&lookup, "LEADERBOARD_INVALIDATION_WINDOW_MS", 2_000)
                .map_err(ConfigError::InvalidInvalidationWindow)?
                .clamp(10, 60_000);
        let ranking_max_population =
            parse_u64(&lookup, "LEADERBOARD_RANKING_MAX_POPULATION", 100_000)
                .map_err(ConfigError::InvalidRankingMaxPopulation)?
                .clamp(1, 10_000_000) as usize;
        let ranking_timeout_ms = parse_u64(&lookup, "LEADERBOARD_RANKING_TIMEOUT_MS", 2_000)
            .map_err(ConfigError::InvalidRankingTimeout)?
            .clamp(10, 60_000);
        let aggregation_max_attempts =
            parse_u64(&lookup, "LEADERBOARD_AGGREGATION_MAX_ATTEMPTS", 3)
                .map_err(ConfigError::InvalidAggregationMaxAttempts)?
                .clamp(1, 10) as u32;

        let webhook_url = lookup("LEADERBOARD_WEBHOOK_URL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        if let Some(url) = webhook_url
            .as_deref()
            .filter(|url| !(url.starts_with("http://") || url.starts_with("https://")))
        {
            return Err(ConfigError::InvalidWebhookUrl(format!(
                "expected http(s) url, got: {url}"
            )));
        }
        let webhook_auth_token = lookup("LEADERBOARD_WEBHOOK_AUTH_TOKEN")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let webhook_max_attempts = parse_u64(&lookup, "LEADERBOARD_WEBHOOK_MAX_ATTEMPTS", 3)
            .map_err(|error| {
                ConfigError::InvalidWebhookDelivery(format!(
                    "LEADERBOARD_WEBHOOK_MAX_ATTEMPTS: {error}"
                ))
            })?
            .clamp(1, 10) as u32;
        let webhook_backoff_ms = parse_u64(&lookup, "LEADERBOARD_WEBHOOK_BACKOFF_MS", 150)
            .map_err(|error| {
                ConfigError::InvalidWebhookDelivery(format!("LEADERBOARD_WEBHOOK_BACKOFF_MS: {error}"))
            })?
            .clamp(1, 30_000);
        let webhook_timeout_ms = parse_u64(&lookup, "LEADERBOARD_WEBHOOK_TIMEOUT_MS", 5_000)
            .map_err(|error| {
                ConfigError::InvalidWebhookDelivery(format!("LEADERBOARD_WEBHOOK_TIMEOUT_MS: {error}"))
            })?
            .clamp(100, 120_000);
        let webhook_retry_interval_ms =
            parse_u64(&lookup, "LEADERBOARD_WEBHOOK_RETRY_INTERVAL_MS", 30_000)
                .map_err(|error| {
                    ConfigError::InvalidWebhookDelivery(format!(
                        "LEADERBOARD_WEBHOOK_RETRY_INTERVAL_MS: {error}"
                    ))
                })?
                .clamp(100, 3_600_000);

        let calendar_terms = match lookup("LEADERBOARD_CALENDAR_TERMS") {
            Some(raw) => {
                StaticCalendar::parse_terms(&raw).map_err(ConfigError::InvalidCalendarTerms)?
            }
            None => Vec::new(),
        };

        Ok(Self {
            service_name,
            bind_addr,
            db_url,
            cache_local_ttl_ms,
            cache_local_capacity,
            cache_shared_ttl_ms,
            invalidation_window_ms,
            ranking_max_population,
            ranking_timeout_ms,
            aggregation_max_attempts,
            webhook_url,
            webhook_auth_token,
            webhook_max_attempts,
            webhook_backoff_ms,
            webhook_timeout_ms,
            webhook_retry_interval_ms,
            calendar_terms,
        })
    }

    pub fn invalidation_window(&self) -> Duration {
        Duration::from_millis(self.invalidation_window_ms)
    }

    pub fn ranking_timeout(&self) -> Duration {
        Duration::from_millis(self.ranking_timeout_ms)
    }

    pub fn webhook_retry_interval(&self) -> Duration {
        Duration::from_millis(self.webhook_retry_interval_ms)
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64, String> {
    match lookup(key) {
        Some(raw) => raw.trim().parse::<u64>().map_err(|error| error.to_string()),
        None => Ok(default),
    }
}
