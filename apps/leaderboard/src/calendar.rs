use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};

use crate::types::{ContextRef, Period, PeriodRange};

#[derive(Debug, Clone, thiserror::Error)]
pub enum CalendarError {
    #[error("academic calendar unavailable: {0}")]
    Unavailable(String),
    #[error("timestamp outside supported calendar range: {0}")]
    OutOfRange(DateTime<Utc>),
}

/// Boundary provider for period bucketing.
///
/// Returning `Ok(None)` means the calendar has no opinion for that period and the
/// Gregorian default applies.
#[async_trait]
pub trait AcademicCalendar: Send + Sync {
    async fn period_bounds(
        &self,
        context: &ContextRef,
        period: Period,
        at: DateTime<Utc>,
    ) -> Result<Option<PeriodRange>, CalendarError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermWindow {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// In-process calendar holding a fixed list of term windows.
pub struct StaticCalendar {
    terms: Vec<TermWindow>,
    available: AtomicBool,
}

impl Default for StaticCalendar {
    fn default() -> Self {
        Self::with_terms(Vec::new())
    }
}

impl StaticCalendar {
    pub fn with_terms(mut terms: Vec<TermWindow>) -> Self {
        terms.sort_by_key(|term| term.start);
        Self {
            terms,
            available: AtomicBool::new(true),
        }
    }

    pub fn shared(terms: Vec<TermWindow>) -> Arc<Self> {
        Arc::new(Self::with_terms(terms))
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Parses `name=YYYY-MM-DD..YYYY-MM-DD` entries separated by commas. End dates are exclusive.
    pub fn parse_terms(raw: &str) -> Result<Vec<TermWindow>, String> {
        let mut terms = Vec::new();
        for (index, item) in raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .enumerate()
        {
            let (name, span) = match item.split_once('=') {
                Some((name, span)) => (name.trim().to_string(), span.trim()),
                None => (format!("term-{}", index + 1), item),
            };
            let Some((start_raw, end_raw)) = span.split_once("..") else {
                return Err(format!("expected start..end, got: {item}"));
            };
            let start = parse_day(start_raw)?;
            let end = parse_day(end_raw)?;
            if end <= start {
                return Err(format!("term end must be after start: {item}"));
            }
            terms.push(TermWindow { name, start, end });
        }
        Ok(terms)
    }
}

fn parse_day(raw: &str) -> Result<DateTime<Utc>, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
        .map_err(|error| format!("invalid date {raw}: {error}"))
}

#[async_trait]
impl AcademicCalendar for StaticCalendar {
    async fn period_bounds(
        &self,
        _context: &ContextRef,
        period: Period,
        at: DateTime<Utc>,
    ) -> Result<Option<PeriodRange>, CalendarError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CalendarError::Unavailable(
                "static calendar marked offline".to_string(),
            ));
        }
        if period != Period::Term {
            return Ok(None);
        }
        Ok(self
            .terms
            .iter()
            .find(|term| at >= term.start && at < term.end)
            .map(|term| PeriodRange::between(term.start, term.end)))
    }
}

/// Maps timestamps to period buckets, consulting the calendar and degrading to Gregorian bounds.
#[derive(Clone)]
pub struct PeriodBucketer {
    calendar: Arc<dyn AcademicCalendar>,
}

#[derive(Debug, Clone)]
pub struct Bucketing {
    pub buckets: Vec<(Period, PeriodRange)>,
    pub degraded: bool,
}

impl PeriodBucketer {
    pub fn new(calendar: Arc<dyn AcademicCalendar>) -> Self {
        Self { calendar }
    }

    pub async fn bucket(
        &self,
        context: &ContextRef,
        period: Period,
        at: DateTime<Utc>,
    ) -> Result<(PeriodRange, bool), CalendarError> {
        let fallback = gregorian_bounds(period, at).ok_or(CalendarError::OutOfRange(at))?;
        if matches!(period, Period::Daily | Period::AllTime) {
            return Ok((fallback, false));
        }
        match self.calendar.period_bounds(context, period, at).await {
            Ok(Some(range)) if range.contains(at) => Ok((range, false)),
            Ok(Some(range)) => {
                tracing::warn!(
                    context = %context,
                    period = period.as_str(),
                    start = ?range.start,
                    end = ?range.end,
                    "calendar returned bounds that do not contain timestamp; using gregorian bounds"
                );
                Ok((fallback, false))
            }
            Ok(None) => Ok((fallback, false)),
            Err(error) => {
                tracing::warn!(
                    context = %context,
                    period = period.as_str(),
                    reason = %error,
                    "academic calendar unavailable; bucketing in degraded mode"
                );
                Ok((fallback, true))
            }
        }
    }

    pub async fn buckets(
        &self,
        context: &ContextRef,
        periods: &[Period],
        at: DateTime<Utc>,
    ) -> Result<Bucketing, CalendarError> {
        let mut buckets = Vec::with_capacity(periods.len());
        let mut degraded = false;
        for period in periods {
            let (range, period_degraded) = self.bucket(context, *period, at).await?;
            degraded |= period_degraded;
            buckets.push((*period, range));
        }
        Ok(Bucketing { buckets, degraded })
    }
}

/// Default bounds: UTC days, ISO weeks (Monday start), calendar months and half-year terms.
pub fn gregorian_bounds(period: Period, at: DateTime<Utc>) -> Option<PeriodRange> {
    let date = at.date_naive();
    let (start, end) = match period {
        Period::AllTime => return Some(PeriodRange::unbounded()),
        Period::Daily => (date, date.succ_opt()?),
        Period::Weekly => {
            let start = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
            (start, start + Duration::days(7))
        }
        Period::Monthly => {
            let start = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?;
            let end = if date.month() == 12 {
                NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)?
            };
            (start, end)
        }
        Period::Term => {
            if date.month() <= 6 {
                (
                    NaiveDate::from_ymd_opt(date.year(), 1, 1)?,
                    NaiveDate::from_ymd_opt(date.year(), 7, 1)?,
                )
            } else {
                (
                    NaiveDate::from_ymd_opt(date.year(), 7, 1)?,
                    NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?,
                )
            }
        }
    };
    Some(PeriodRange::between(
        start.and_time(NaiveTime::MIN).and_utc(),
        end.and_time(NaiveTime::MIN).and_utc(),
    ))
}
