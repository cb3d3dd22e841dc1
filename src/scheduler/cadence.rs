//! How often a scheduled action runs.
//!
//! Durations are the primary form and are coarsened to whole minutes; cron
//! expressions are accepted as a secondary form for wall-clock alignment.

use crate::error::{AgentError, Result};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

/// A recurring cadence.
#[derive(Debug, Clone)]
pub enum Cadence {
    /// Fixed period, always a whole number of minutes (at least one).
    Every(Duration),
    /// Cron expression, evaluated in UTC.
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
    },
}

impl Cadence {
    /// Smallest whole-minute period that is at least `requested`.
    pub fn from_duration(requested: Duration) -> Self {
        let millis = requested.as_millis();
        let minutes = millis.div_ceil(60_000).max(1);
        let minutes = u64::try_from(minutes).unwrap_or(u64::MAX / 60);
        Self::Every(Duration::from_secs(minutes.saturating_mul(60)))
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::from_duration(Duration::from_millis(millis))
    }

    pub fn every_minutes(minutes: u64) -> Self {
        Self::from_duration(MINUTE.saturating_mul(u32::try_from(minutes).unwrap_or(u32::MAX)))
    }

    /// Parse a cron expression.
    ///
    /// Accepts the classic five-field form (`min hour dom mon dow`) as well as
    /// the six/seven-field form with leading seconds.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Scheduler`] if the expression does not parse.
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            _ => trimmed.to_owned(),
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| AgentError::Scheduler(format!("invalid cadence '{trimmed}': {e}")))?;
        Ok(Self::Cron {
            expression: trimmed.to_owned(),
            schedule: Box::new(schedule),
        })
    }

    /// Fixed period, if this is a duration cadence.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Every(period) => Some(*period),
            Self::Cron { .. } => None,
        }
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(period) => {
                let period = chrono::Duration::from_std(*period).ok()?;
                after.checked_add_signed(period)
            }
            Self::Cron { schedule, .. } => schedule.after(&after).next(),
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Every(period) => {
                let minutes = period.as_secs() / 60;
                if minutes == 1 {
                    write!(f, "every minute")
                } else if minutes == 60 {
                    write!(f, "every hour")
                } else if minutes % 60 == 0 {
                    write!(f, "every {} hours", minutes / 60)
                } else {
                    write!(f, "every {minutes} minutes")
                }
            }
            Self::Cron { expression, .. } => write!(f, "cron '{expression}'"),
        }
    }
}

/// Drives one handle's wake-ups.
pub(crate) enum Ticker {
    Interval(tokio::time::Interval),
    Cron {
        schedule: Box<cron::Schedule>,
        last_fire: Option<DateTime<Utc>>,
    },
}

impl Ticker {
    pub(crate) fn new(cadence: &Cadence) -> Self {
        match cadence {
            Cadence::Every(period) => {
                let start = tokio::time::Instant::now() + *period;
                let mut interval = tokio::time::interval_at(start, *period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                Self::Interval(interval)
            }
            Cadence::Cron { schedule, .. } => Self::Cron {
                schedule: schedule.clone(),
                last_fire: None,
            },
        }
    }

    /// Wait for the next fire time.
    pub(crate) async fn tick(&mut self) {
        match self {
            Self::Interval(interval) => {
                interval.tick().await;
            }
            Self::Cron {
                schedule,
                last_fire,
            } => {
                let now = Utc::now();
                let from = match *last_fire {
                    Some(last) if last > now => last,
                    _ => now,
                };
                let Some(next) = schedule.after(&from).next() else {
                    // Exhausted schedule (e.g. a past year): park forever.
                    std::future::pending::<()>().await;
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                *last_fire = Some(next);
            }
        }
    }
}
