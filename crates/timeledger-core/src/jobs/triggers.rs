//! When a job becomes due

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::{Calendar, ClockTime};

/// Trigger of a periodic job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTrigger {
    /// Fixed period, first run one period after start
    Every {
        /// Period
        #[serde(with = "period_secs")]
        period: Duration,
    },
    /// Once a day at a center-local hour
    DailyAt {
        /// Hour 0..=23
        hour: u16,
    },
}

impl JobTrigger {
    /// Fixed-period trigger
    #[must_use]
    pub fn every(period: Duration) -> Self {
        Self::Every { period }
    }

    /// Daily trigger
    #[must_use]
    pub fn daily_at(hour: u16) -> Self {
        Self::DailyAt { hour }
    }

    /// First due instant strictly after `now`
    #[must_use]
    pub fn next_after(&self, calendar: &Calendar, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Self::Every { period } => {
                let step = chrono::Duration::from_std(period)
                    .unwrap_or_else(|_| chrono::Duration::days(1))
                    .max(chrono::Duration::seconds(1));
                now + step
            }
            Self::DailyAt { hour } => {
                let at = ClockTime::from_hm(hour.min(23), 0).unwrap_or(ClockTime::MIDNIGHT);
                let today = calendar.today(now);
                let candidate = calendar.at(today, at).with_timezone(&Utc);
                if candidate > now {
                    candidate
                } else {
                    let tomorrow = today.succ_opt().unwrap_or(today);
                    calendar.at(tomorrow, at).with_timezone(&Utc)
                }
            }
        }
    }
}

impl std::fmt::Display for JobTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Every { period } => write!(f, "every {}s", period.as_secs()),
            Self::DailyAt { hour } => write!(f, "daily at {:02}:00", hour),
        }
    }
}

mod period_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
