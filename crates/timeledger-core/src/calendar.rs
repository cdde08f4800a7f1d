//! Time & calendar primitives
//!
//! All dates and times are center-local wall-clock values in one deployment
//! timezone, resolved once at startup into a [`Calendar`]. Weekdays are
//! normalized to 1..=7 with Monday = 1 and Sunday = 7.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Minutes in a calendar day
pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Timezone used when none is configured
pub const DEFAULT_TIMEZONE: &str = "Asia/Taipei";

/// Source of the current instant
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant (tests, replays)
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Deployment calendar anchored to one timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calendar {
    tz: Tz,
}

impl Default for Calendar {
    fn default() -> Self {
        Self { tz: Tz::Asia__Taipei }
    }
}

impl Calendar {
    /// Calendar for a resolved timezone
    #[must_use]
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Resolve an IANA zone name such as `Asia/Taipei`
    pub fn from_name(name: &str) -> Result<Self> {
        let tz = Tz::from_str(name)
            .map_err(|_| Error::validation(format!("unknown timezone: {}", name)))?;
        Ok(Self { tz })
    }

    /// The configured zone
    #[must_use]
    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Parse `YYYY-MM-DD` into a zone-anchored midnight
    pub fn parse_date(&self, s: &str) -> Result<DateTime<Tz>> {
        let date = parse_ymd(s)?;
        Ok(self.start_of_day(date))
    }

    /// First instant of a local date.
    ///
    /// Zones that skip midnight on a transition day resolve to the first
    /// valid instant after it.
    #[must_use]
    pub fn start_of_day(&self, date: NaiveDate) -> DateTime<Tz> {
        self.resolve(date.and_time(NaiveTime::MIN))
    }

    /// Local instant for a date and clock time (24:00 rolls to the next day)
    #[must_use]
    pub fn at(&self, date: NaiveDate, time: ClockTime) -> DateTime<Tz> {
        self.resolve(time.on(date))
    }

    /// Local calendar date of an instant
    #[must_use]
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// Local wall-clock view of an instant
    #[must_use]
    pub fn local(&self, now: DateTime<Utc>) -> NaiveDateTime {
        now.with_timezone(&self.tz).naive_local()
    }

    fn resolve(&self, naive: NaiveDateTime) -> DateTime<Tz> {
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt,
            LocalResult::Ambiguous(earliest, _) => earliest,
            LocalResult::None => {
                // Inside a DST gap: step forward until the wall clock exists again.
                let mut cursor = naive;
                loop {
                    cursor += Duration::minutes(15);
                    if let Some(dt) = self.tz.from_local_datetime(&cursor).earliest() {
                        return dt;
                    }
                }
            }
        }
    }
}

/// Parse `YYYY-MM-DD`
pub fn parse_ymd(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| Error::validation(format!("invalid date '{}', expected YYYY-MM-DD", s)))
}

static HHMM_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{2}):(\d{2})(?::(\d{2}))?$").expect("HHMM_REGEX is a compile-time constant")
});

/// Parse `HH:MM` or `HH:MM:SS` into a clock time. Seconds must be zero.
///
/// `24:00` is accepted as the end of a day.
pub fn parse_hhmm(s: &str) -> Result<ClockTime> {
    let invalid = || Error::validation(format!("invalid time '{}', expected HH:MM", s));
    let caps = HHMM_REGEX.captures(s.trim()).ok_or_else(invalid)?;
    let hour: u16 = caps[1].parse().map_err(|_| invalid())?;
    let minute: u16 = caps[2].parse().map_err(|_| invalid())?;
    if caps.get(3).is_some_and(|sec| sec.as_str() != "00") {
        return Err(invalid());
    }
    if hour == 24 && minute == 0 {
        return Ok(ClockTime::END_OF_DAY);
    }
    ClockTime::from_hm(hour, minute).ok_or_else(invalid)
}

/// ISO weekday with Monday = 1 … Sunday = 7
#[must_use]
pub fn weekday_of(date: NaiveDate) -> u8 {
    date.weekday().number_from_monday() as u8
}

/// Session length in minutes. An end at or before the start crosses midnight;
/// the result is always positive.
#[must_use]
pub fn duration_minutes(start: ClockTime, end: ClockTime) -> u32 {
    let start = u32::from(start.minutes());
    let end = u32::from(end.minutes());
    if end > start {
        end - start
    } else {
        u32::from(MINUTES_PER_DAY) + end - start
    }
}

/// Whether a `start..end` window wraps into the next calendar day.
///
/// An end of `00:00` means "until midnight" and does not wrap.
#[must_use]
pub fn crosses_midnight(start: ClockTime, end: ClockTime) -> bool {
    end.minutes() != 0 && end <= start
}

/// Inclusive ascending date span; iterate it as many times as needed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateSpan {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateSpan {
    /// First date
    #[must_use]
    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// Last date
    #[must_use]
    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of dates in the span
    #[must_use]
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start).num_days() as usize + 1
        }
    }

    /// Whether the span has no dates
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Fresh iterator from the first date
    #[must_use]
    pub fn iter(&self) -> DateIter {
        DateIter {
            next: (self.start <= self.end).then_some(self.start),
            end: self.end,
        }
    }

    /// Dates in the span falling on an ISO weekday
    pub fn weekdays(&self, weekday: u8) -> impl Iterator<Item = NaiveDate> {
        let offset = (i64::from(weekday) - i64::from(weekday_of(self.start))).rem_euclid(7);
        let first = self.start + Duration::days(offset);
        let end = self.end;
        std::iter::successors(Some(first), |d| Some(*d + Duration::days(7)))
            .take_while(move |d| *d <= end)
    }
}

impl IntoIterator for DateSpan {
    type Item = NaiveDate;
    type IntoIter = DateIter;

    fn into_iter(self) -> DateIter {
        self.iter()
    }
}

impl IntoIterator for &DateSpan {
    type Item = NaiveDate;
    type IntoIter = DateIter;

    fn into_iter(self) -> DateIter {
        self.iter()
    }
}

/// Iterator over a [`DateSpan`]
#[derive(Debug, Clone)]
pub struct DateIter {
    next: Option<NaiveDate>,
    end: NaiveDate,
}

impl Iterator for DateIter {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        let current = self.next?;
        self.next = current.succ_opt().filter(|d| *d <= self.end);
        Some(current)
    }
}

/// Dates `[start, end]` inclusive in ascending order (empty when `end < start`)
#[must_use]
pub fn each_date_in_range(start: NaiveDate, end: NaiveDate) -> DateSpan {
    DateSpan { start, end }
}

/// Wall-clock time of day with minute resolution, `00:00..=24:00`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClockTime(u16);

impl ClockTime {
    /// 00:00
    pub const MIDNIGHT: ClockTime = ClockTime(0);
    /// 24:00, only meaningful as an end time
    pub const END_OF_DAY: ClockTime = ClockTime(MINUTES_PER_DAY);

    /// Build from hour and minute (hour 0..=23)
    #[must_use]
    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self(hour * 60 + minute))
    }

    /// Build from minutes since midnight (0..=1440)
    #[must_use]
    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(Self(minutes))
    }

    /// Time-of-day part of a local datetime
    #[must_use]
    pub fn of(dt: NaiveDateTime) -> Self {
        Self((dt.hour() * 60 + dt.minute()) as u16)
    }

    /// Minutes since midnight
    #[must_use]
    pub fn minutes(self) -> u16 {
        self.0
    }

    /// Hour component (24 for end of day)
    #[must_use]
    pub fn hour(self) -> u16 {
        self.0 / 60
    }

    /// Minute component
    #[must_use]
    pub fn minute(self) -> u16 {
        self.0 % 60
    }

    /// Local datetime of this time on a date; 24:00 is the next midnight
    #[must_use]
    pub fn on(self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(NaiveTime::MIN) + Duration::minutes(i64::from(self.0))
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for ClockTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_hhmm(s)
    }
}

impl Serialize for ClockTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_hhmm(&raw).map_err(serde::de::Error::custom)
    }
}

/// Inclusive date interval; an unset end is open-ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveRange {
    /// First effective date
    pub start_date: NaiveDate,
    /// Last effective date, `None` = open-ended
    pub end_date: Option<NaiveDate>,
}

impl EffectiveRange {
    /// Range from `start` with an optional end
    #[must_use]
    pub fn new(start_date: NaiveDate, end_date: Option<NaiveDate>) -> Self {
        Self {
            start_date,
            end_date,
        }
    }

    /// Range covering a single date
    #[must_use]
    pub fn single(date: NaiveDate) -> Self {
        Self::new(date, Some(date))
    }

    /// Whether the range is well-formed (end not before start)
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.end_date.map_or(true, |end| end >= self.start_date)
    }

    /// Whether `date` falls inside the range
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start_date && self.end_date.map_or(true, |end| date <= end)
    }

    /// Whether the range shares at least one date with `[start, end]`
    #[must_use]
    pub fn intersects(&self, start: NaiveDate, end: NaiveDate) -> bool {
        start <= end && self.start_date <= end && self.end_date.map_or(true, |e| e >= start)
    }

    /// Whether two ranges share at least one date
    #[must_use]
    pub fn overlaps(&self, other: &EffectiveRange) -> bool {
        let start = self.start_date.max(other.start_date);
        match (self.end_date, other.end_date) {
            (Some(a), Some(b)) => start <= a.min(b),
            (Some(a), None) => start <= a,
            (None, Some(b)) => start <= b,
            (None, None) => true,
        }
    }

    /// Intersection with `[start, end]` as a date span
    #[must_use]
    pub fn clamp(&self, start: NaiveDate, end: NaiveDate) -> Option<DateSpan> {
        if !self.intersects(start, end) {
            return None;
        }
        let from = self.start_date.max(start);
        let to = self.end_date.map_or(end, |e| e.min(end));
        Some(each_date_in_range(from, to))
    }
}

#[cfg(test)]
mod tests;
