//! Civil ↔ absolute time conversion anchored to a shop's IANA zone.
//!
//! Business hours, breaks and day boundaries are civil constants; stored
//! appointments are absolute instants. Everything crossing that line goes
//! through [`ShopZone`].

use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta, TimeZone};
use chrono_tz::Tz;
use thiserror::Error;

use crate::model::{Ms, Span};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TzError {
    #[error("unknown time zone: {0}")]
    InvalidZone(String),
    #[error("invalid civil time {hour:02}:{minute:02}")]
    InvalidCivilTime { hour: u32, minute: u32 },
    #[error("instant {0} is outside the representable range")]
    OutOfRange(Ms),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShopZone {
    tz: Tz,
}

impl ShopZone {
    pub fn parse(name: &str) -> Result<Self, TzError> {
        name.trim()
            .parse::<Tz>()
            .map(|tz| Self { tz })
            .map_err(|_| TzError::InvalidZone(name.to_string()))
    }

    pub fn name(&self) -> &'static str {
        self.tz.name()
    }

    pub fn civil_to_instant(&self, date: NaiveDate, hour: u32, minute: u32) -> Result<Ms, TzError> {
        let time = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or(TzError::InvalidCivilTime { hour, minute })?;
        Ok(self.instant_of(date.and_time(time)))
    }

    /// Resolve a wall-clock reading to an instant.
    ///
    /// Ambiguous readings (clocks turned back) take the earlier instant.
    /// Readings inside a spring-forward gap are read with the offset in force
    /// before the gap, which moves them forward by the gap length.
    pub fn instant_of(&self, civil: NaiveDateTime) -> Ms {
        match self.tz.from_local_datetime(&civil) {
            LocalResult::Single(dt) => dt.timestamp_millis(),
            LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
            LocalResult::None => {
                let before = self
                    .tz
                    .offset_from_utc_datetime(&(civil - TimeDelta::days(1)))
                    .fix();
                (civil - before).and_utc().timestamp_millis()
            }
        }
    }

    /// True for a wall-clock reading the clocks jump over.
    pub fn is_skipped(&self, civil: NaiveDateTime) -> bool {
        matches!(self.tz.from_local_datetime(&civil), LocalResult::None)
    }

    pub fn to_civil(&self, instant: Ms) -> Result<NaiveDateTime, TzError> {
        DateTime::from_timestamp_millis(instant)
            .map(|utc| utc.with_timezone(&self.tz).naive_local())
            .ok_or(TzError::OutOfRange(instant))
    }

    /// Absolute `[local midnight, next local midnight)` of a civil day.
    pub fn day_window(&self, date: NaiveDate) -> Span {
        let start = self.instant_of(date.and_time(NaiveTime::MIN));
        let end = match date.succ_opt() {
            Some(next) => self.instant_of(next.and_time(NaiveTime::MIN)),
            None => start + 24 * 3_600_000,
        };
        Span::new(start, end)
    }
}
