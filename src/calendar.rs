use chrono::{Datelike, NaiveDate, Weekday};

use crate::error::ConfigError;

pub const SECONDS_PER_DAY: u32 = 86_400;

/// The recurring weekly availability window, in UTC.
///
/// Built once at startup and passed by value to whoever searches slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessCalendar {
    start_offset_secs: u32,
    end_offset_secs: u32,
    /// Bit `n - 1` set for ISO weekday `n` (1 = Monday … 7 = Sunday).
    weekdays: u8,
}

impl BusinessCalendar {
    pub fn new(
        start_offset_secs: u32,
        end_offset_secs: u32,
        active_weekdays: &[u8],
    ) -> Result<Self, ConfigError> {
        if start_offset_secs >= end_offset_secs {
            return Err(ConfigError::Invalid {
                key: "business hours",
                reason: format!("start {start_offset_secs}s is not before end {end_offset_secs}s"),
            });
        }
        if end_offset_secs > SECONDS_PER_DAY {
            return Err(ConfigError::Invalid {
                key: "business hours",
                reason: format!("end {end_offset_secs}s is past midnight"),
            });
        }
        let mut weekdays = 0u8;
        for &day in active_weekdays {
            if !(1..=7).contains(&day) {
                return Err(ConfigError::Invalid {
                    key: "business days",
                    reason: format!("{day} is not an ISO weekday (1-7)"),
                });
            }
            weekdays |= 1 << (day - 1);
        }
        if weekdays == 0 {
            return Err(ConfigError::Missing("business days"));
        }
        Ok(Self {
            start_offset_secs,
            end_offset_secs,
            weekdays,
        })
    }

    /// `(start_offset_secs, end_offset_secs, active ISO weekdays ascending)`.
    pub fn window(&self) -> (u32, u32, Vec<u8>) {
        let days = (1..=7).filter(|d| self.weekdays & (1 << (d - 1)) != 0).collect();
        (self.start_offset_secs, self.end_offset_secs, days)
    }

    pub fn start_offset_secs(&self) -> u32 {
        self.start_offset_secs
    }

    pub fn end_offset_secs(&self) -> u32 {
        self.end_offset_secs
    }

    pub fn window_secs(&self) -> u32 {
        self.end_offset_secs - self.start_offset_secs
    }

    pub fn is_active_weekday(&self, weekday: Weekday) -> bool {
        self.weekdays & (1 << weekday.num_days_from_monday()) != 0
    }

    pub fn is_active(&self, date: NaiveDate) -> bool {
        self.is_active_weekday(date.weekday())
    }
}

/// Parse `HH:MM` or `HH:MM:SS` into seconds after midnight. `24:00` is accepted.
pub fn parse_time_of_day(s: &str) -> Option<u32> {
    let mut parts = s.trim().split(':');
    let h: u32 = parts.next()?.parse().ok()?;
    let m: u32 = parts.next()?.parse().ok()?;
    let sec: u32 = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() || h > 24 || m > 59 || sec > 59 {
        return None;
    }
    let total = h * 3_600 + m * 60 + sec;
    (total <= SECONDS_PER_DAY).then_some(total)
}

/// Parse a weekday list: `1,2,3,4,5` or a JSON array `[1,2,3,4,5]`.
pub fn parse_weekdays(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.starts_with('[') {
        return serde_json::from_str(s).ok();
    }
    s.split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.parse().ok())
        .collect()
}
