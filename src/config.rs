use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;

use crate::calendar::{BusinessCalendar, parse_time_of_day, parse_weekdays};
use crate::duration::parse_iso_duration;
use crate::error::ConfigError;
use crate::limits::*;
use crate::model::DAY_MS;

/// Process settings, read once from `MEDSCHED_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub calendar: BusinessCalendar,
    pub search_horizon_days: u32,
    pub offer_hold: Duration,
    pub offer_horizons_days: Vec<u32>,
    pub accept_url: Option<String>,
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub seed_rooms: usize,
    pub generate: Option<GenerateSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateSettings {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub seed: u64,
    pub free_weekdays: Vec<u8>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (tests use a map).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let start_raw = get("MEDSCHED_BUSINESS_HOURS_START")
            .ok_or(ConfigError::Missing("MEDSCHED_BUSINESS_HOURS_START"))?;
        let end_raw = get("MEDSCHED_BUSINESS_HOURS_END")
            .ok_or(ConfigError::Missing("MEDSCHED_BUSINESS_HOURS_END"))?;
        let days_raw = get("MEDSCHED_BUSINESS_DAYS")
            .ok_or(ConfigError::Missing("MEDSCHED_BUSINESS_DAYS"))?;

        let start = parse_time_of_day(&start_raw).ok_or_else(|| ConfigError::Invalid {
            key: "MEDSCHED_BUSINESS_HOURS_START",
            reason: format!("expected HH:MM[:SS], got {start_raw:?}"),
        })?;
        let end = parse_time_of_day(&end_raw).ok_or_else(|| ConfigError::Invalid {
            key: "MEDSCHED_BUSINESS_HOURS_END",
            reason: format!("expected HH:MM[:SS], got {end_raw:?}"),
        })?;
        let days = parse_weekdays(&days_raw).ok_or_else(|| ConfigError::Invalid {
            key: "MEDSCHED_BUSINESS_DAYS",
            reason: format!("expected a weekday list, got {days_raw:?}"),
        })?;
        let calendar = BusinessCalendar::new(start, end, &days)?;

        let search_horizon_days = parse_or("MEDSCHED_SEARCH_HORIZON_DAYS", &get, DEFAULT_SEARCH_HORIZON_DAYS)?;
        if search_horizon_days == 0 || search_horizon_days > MAX_SEARCH_HORIZON_DAYS {
            return Err(ConfigError::Invalid {
                key: "MEDSCHED_SEARCH_HORIZON_DAYS",
                reason: format!("must be within 1..={MAX_SEARCH_HORIZON_DAYS}"),
            });
        }

        let offer_hold = match get("MEDSCHED_OFFER_HOLD") {
            Some(raw) => parse_iso_duration(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "MEDSCHED_OFFER_HOLD",
                reason: format!("expected an ISO-8601 duration, got {raw:?}"),
            })?,
            None => Duration::from_secs(30 * 60),
        };
        if offer_hold.is_zero() || offer_hold.as_millis() > MAX_OFFER_HOLD_MS as u128 {
            return Err(ConfigError::Invalid {
                key: "MEDSCHED_OFFER_HOLD",
                reason: format!("must be positive and at most {} days", MAX_OFFER_HOLD_MS / DAY_MS),
            });
        }

        let offer_horizons_days = match get("MEDSCHED_OFFER_HORIZONS") {
            Some(raw) => raw
                .split(',')
                .map(|p| p.trim().parse::<u32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConfigError::Invalid {
                    key: "MEDSCHED_OFFER_HORIZONS",
                    reason: e.to_string(),
                })?,
            None => vec![3, 10, 20],
        };
        if offer_horizons_days.is_empty() || offer_horizons_days.len() > MAX_OFFER_HORIZONS {
            return Err(ConfigError::Invalid {
                key: "MEDSCHED_OFFER_HORIZONS",
                reason: format!("between 1 and {MAX_OFFER_HORIZONS} horizons required"),
            });
        }

        let generate = match (get("MEDSCHED_GENERATE_FROM"), get("MEDSCHED_GENERATE_TO")) {
            (Some(from), Some(to)) => {
                let from = parse_date("MEDSCHED_GENERATE_FROM", &from)?;
                let to = parse_date("MEDSCHED_GENERATE_TO", &to)?;
                let free_raw = get("MEDSCHED_FREE_WEEKDAYS").unwrap_or_else(|| "6,7".into());
                let free_weekdays = parse_weekdays(&free_raw).ok_or_else(|| ConfigError::Invalid {
                    key: "MEDSCHED_FREE_WEEKDAYS",
                    reason: format!("expected a weekday list, got {free_raw:?}"),
                })?;
                Some(GenerateSettings {
                    from,
                    to,
                    seed: parse_or("MEDSCHED_GENERATE_SEED", &get, 42)?,
                    free_weekdays,
                })
            }
            _ => None,
        };

        Ok(Self {
            calendar,
            search_horizon_days,
            offer_hold,
            offer_horizons_days,
            accept_url: get("MEDSCHED_ACCEPT_URL").filter(|s| !s.is_empty()),
            data_dir: PathBuf::from(get("MEDSCHED_DATA_DIR").unwrap_or_else(|| "./data".into())),
            compact_threshold: parse_or("MEDSCHED_COMPACT_THRESHOLD", &get, 1000)?,
            metrics_port: parse_opt("MEDSCHED_METRICS_PORT", &get)?,
            seed_rooms: parse_or("MEDSCHED_SEED_ROOMS", &get, 0)?,
            generate,
        })
    }
}

fn parse_opt<T: std::str::FromStr>(
    key: &'static str,
    get: &impl Fn(&str) -> Option<String>,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    get: &impl Fn(&str) -> Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(key, get)?.unwrap_or(default))
}

fn parse_date(key: &'static str, raw: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}
