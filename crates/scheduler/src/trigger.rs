//! Trigger validation and next-fire computation.
//!
//! Registration-time validation turns a caller-supplied `trigger_config`
//! into its canonical form (for `date` triggers the absolute instant is
//! materialized here). [`next_fire`] is the pure evaluator used by the
//! scheduler both when persisting `next_run` and when arming timers.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::task::TriggerType;

/// Errors from trigger validation or evaluation.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("Invalid trigger config: {0}")]
    InvalidConfig(String),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Invalid run_date '{0}': expected an ISO-8601 timestamp")]
    InvalidDate(String),
}

// ── Config shapes ───────────────────────────────────────────────────

/// Interval trigger: any combination of the four unit fields, each > 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntervalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<f64>,
}

impl IntervalConfig {
    /// Total period in whole milliseconds (minimum 1 ms).
    pub fn delta_ms(&self) -> Result<u64, TriggerError> {
        let mut any = false;
        let mut total = 0.0_f64;
        for (value, unit_ms) in [
            (self.seconds, 1_000.0),
            (self.minutes, 60_000.0),
            (self.hours, 3_600_000.0),
            (self.days, 86_400_000.0),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v <= 0.0 {
                    return Err(TriggerError::InvalidConfig(
                        "interval values must be positive numbers".to_string(),
                    ));
                }
                any = true;
                total += v * unit_ms;
            }
        }
        if !any {
            return Err(TriggerError::InvalidConfig(
                "interval requires at least one of seconds, minutes, hours, days".to_string(),
            ));
        }
        Ok((total.round() as u64).max(1))
    }
}

/// Cron trigger: a five-field cron expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CronConfig {
    pub expression: String,
}

/// Date trigger as supplied by the caller: an explicit instant and/or a
/// relative delay. The canonical stored form carries only `run_date`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DateConfig {
    #[serde(default)]
    pub run_date: Option<String>,
    #[serde(default)]
    pub delay_seconds: Option<f64>,
    #[serde(default)]
    pub delay_minutes: Option<f64>,
    #[serde(default)]
    pub delay_hours: Option<f64>,
    #[serde(default)]
    pub delay_days: Option<f64>,
}

impl DateConfig {
    /// Combined delay in whole milliseconds, if any delay field was given.
    fn delay_ms(&self) -> Result<Option<u64>, TriggerError> {
        let mut any = false;
        let mut total = 0.0_f64;
        for (value, unit_ms) in [
            (self.delay_seconds, 1_000.0),
            (self.delay_minutes, 60_000.0),
            (self.delay_hours, 3_600_000.0),
            (self.delay_days, 86_400_000.0),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(TriggerError::InvalidConfig(
                        "delay values must be non-negative numbers".to_string(),
                    ));
                }
                any = true;
                total += v * unit_ms;
            }
        }
        Ok(any.then(|| total.round() as u64))
    }
}

// ── Validation ──────────────────────────────────────────────────────

/// Validate a caller-supplied trigger config and return its canonical form.
///
/// For `date` triggers the absolute instant is materialized: an instant that
/// is already past is re-anchored at `now + delay` when a delay was given,
/// or `now + 1s` otherwise. Unknown keys fail validation for every family.
pub fn validate_trigger(
    trigger_type: TriggerType,
    config: &Value,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Value, TriggerError> {
    match trigger_type {
        TriggerType::Interval => {
            let interval: IntervalConfig = parse_config(config)?;
            interval.delta_ms()?;
            Ok(serde_json::to_value(&interval)
                .map_err(|e| TriggerError::InvalidConfig(e.to_string()))?)
        }
        TriggerType::Cron => {
            let cron: CronConfig = parse_config(config)?;
            parse_cron(&cron.expression)?;
            Ok(serde_json::to_value(&cron)
                .map_err(|e| TriggerError::InvalidConfig(e.to_string()))?)
        }
        TriggerType::Date => {
            let date: DateConfig = parse_config(config)?;
            let delay_ms = date.delay_ms()?;
            let explicit = date
                .run_date
                .as_deref()
                .map(|raw| parse_instant(raw, tz))
                .transpose()?;

            let mut run_date = match (explicit, delay_ms) {
                (Some(instant), _) => instant,
                (None, Some(ms)) => now + ChronoDuration::milliseconds(ms as i64),
                (None, None) => {
                    return Err(TriggerError::InvalidConfig(
                        "date trigger requires run_date or a delay".to_string(),
                    ))
                }
            };

            // Re-materialize past instants.
            if run_date <= now {
                run_date = match delay_ms {
                    Some(ms) => now + ChronoDuration::milliseconds(ms as i64),
                    None => now + ChronoDuration::seconds(1),
                };
            }

            Ok(serde_json::json!({ "run_date": run_date.to_rfc3339() }))
        }
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(config: &Value) -> Result<T, TriggerError> {
    if !config.is_object() {
        return Err(TriggerError::InvalidConfig(
            "trigger_config must be an object".to_string(),
        ));
    }
    serde_json::from_value(config.clone()).map_err(|e| TriggerError::InvalidConfig(e.to_string()))
}

/// Parse an ISO-8601 timestamp; a naive timestamp is interpreted in `tz`.
fn parse_instant(raw: &str, tz: Tz) -> Result<DateTime<Utc>, TriggerError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            if let Some(local) = tz.from_local_datetime(&naive).earliest() {
                return Ok(local.with_timezone(&Utc));
            }
        }
    }
    Err(TriggerError::InvalidDate(raw.to_string()))
}

// ── Cron handling ───────────────────────────────────────────────────

/// Parse a five-field cron expression.
///
/// The `cron` crate wants six fields (with seconds); the public contract is
/// standard five-field cron, so a seconds field of `0` is prepended and any
/// other field count is rejected.
pub fn parse_cron(expression: &str) -> Result<Schedule, TriggerError> {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() != 5 {
        return Err(TriggerError::InvalidCron {
            expression: expression.to_string(),
            reason: "expected 5 fields (minute hour day-of-month month day-of-week)".to_string(),
        });
    }
    Schedule::from_str(&format!("0 {trimmed}")).map_err(|e| TriggerError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

// ── Evaluation ──────────────────────────────────────────────────────

/// Compute the next fire instant for a trigger, or `None` when the trigger
/// cannot fire again.
///
/// A `previously_planned` instant that is still in the future is returned
/// unchanged, preserving the tick schedule across restarts.
pub fn next_fire(
    trigger_type: TriggerType,
    config: &Value,
    reference: DateTime<Utc>,
    tz: Tz,
    previously_planned: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>, TriggerError> {
    match trigger_type {
        TriggerType::Interval => {
            if let Some(planned) = previously_planned {
                if planned > reference {
                    return Ok(Some(planned));
                }
            }
            let interval: IntervalConfig = parse_config(config)?;
            let delta = interval.delta_ms()?;
            Ok(Some(reference + ChronoDuration::milliseconds(delta as i64)))
        }
        TriggerType::Cron => {
            if let Some(planned) = previously_planned {
                if planned > reference {
                    return Ok(Some(planned));
                }
            }
            let cron: CronConfig = parse_config(config)?;
            let schedule = parse_cron(&cron.expression)?;
            let local_ref = reference.with_timezone(&tz);
            Ok(schedule
                .after(&local_ref)
                .next()
                .map(|dt| dt.with_timezone(&Utc)))
        }
        TriggerType::Date => {
            let run_date = run_date_of(config)?;
            Ok((run_date > reference).then_some(run_date))
        }
    }
}

/// Extract the materialized `run_date` from a canonical date config.
pub fn run_date_of(config: &Value) -> Result<DateTime<Utc>, TriggerError> {
    let raw = config
        .get("run_date")
        .and_then(Value::as_str)
        .ok_or_else(|| TriggerError::InvalidConfig("date trigger missing run_date".to_string()))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TriggerError::InvalidDate(raw.to_string()))
}

// ── Tests ───────────────────────────────────────────────────────────
