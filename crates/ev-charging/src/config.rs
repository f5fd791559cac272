use std::path::PathBuf;
use std::time::Duration;

use evc_central::RetryPolicy;
use evc_engine::EngineConfig;
use evc_engine::monitor::MonitorConfig;

use crate::error::AppError;

/// Timing and tuning parameters shared by every component, read from
/// `EVC_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub heartbeat_interval: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub down_backoff: Duration,
    pub command_timeout: Duration,
    pub command_retries: u32,
    pub telemetry_interval: Duration,
    pub kwh_per_tick: f64,
    pub registry_poll: Duration,
    pub data_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let failure_threshold = parse_or_default(&lookup, "EVC_FAILURE_THRESHOLD", 3_u32)?;
        if failure_threshold == 0 {
            return Err(AppError::config("EVC_FAILURE_THRESHOLD must be at least 1"));
        }
        let kwh_per_tick = parse_or_default(&lookup, "EVC_KWH_PER_TICK", 0.5_f64)?;
        if !kwh_per_tick.is_finite() || kwh_per_tick <= 0.0 {
            return Err(AppError::config("EVC_KWH_PER_TICK must be positive"));
        }

        Ok(Self {
            heartbeat_interval: millis(&lookup, "EVC_HEARTBEAT_INTERVAL_MS", 1000)?,
            probe_interval: millis(&lookup, "EVC_PROBE_INTERVAL_MS", 1000)?,
            probe_timeout: millis(&lookup, "EVC_PROBE_TIMEOUT_MS", 2000)?,
            failure_threshold,
            down_backoff: millis(&lookup, "EVC_DOWN_BACKOFF_MS", 3000)?,
            command_timeout: millis(&lookup, "EVC_COMMAND_TIMEOUT_MS", 2000)?,
            command_retries: parse_or_default(&lookup, "EVC_COMMAND_RETRIES", 1_u32)?,
            telemetry_interval: millis(&lookup, "EVC_TELEMETRY_INTERVAL_MS", 1000)?,
            kwh_per_tick,
            registry_poll: millis(&lookup, "EVC_REGISTRY_POLL_MS", 10_000)?,
            data_dir: lookup("EVC_DATA_DIR")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "data".to_string())
                .into(),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.command_timeout,
            retries: self.command_retries,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            probe_interval: self.probe_interval,
            probe_timeout: self.probe_timeout,
            failure_threshold: self.failure_threshold,
            down_backoff: self.down_backoff,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            telemetry_interval: self.telemetry_interval,
            kwh_per_tick: self.kwh_per_tick,
        }
    }
}

fn millis<F>(lookup: &F, key: &str, default: u64) -> Result<Duration, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or_default(lookup, key, default)?;
    if value == 0 {
        return Err(AppError::config(format!("{key} must be greater than zero")));
    }
    Ok(Duration::from_millis(value))
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}
