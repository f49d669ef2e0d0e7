use std::{env, fmt, path::PathBuf, time::Duration};

use crate::domain::TelemetrySettings;
use crate::use_cases::{BarrierMode, EngineSettings};

// Runtime constants (not per-simulation tuning).

pub const EVENT_BROADCAST_CAPACITY: usize = 1024;
pub const REPLY_CHANNEL_CAPACITY: usize = 1024;
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TICK_BUDGET: Duration = Duration::from_millis(1000 / 60);
// Completed ticks between statistics events.
pub const STATISTICS_INTERVAL: u64 = 10;

/// Invalid environment configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The variable is set but its value cannot be used.
    InvalidValue { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { var, value } => write!(f, "invalid value for {var}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Positive whole milliseconds; zero and anything unparsable are rejected.
pub fn parse_millis(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|millis| *millis > 0)
        .map(Duration::from_millis)
        .ok_or_else(|| ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        })
}

fn millis_var(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    match env::var(var) {
        Ok(value) => parse_millis(var, &value).map(Some),
        Err(_) => Ok(None),
    }
}

pub fn tick_budget() -> Result<Duration, ConfigError> {
    Ok(millis_var("SIM_TICK_BUDGET_MS")?.unwrap_or(DEFAULT_TICK_BUDGET))
}

// Unset means the watchdog is derived from the tick budget.
pub fn computation_timeout() -> Result<Option<Duration>, ConfigError> {
    millis_var("SIM_COMPUTATION_TIMEOUT_MS")
}

pub fn parse_barrier_mode(value: &str) -> Result<BarrierMode, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "strict" => Ok(BarrierMode::Strict),
        "soft" | "soft-real-time" | "soft_real_time" => Ok(BarrierMode::SoftRealTime),
        _ => Err(ConfigError::InvalidValue {
            var: "SIM_BARRIER_MODE",
            value: value.to_string(),
        }),
    }
}

pub fn barrier_mode() -> Result<BarrierMode, ConfigError> {
    match env::var("SIM_BARRIER_MODE") {
        Ok(value) => parse_barrier_mode(&value),
        Err(_) => Ok(BarrierMode::Strict),
    }
}

pub fn config_dir() -> PathBuf {
    env::var("SIM_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("simulations"))
}

pub fn reports_dir() -> PathBuf {
    env::var("SIM_REPORTS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("reports"))
}

// Config id loaded by the binary.
pub fn simulation_id() -> String {
    env::var("SIM_ID").unwrap_or_else(|_| "demo".to_string())
}

pub fn engine_settings() -> Result<EngineSettings, ConfigError> {
    Ok(EngineSettings {
        tick_budget: tick_budget()?,
        computation_timeout: computation_timeout()?,
        barrier: barrier_mode()?,
        handshake_timeout: HANDSHAKE_TIMEOUT,
        event_capacity: EVENT_BROADCAST_CAPACITY,
        reply_capacity: REPLY_CHANNEL_CAPACITY,
        telemetry: TelemetrySettings::default(),
        statistics_interval: STATISTICS_INTERVAL,
    })
}
