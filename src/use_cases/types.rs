// Use-case level settings and lifecycle events for the engine.

use crate::domain::{SimulationReport, TelemetryFrame, TelemetrySettings};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Lower bound for the default per-request watchdog.
pub const MIN_COMPUTATION_TIMEOUT: Duration = Duration::from_millis(250);
/// Default watchdog is this many tick budgets (subject to the floor above).
pub const TIMEOUT_BUDGET_MULTIPLIER: u32 = 8;

/// How the per-tick barrier treats slow units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarrierMode {
    /// Wait for every result or its watchdog before advancing.
    #[default]
    Strict,
    /// Close the barrier at the tick budget; stragglers miss the tick.
    SoftRealTime,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Target wall time per tick; shorter ticks sleep for the remainder.
    pub tick_budget: Duration,
    /// Per-request watchdog; `None` derives it from the tick budget.
    pub computation_timeout: Option<Duration>,
    pub barrier: BarrierMode,
    /// How long a unit may take to answer the `init` handshake.
    pub handshake_timeout: Duration,
    pub event_capacity: usize,
    pub reply_capacity: usize,
    pub telemetry: TelemetrySettings,
    /// Completed ticks between statistics events (0 disables them).
    pub statistics_interval: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_budget: Duration::from_millis(1000 / 60),
            computation_timeout: None,
            barrier: BarrierMode::Strict,
            handshake_timeout: Duration::from_secs(5),
            event_capacity: 1024,
            reply_capacity: 1024,
            telemetry: TelemetrySettings::default(),
            statistics_interval: 10,
        }
    }
}

impl EngineSettings {
    pub fn watchdog(&self) -> Duration {
        self.computation_timeout
            .unwrap_or_else(|| (self.tick_budget * TIMEOUT_BUDGET_MULTIPLIER).max(MIN_COMPUTATION_TIMEOUT))
    }

    /// Deadline applied to each request of a tick.
    pub fn request_deadline(&self) -> Duration {
        match self.barrier {
            BarrierMode::Strict => self.watchdog(),
            BarrierMode::SoftRealTime => self.tick_budget.min(self.watchdog()),
        }
    }
}

/// Lifecycle events published to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum EngineEvent {
    Started {
        run_id: String,
        name: String,
        max_iterations: u64,
        timestamp: u64,
    },
    Step {
        iteration: u64,
        time: f64,
        progress: f64,
        frame: TelemetryFrame,
    },
    Paused {
        run_id: String,
        iteration: u64,
    },
    Resumed {
        run_id: String,
        iteration: u64,
    },
    Stopped {
        report: SimulationReport,
    },
    Completed {
        report: SimulationReport,
    },
    Error {
        cause: String,
        report: SimulationReport,
    },
    UnitProgress {
        unit: String,
        progress: Option<f64>,
        data: Value,
    },
    UnitError {
        unit: String,
        kind: Option<String>,
        iteration: Option<u64>,
        error: String,
    },
    Statistics {
        iteration: u64,
        ticks_per_second: f64,
        mean_compute_ms: f64,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Step { .. } => "step",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
            Self::Stopped { .. } => "stopped",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::UnitProgress { .. } => "unitProgress",
            Self::UnitError { .. } => "unitError",
            Self::Statistics { .. } => "statistics",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped { .. } | Self::Completed { .. } | Self::Error { .. }
        )
    }
}
