// Run configuration, lifecycle state machine and mutable run state.

use crate::domain::errors::EngineError;
use crate::domain::stop_conditions::StopCondition;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Lifecycle state of the engine's current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl RunStatus {
    /// Running or Paused: a run exists and has not been finalized.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Error)
    }

    /// Legal edges of the run state machine.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (_, Error) => true,
            (Idle | Stopped | Completed | Error, Running) => true,
            (Running, Paused | Completed) => true,
            (Paused, Running) => true,
            (Running | Paused, Stopped) => true,
            _ => false,
        }
    }
}

/// Named scalars and vectors describing the simulated system.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimState {
    pub scalars: BTreeMap<String, f64>,
    pub vectors: BTreeMap<String, Vec<f64>>,
}

impl SimState {
    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).copied()
    }

    pub fn vector(&self, name: &str) -> Option<&[f64]> {
        self.vectors.get(name).map(Vec::as_slice)
    }

    /// Merges a unit result into the state.
    ///
    /// Only `scalars` / `vectors` objects inside an object payload are read;
    /// entries that are not numbers (or arrays of numbers) are ignored.
    pub fn apply_update(&mut self, data: &Value) {
        if let Some(scalars) = data.get("scalars").and_then(Value::as_object) {
            for (name, value) in scalars {
                if let Some(v) = value.as_f64() {
                    self.scalars.insert(name.clone(), v);
                }
            }
        }
        if let Some(vectors) = data.get("vectors").and_then(Value::as_object) {
            for (name, value) in vectors {
                let Some(items) = value.as_array() else {
                    continue;
                };
                let parsed: Option<Vec<f64>> = items.iter().map(Value::as_f64).collect();
                if let Some(v) = parsed {
                    self.vectors.insert(name.clone(), v);
                }
            }
        }
    }
}

/// Validated input for a single simulation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationConfig {
    pub name: String,
    /// Simulated seconds advanced per tick (before the real-time factor).
    pub time_step: f64,
    pub max_iterations: u64,
    pub real_time_factor: f64,
    pub stop_conditions: Vec<StopCondition>,
    pub initial_state: SimState,
    /// Attached units taking part in this run; `None` means all of them.
    pub units: Option<Vec<String>>,
}

impl SimulationConfig {
    pub fn new(time_step: f64, max_iterations: u64) -> Self {
        Self {
            name: "simulation".to_string(),
            time_step,
            max_iterations,
            real_time_factor: 1.0,
            stop_conditions: Vec::new(),
            initial_state: SimState::default(),
            units: None,
        }
    }

    pub fn with_stop_condition(mut self, condition: StopCondition) -> Self {
        self.stop_conditions.push(condition);
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.time_step.is_finite() && self.time_step > 0.0) {
            return Err(EngineError::configuration(format!(
                "timeStep must be a positive number, got {}",
                self.time_step
            )));
        }
        if self.max_iterations == 0 {
            return Err(EngineError::configuration("maxIterations must be > 0"));
        }
        if !(self.real_time_factor.is_finite() && self.real_time_factor > 0.0) {
            return Err(EngineError::configuration(format!(
                "realTimeFactor must be a positive number, got {}",
                self.real_time_factor
            )));
        }
        for condition in &self.stop_conditions {
            condition.validate()?;
        }
        Ok(())
    }

    /// Simulated seconds covered by one tick.
    pub fn tick_span(&self) -> f64 {
        self.time_step * self.real_time_factor
    }
}

/// Why a run left the tick loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum Termination {
    /// Reached `max_iterations` without any stop condition firing.
    Exhausted,
    /// A stop condition was satisfied after a recorded tick.
    Condition { condition: StopCondition },
    /// Stopped through the controller.
    Stopped,
    /// Critical unit failure or an unexpected loop failure.
    Failed { cause: String },
}

impl Termination {
    pub fn terminal_status(&self) -> RunStatus {
        match self {
            Self::Exhausted | Self::Condition { .. } => RunStatus::Completed,
            Self::Stopped => RunStatus::Stopped,
            Self::Failed { .. } => RunStatus::Error,
        }
    }

    /// Only achievement-style stop conditions count as mission success.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Condition { condition } => condition.is_achievement(),
            _ => false,
        }
    }
}

/// A single simulation run owned by the step scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationRun {
    pub id: String,
    pub config: SimulationConfig,
    pub status: RunStatus,
    pub iteration: u64,
    pub time: f64,
    pub progress: f64,
    pub state: SimState,
    pub started_at: u64,
    pub last_update: u64,
    pub ended_at: Option<u64>,
}

impl SimulationRun {
    pub fn new(id: String, config: SimulationConfig, now_ms: u64) -> Self {
        let state = config.initial_state.clone();
        Self {
            id,
            config,
            status: RunStatus::Running,
            iteration: 0,
            time: 0.0,
            progress: 0.0,
            state,
            started_at: now_ms,
            last_update: now_ms,
            ended_at: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.iteration >= self.config.max_iterations
    }

    /// Completes one step: +1 iteration, recomputed time and progress.
    pub fn advance(&mut self, now_ms: u64) {
        debug_assert!(!self.is_exhausted());
        self.iteration += 1;
        // Derived from the iteration count so long runs do not accumulate drift.
        self.time = self.iteration as f64 * self.config.tick_span();
        self.progress = self.iteration as f64 / self.config.max_iterations as f64 * 100.0;
        self.last_update = now_ms;
    }

    pub fn finish(&mut self, status: RunStatus, now_ms: u64) {
        self.status = status;
        self.ended_at = Some(now_ms);
        self.last_update = now_ms;
    }

    /// Read-only view handed to computation units.
    pub fn snapshot_payload(&self) -> Value {
        serde_json::json!({
            "runId": self.id,
            "iteration": self.iteration + 1,
            "time": self.time,
            "timeStep": self.config.time_step,
            "realTimeFactor": self.config.real_time_factor,
            "scalars": self.state.scalars,
            "vectors": self.state.vectors,
        })
    }

    pub fn progress_snapshot(&self) -> RunProgress {
        RunProgress {
            run_id: Some(self.id.clone()),
            iteration: self.iteration,
            time: self.time,
            progress: self.progress,
        }
    }
}

/// Externally observable position of the current run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub run_id: Option<String>,
    pub iteration: u64,
    pub time: f64,
    pub progress: f64,
}
