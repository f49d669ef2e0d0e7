// Domain-level errors for the simulation engine.

use std::fmt;

/// Errors surfaced by the engine controller, the dispatcher and the tick loop.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Start parameters were rejected; no state changed.
    Configuration { reason: String },
    /// `start` was called while another run is still active.
    ConcurrentStart { run_id: String },
    /// A pending request outlived its watchdog deadline.
    ComputationTimeout {
        unit: String,
        kind: String,
        after_ms: u64,
    },
    /// A unit reported a non-critical failure.
    Computation {
        unit: String,
        kind: String,
        message: String,
    },
    /// A unit reported a failure flagged critical; the run must halt.
    CriticalComputation { unit: String, message: String },
    /// A unit could not be reached or failed its ready handshake.
    UnitUnavailable { unit: String, reason: String },
    /// Persistence collaborator failure.
    Store(StoreError),
    /// Unexpected failure caught at the tick loop boundary.
    Internal { reason: String },
}

impl EngineError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { reason } => write!(f, "invalid configuration: {reason}"),
            Self::ConcurrentStart { run_id } => {
                write!(f, "simulation {run_id} is already active")
            }
            Self::ComputationTimeout {
                unit,
                kind,
                after_ms,
            } => write!(f, "{unit}/{kind} did not respond within {after_ms}ms"),
            Self::Computation {
                unit,
                kind,
                message,
            } => write!(f, "{unit}/{kind} failed: {message}"),
            Self::CriticalComputation { unit, message } => {
                write!(f, "critical failure in {unit}: {message}")
            }
            Self::UnitUnavailable { unit, reason } => {
                write!(f, "computation unit {unit} unavailable: {reason}")
            }
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Internal { reason } => write!(f, "internal engine failure: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            // A stored config that decodes but fails validation is still a configuration error.
            StoreError::Invalid { reason } => Self::Configuration { reason },
            other => Self::Store(other),
        }
    }
}

/// Errors returned by persistence adapters.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    NotFound { id: String },
    Io(String),
    Parse(String),
    /// The document decoded but describes an invalid configuration.
    Invalid { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "simulation {id} not found"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Parse(msg) => write!(f, "parse: {msg}"),
            Self::Invalid { reason } => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}
