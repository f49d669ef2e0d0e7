// Request/response types exchanged with computation units.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Token pairing an outbound request with its eventual reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Control kinds understood by every unit in addition to its computation kinds.
pub mod control {
    /// Handshake; the unit answers with a `ready` message.
    pub const INIT: &str = "init";
    /// The run was stopped; abandon in-flight work.
    pub const STOP: &str = "stop";
    /// The engine is shutting down; release all resources.
    pub const TERMINATE: &str = "terminate";
}

/// Message posted to a unit: `{kind, id, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRequest {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    #[serde(default)]
    pub payload: Value,
}

impl UnitRequest {
    pub fn control(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            id: None,
            payload: Value::Null,
        }
    }

    pub fn is_control(&self) -> bool {
        self.id.is_none()
    }
}

/// A correlated computation issued by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputationRequest {
    pub id: CorrelationId,
    pub unit: String,
    pub kind: String,
    pub payload: Value,
    pub issued_at: u64,
}

impl ComputationRequest {
    pub fn to_unit_request(&self) -> UnitRequest {
        UnitRequest {
            kind: self.kind.clone(),
            id: Some(self.id.clone()),
            payload: self.payload.clone(),
        }
    }
}

/// Inbound message from a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UnitMessage {
    Ready,
    Result {
        id: CorrelationId,
        #[serde(default)]
        data: Value,
    },
    Error {
        #[serde(default)]
        id: Option<CorrelationId>,
        #[serde(default)]
        error: String,
        #[serde(default)]
        critical: bool,
    },
    Progress {
        #[serde(default)]
        id: Option<CorrelationId>,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        data: Value,
    },
}

impl UnitMessage {
    /// Correlation id for messages that resolve a pending request.
    pub fn resolves(&self) -> Option<&CorrelationId> {
        match self {
            Self::Result { id, .. } => Some(id),
            Self::Error { id: Some(id), .. } => Some(id),
            _ => None,
        }
    }
}

/// A unit message tagged with the unit that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitReply {
    pub unit: String,
    pub message: UnitMessage,
}

/// How a single computation resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ComputationOutcome {
    Completed { data: Value },
    Failed { error: String },
    /// Watchdog expired; the unit's output for the tick is absent.
    TimedOut { after_ms: u64 },
    /// Soft real-time barrier closed before the unit answered.
    Missed,
}

impl ComputationOutcome {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::TimedOut { .. } | Self::Missed)
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Completed { data } => Some(data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputationResult {
    pub id: CorrelationId,
    pub unit: String,
    pub kind: String,
    pub outcome: ComputationOutcome,
    pub critical: bool,
    pub completed_at: u64,
}

impl ComputationResult {
    pub fn is_critical_failure(&self) -> bool {
        self.critical && matches!(self.outcome, ComputationOutcome::Failed { .. })
    }
}
