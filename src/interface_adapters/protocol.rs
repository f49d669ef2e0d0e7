// Wire DTOs for simulation configs and lifecycle events.
// Unit messages are serialized straight from the domain types.

use crate::domain::stop_conditions::DEFAULT_TOLERANCE;
use crate::domain::{EngineError, SimState, SimulationConfig, StopCondition, StoreError};
use crate::use_cases::EngineEvent;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

const DEFAULT_RESOURCE: &str = "fuel";
const DEFAULT_VECTOR: &str = "position";

fn default_real_time_factor() -> f64 {
    1.0
}

/// Simulation config as written by users (camelCase JSON or TOML).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfigDto {
    #[serde(default)]
    pub name: Option<String>,
    pub time_step: f64,
    pub max_iterations: u64,
    #[serde(default = "default_real_time_factor")]
    pub real_time_factor: f64,
    #[serde(default)]
    pub stop_conditions: Vec<StopConditionDto>,
    #[serde(default)]
    pub initial_state: Option<SimStateDto>,
    #[serde(default)]
    pub units: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimStateDto {
    #[serde(default)]
    pub scalars: BTreeMap<String, f64>,
    #[serde(default)]
    pub vectors: BTreeMap<String, Vec<f64>>,
}

/// `{kind, ...params}`; which params apply depends on the kind.
#[derive(Debug, Clone, Deserialize)]
pub struct StopConditionDto {
    pub kind: String,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub vector: Option<String>,
    #[serde(default)]
    pub target: Option<Vec<f64>>,
    #[serde(default)]
    pub tolerance: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub distance: Option<f64>,
}

impl TryFrom<StopConditionDto> for StopCondition {
    type Error = EngineError;

    fn try_from(dto: StopConditionDto) -> Result<Self, Self::Error> {
        let missing = |param: &str| {
            EngineError::configuration(format!("stop condition {} requires {param}", dto.kind))
        };
        let vector = || dto.vector.clone().unwrap_or_else(|| DEFAULT_VECTOR.to_string());

        let condition = match dto.kind.as_str() {
            "resource-depleted" => Self::ResourceDepleted {
                resource: dto
                    .resource
                    .clone()
                    .unwrap_or_else(|| DEFAULT_RESOURCE.to_string()),
            },
            "target-state-achieved" => Self::TargetStateAchieved {
                vector: vector(),
                target: dto.target.clone().ok_or_else(|| missing("target"))?,
                tolerance: dto.tolerance.unwrap_or(DEFAULT_TOLERANCE),
            },
            "time-elapsed" => Self::TimeElapsed {
                duration: dto.duration.ok_or_else(|| missing("duration"))?,
            },
            "distance-reached" => Self::DistanceReached {
                vector: vector(),
                distance: dto.distance.ok_or_else(|| missing("distance"))?,
            },
            other => Self::Unknown {
                name: other.to_string(),
            },
        };
        Ok(condition)
    }
}

impl From<SimStateDto> for SimState {
    fn from(dto: SimStateDto) -> Self {
        Self {
            scalars: dto.scalars,
            vectors: dto.vectors,
        }
    }
}

impl TryFrom<SimulationConfigDto> for SimulationConfig {
    type Error = EngineError;

    fn try_from(dto: SimulationConfigDto) -> Result<Self, Self::Error> {
        let stop_conditions = dto
            .stop_conditions
            .into_iter()
            .map(StopCondition::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let config = Self {
            name: dto.name.unwrap_or_else(|| "simulation".to_string()),
            time_step: dto.time_step,
            max_iterations: dto.max_iterations,
            real_time_factor: dto.real_time_factor,
            stop_conditions,
            initial_state: dto.initial_state.map(SimState::from).unwrap_or_default(),
            units: dto.units,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Serialization format of a stored config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

/// Decodes and validates a config document.
pub fn parse_config(text: &str, format: ConfigFormat) -> Result<SimulationConfig, StoreError> {
    let dto: SimulationConfigDto = match format {
        ConfigFormat::Json => {
            serde_json::from_str(text).map_err(|e| StoreError::Parse(e.to_string()))?
        }
        ConfigFormat::Toml => toml::from_str(text).map_err(|e| StoreError::Parse(e.to_string()))?,
    };
    SimulationConfig::try_from(dto).map_err(|e| match e {
        EngineError::Configuration { reason } => StoreError::Invalid { reason },
        other => StoreError::Parse(other.to_string()),
    })
}

/// One JSON line per lifecycle event: `{"type": ..., "data": ...}`.
pub fn encode_event(event: &EngineEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
