// Declarative termination predicates evaluated after each recorded tick.

use crate::domain::errors::EngineError;
use crate::domain::run::SimulationRun;
use serde::Serialize;

/// Default tolerance for `target-state-achieved` when none is configured.
pub const DEFAULT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StopCondition {
    /// Named scalar resource has reached zero or below.
    ResourceDepleted { resource: String },
    /// Every component of a named vector is within `tolerance` of `target`.
    TargetStateAchieved {
        vector: String,
        target: Vec<f64>,
        tolerance: f64,
    },
    /// Simulated time has reached `duration`.
    TimeElapsed { duration: f64 },
    /// Euclidean norm of a named vector has reached `distance`.
    DistanceReached { vector: String, distance: f64 },
    /// Unrecognised kind; never fires.
    Unknown { name: String },
}

impl StopCondition {
    pub fn kind(&self) -> &str {
        match self {
            Self::ResourceDepleted { .. } => "resource-depleted",
            Self::TargetStateAchieved { .. } => "target-state-achieved",
            Self::TimeElapsed { .. } => "time-elapsed",
            Self::DistanceReached { .. } => "distance-reached",
            Self::Unknown { name } => name.as_str(),
        }
    }

    /// Conditions whose firing means the run reached its goal.
    pub fn is_achievement(&self) -> bool {
        matches!(
            self,
            Self::TargetStateAchieved { .. } | Self::TimeElapsed { .. } | Self::DistanceReached { .. }
        )
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: &str| {
            Err(EngineError::configuration(format!(
                "stop condition {}: {reason}",
                self.kind()
            )))
        };
        match self {
            Self::ResourceDepleted { resource } if resource.trim().is_empty() => {
                invalid("resource name is required")
            }
            Self::TargetStateAchieved { vector, .. } if vector.trim().is_empty() => {
                invalid("vector name is required")
            }
            Self::TargetStateAchieved { target, .. } if target.is_empty() => {
                invalid("target must not be empty")
            }
            Self::TargetStateAchieved { target, .. } if target.iter().any(|t| !t.is_finite()) => {
                invalid("target values must be finite")
            }
            Self::TargetStateAchieved { tolerance, .. }
                if !(tolerance.is_finite() && *tolerance >= 0.0) =>
            {
                invalid("tolerance must be a non-negative number")
            }
            Self::TimeElapsed { duration } if !(duration.is_finite() && *duration >= 0.0) => {
                invalid("duration must be a non-negative number")
            }
            Self::DistanceReached { vector, .. } if vector.trim().is_empty() => {
                invalid("vector name is required")
            }
            Self::DistanceReached { distance, .. } if !(distance.is_finite() && *distance >= 0.0) => {
                invalid("distance must be a non-negative number")
            }
            _ => Ok(()),
        }
    }

    /// Evaluates this condition against a run snapshot.
    pub fn is_satisfied(&self, run: &SimulationRun) -> bool {
        match self {
            Self::ResourceDepleted { resource } => {
                run.state.scalar(resource).is_some_and(|v| v <= 0.0)
            }
            Self::TargetStateAchieved {
                vector,
                target,
                tolerance,
            } => run.state.vector(vector).is_some_and(|values| {
                values.len() == target.len()
                    && values
                        .iter()
                        .zip(target)
                        .all(|(v, t)| (v - t).abs() <= *tolerance)
            }),
            Self::TimeElapsed { duration } => run.time >= *duration,
            Self::DistanceReached { vector, distance } => run
                .state
                .vector(vector)
                .is_some_and(|values| magnitude(values) >= *distance),
            Self::Unknown { .. } => false,
        }
    }
}

fn magnitude(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// First condition (in declaration order) satisfied by the run, if any.
pub fn first_satisfied<'a>(
    run: &SimulationRun,
    conditions: &'a [StopCondition],
) -> Option<&'a StopCondition> {
    conditions.iter().find(|c| c.is_satisfied(run))
}

/// OR-combination of all conditions.
pub fn should_stop(run: &SimulationRun, conditions: &[StopCondition]) -> bool {
    first_satisfied(run, conditions).is_some()
}
