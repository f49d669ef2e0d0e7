// Domain layer: run state, stop conditions, telemetry and reports.

pub mod computation;
pub mod errors;
pub mod ports;
pub mod report;
pub mod run;
pub mod stop_conditions;
pub mod telemetry;

pub use computation::{
    ComputationOutcome, ComputationRequest, ComputationResult, CorrelationId, UnitMessage,
    UnitReply, UnitRequest,
};
pub use errors::{EngineError, StoreError};
pub use report::SimulationReport;
pub use run::{RunProgress, RunStatus, SimState, SimulationConfig, SimulationRun, Termination};
pub use stop_conditions::StopCondition;
pub use telemetry::{TelemetryBuffer, TelemetryFrame, TelemetrySettings, UnitSample};
