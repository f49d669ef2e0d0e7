use async_trait::async_trait;

use crate::domain::computation::{CorrelationId, UnitRequest};
use crate::domain::errors::StoreError;
use crate::domain::report::SimulationReport;
use crate::domain::run::SimulationConfig;

// Port for an independently executing worker. Replies travel back through the
// sink the unit was built with, not through `post`.
#[async_trait]
pub trait ComputationUnit: Send + Sync {
    fn name(&self) -> &str;
    async fn post(&self, request: UnitRequest) -> Result<(), String>;
}

// Port for correlation id generation.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> CorrelationId;
}

// Port for retrieving the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

// Port for loading stored simulation configurations.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load_config(&self, id: &str) -> Result<SimulationConfig, StoreError>;
}

// Port for persisting final reports.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store_result(&self, report: &SimulationReport) -> Result<(), StoreError>;
}
