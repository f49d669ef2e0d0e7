// Use cases layer: dispatch, tick scheduling and the engine controller.

pub mod dispatcher;
pub mod engine;
pub mod scheduler;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use dispatcher::{DispatchStats, Dispatcher, ReplySink};
pub use engine::{Engine, EngineDeps, RunOutcome};
pub use types::{BarrierMode, EngineEvent, EngineSettings};
