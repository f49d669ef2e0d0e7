// Computation unit backends: in-process tasks and child processes.

pub mod process;
pub mod task;

pub use process::ProcessUnit;
pub use task::{TaskUnit, UnitFailure, UnitHandler};

/// Queued requests per unit before `post` waits.
pub const UNIT_QUEUE_CAPACITY: usize = 256;
