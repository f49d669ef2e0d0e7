use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::domain::CorrelationId;
use crate::domain::ports::IdGenerator;

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Monotonically increasing correlation ids seeded from the clock.
///
/// Seeding keeps ids from one engine instance distinct from a previous
/// instance's late replies.
pub struct SequentialIds {
    counter: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::starting_at(now_nanos())
    }

    pub fn starting_at(seed: u64) -> Self {
        Self {
            counter: AtomicU64::new(seed),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> CorrelationId {
        CorrelationId(self.counter.fetch_add(1, Ordering::Relaxed).to_string())
    }
}

/// Random v4 UUID correlation ids.
#[derive(Clone, Copy, Default)]
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn next_id(&self) -> CorrelationId {
        CorrelationId(uuid::Uuid::new_v4().to_string())
    }
}
