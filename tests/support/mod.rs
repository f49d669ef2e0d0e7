// Shared engine builders and unit doubles for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;

use sim_engine::domain::ports::ComputationUnit;
use sim_engine::domain::computation::control;
use sim_engine::domain::{UnitMessage, UnitRequest};
use sim_engine::interface_adapters::state::{InMemoryStore, SystemClock};
use sim_engine::interface_adapters::units::{TaskUnit, UnitFailure};
use sim_engine::interface_adapters::utils::ids::SequentialIds;
use sim_engine::use_cases::ReplySink;
use sim_engine::{Engine, EngineDeps, EngineEvent, EngineSettings};

// Upper bound for any single run in these tests.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(10);

// Short ticks and a tight watchdog keep the scenarios fast.
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        tick_budget: Duration::from_millis(2),
        computation_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    }
}

// Engine wired to the system clock and an in-memory report sink.
pub fn engine(settings: EngineSettings) -> (Engine, InMemoryStore) {
    let store = InMemoryStore::default();
    let engine = Engine::new(
        settings,
        EngineDeps {
            ids: Arc::new(SequentialIds::new()),
            clock: Arc::new(SystemClock),
            results: Some(Arc::new(store.clone())),
        },
    );
    (engine, store)
}

pub async fn attach_task<H>(engine: &Engine, name: &str, kind: &str, handler: H)
where
    H: Fn(&str, &Value) -> Result<Value, UnitFailure> + Send + Sync + 'static,
{
    let unit = TaskUnit::spawn(engine.reply_sink(name), handler);
    engine
        .attach_unit(Arc::new(unit), vec![kind.to_string()])
        .await
        .expect("task unit should attach");
}

// Completes the handshake, then never answers a computation.
pub struct MuteUnit {
    sink: ReplySink,
}

#[async_trait]
impl ComputationUnit for MuteUnit {
    fn name(&self) -> &str {
        self.sink.unit()
    }

    async fn post(&self, request: UnitRequest) -> Result<(), String> {
        if request.is_control() && request.kind == control::INIT {
            self.sink.send(UnitMessage::Ready).await;
        }
        Ok(())
    }
}

// Answers every computation inline, echoing the tick's iteration as `seen`.
// Replies never leave the runtime, so it is safe under paused time.
pub struct EchoUnit {
    sink: ReplySink,
}

#[async_trait]
impl ComputationUnit for EchoUnit {
    fn name(&self) -> &str {
        self.sink.unit()
    }

    async fn post(&self, request: UnitRequest) -> Result<(), String> {
        if request.is_control() {
            if request.kind == control::INIT {
                self.sink.send(UnitMessage::Ready).await;
            }
            return Ok(());
        }
        if let Some(id) = request.id {
            let data = json!({ "scalars": { "seen": request.payload["iteration"] } });
            self.sink.send(UnitMessage::Result { id, data }).await;
        }
        Ok(())
    }
}

pub async fn attach_echo(engine: &Engine, name: &str, kind: &str) {
    let unit = EchoUnit {
        sink: engine.reply_sink(name),
    };
    engine
        .attach_unit(Arc::new(unit), vec![kind.to_string()])
        .await
        .expect("echo unit should attach");
}

pub async fn attach_mute(engine: &Engine, name: &str, kind: &str) {
    let unit = MuteUnit {
        sink: engine.reply_sink(name),
    };
    engine
        .attach_unit(Arc::new(unit), vec![kind.to_string()])
        .await
        .expect("mute unit should attach");
}

// Collects events until (and including) the first terminal event.
pub async fn collect_until_terminal(
    mut events: broadcast::Receiver<EngineEvent>,
) -> Vec<EngineEvent> {
    let collect = async {
        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    seen.push(event);
                    if terminal {
                        return seen;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    panic!("test subscriber lagged by {n} events")
                }
                Err(broadcast::error::RecvError::Closed) => return seen,
            }
        }
    };
    tokio::time::timeout(RUN_TIMEOUT, collect)
        .await
        .expect("run should finish in time")
}

pub fn step_iterations(events: &[EngineEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Step { iteration, .. } => Some(*iteration),
            _ => None,
        })
        .collect()
}
