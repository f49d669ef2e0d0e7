use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use crate::domain::computation::control;
use crate::domain::ports::{Clock, ComputationUnit, IdGenerator};
use crate::domain::{CorrelationId, UnitMessage, UnitRequest};
use crate::use_cases::dispatcher::ReplySink;

// Shared fixed time source for deterministic use-case tests.
pub(crate) struct FixedClock(pub(crate) u64);

impl Clock for FixedClock {
    fn now_millis(&self) -> u64 {
        self.0
    }
}

// Deterministic correlation ids: "1", "2", ...
#[derive(Default)]
pub(crate) struct StepIds(AtomicU64);

impl IdGenerator for StepIds {
    fn next_id(&self) -> CorrelationId {
        CorrelationId((self.0.fetch_add(1, Ordering::Relaxed) + 1).to_string())
    }
}

pub(crate) type Script = Arc<dyn Fn(&UnitRequest) -> Vec<UnitMessage> + Send + Sync>;

// Replies to every computation request with an empty result.
pub(crate) fn reply_ok(request: &UnitRequest) -> Vec<UnitMessage> {
    match &request.id {
        Some(id) => vec![UnitMessage::Result {
            id: id.clone(),
            data: json!({}),
        }],
        None => Vec::new(),
    }
}

// Unit whose replies are computed by a closure and sent from a spawned task.
pub(crate) struct ScriptedUnit {
    name: String,
    sink: ReplySink,
    script: Script,
    handshake: bool,
    received: Arc<Mutex<Vec<UnitRequest>>>,
}

impl ScriptedUnit {
    pub(crate) fn new(
        sink: ReplySink,
        script: impl Fn(&UnitRequest) -> Vec<UnitMessage> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: sink.unit().to_string(),
            sink,
            script: Arc::new(script),
            handshake: true,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn silent(sink: ReplySink) -> Self {
        Self::new(sink, |_| Vec::new())
    }

    pub(crate) fn without_handshake(mut self) -> Self {
        self.handshake = false;
        self
    }

    pub(crate) fn received(&self) -> Arc<Mutex<Vec<UnitRequest>>> {
        self.received.clone()
    }
}

#[async_trait]
impl ComputationUnit for ScriptedUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn post(&self, request: UnitRequest) -> Result<(), String> {
        self.received
            .lock()
            .expect("received mutex poisoned")
            .push(request.clone());

        let replies = if request.kind == control::INIT {
            if self.handshake {
                vec![UnitMessage::Ready]
            } else {
                Vec::new()
            }
        } else if request.is_control() {
            Vec::new()
        } else {
            (self.script)(&request)
        };

        let sink = self.sink.clone();
        tokio::spawn(async move {
            for message in replies {
                sink.send(message).await;
            }
        });
        Ok(())
    }
}
