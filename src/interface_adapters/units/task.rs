use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::UNIT_QUEUE_CAPACITY;
use crate::domain::computation::control;
use crate::domain::ports::ComputationUnit;
use crate::domain::{UnitMessage, UnitRequest};
use crate::use_cases::ReplySink;

/// Error returned by a unit handler.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFailure {
    pub message: String,
    /// Critical failures halt the whole run.
    pub critical: bool,
}

impl UnitFailure {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            critical: false,
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            critical: true,
        }
    }
}

/// Synchronous computation run on the blocking thread pool.
pub trait UnitHandler: Send + Sync + 'static {
    fn handle(&self, kind: &str, payload: &Value) -> Result<Value, UnitFailure>;
}

impl<F> UnitHandler for F
where
    F: Fn(&str, &Value) -> Result<Value, UnitFailure> + Send + Sync + 'static,
{
    fn handle(&self, kind: &str, payload: &Value) -> Result<Value, UnitFailure> {
        self(kind, payload)
    }
}

// In-process unit: a tokio task that feeds requests to its handler one at a time.
pub struct TaskUnit {
    name: String,
    tx: mpsc::Sender<UnitRequest>,
}

impl TaskUnit {
    /// Spawns the worker task; replies go to `sink` under the sink's unit name.
    pub fn spawn(sink: ReplySink, handler: impl UnitHandler) -> Self {
        let (tx, rx) = mpsc::channel(UNIT_QUEUE_CAPACITY);
        let name = sink.unit().to_string();
        tokio::spawn(run_worker(sink, Arc::new(handler), rx));
        Self { name, tx }
    }
}

async fn run_worker(
    sink: ReplySink,
    handler: Arc<dyn UnitHandler>,
    mut rx: mpsc::Receiver<UnitRequest>,
) {
    while let Some(request) = rx.recv().await {
        let UnitRequest { kind, id, payload } = request;
        let reply = match id {
            None if kind == control::INIT => UnitMessage::Ready,
            None if kind == control::TERMINATE => break,
            None => {
                debug!(unit = sink.unit(), %kind, "control message");
                continue;
            }
            Some(id) => {
                let handler = handler.clone();
                match tokio::task::spawn_blocking(move || handler.handle(&kind, &payload)).await {
                    Ok(Ok(data)) => UnitMessage::Result { id, data },
                    Ok(Err(failure)) => UnitMessage::Error {
                        id: Some(id),
                        error: failure.message,
                        critical: failure.critical,
                    },
                    Err(e) => UnitMessage::Error {
                        id: Some(id),
                        error: format!("handler panicked: {e}"),
                        critical: true,
                    },
                }
            }
        };
        if !sink.send(reply).await {
            warn!(unit = sink.unit(), "dispatcher gone; unit worker exiting");
            return;
        }
    }
    info!(unit = sink.unit(), "unit worker terminated");
}

#[async_trait]
impl ComputationUnit for TaskUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn post(&self, request: UnitRequest) -> Result<(), String> {
        self.tx
            .send(request)
            .await
            .map_err(|_| format!("unit {} has terminated", self.name))
    }
}
