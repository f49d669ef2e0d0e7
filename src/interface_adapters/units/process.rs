use async_trait::async_trait;
use std::ffi::OsStr;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::computation::control;
use crate::domain::ports::ComputationUnit;
use crate::domain::{EngineError, UnitMessage, UnitRequest};
use crate::use_cases::ReplySink;

/// Unit backed by a child process speaking newline-delimited JSON.
///
/// Requests are written to the child's stdin one per line; every line the
/// child prints on stdout must be a unit message. Stderr is inherited.
pub struct ProcessUnit {
    name: String,
    stdin: Mutex<ChildStdin>,
    // Held so the child is killed when the unit is dropped.
    _child: Mutex<Child>,
    terminating: Arc<AtomicBool>,
}

impl ProcessUnit {
    pub fn spawn<I, S>(sink: ReplySink, program: &str, args: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let name = sink.unit().to_string();
        let unavailable = |reason: String| EngineError::UnitUnavailable {
            unit: name.clone(),
            reason,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| unavailable(format!("failed to spawn {program}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| unavailable("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| unavailable("child stdout not captured".to_string()))?;

        let terminating = Arc::new(AtomicBool::new(false));
        tokio::spawn(read_replies(sink, stdout, terminating.clone()));
        info!(unit = %name, program, pid = child.id(), "unit process spawned");

        Ok(Self {
            name,
            stdin: Mutex::new(stdin),
            _child: Mutex::new(child),
            terminating,
        })
    }
}

async fn read_replies(sink: ReplySink, stdout: ChildStdout, terminating: Arc<AtomicBool>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(unit = sink.unit(), error = %e, "failed to read unit output");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let message = match serde_json::from_str::<UnitMessage>(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(unit = sink.unit(), error = %e, "ignoring malformed unit message");
                continue;
            }
        };
        if !sink.send(message).await {
            return;
        }
    }

    if terminating.load(Ordering::Acquire) {
        debug!(unit = sink.unit(), "unit process exited after terminate");
    } else {
        error!(unit = sink.unit(), "unit process exited unexpectedly");
        sink.send(UnitMessage::Error {
            id: None,
            error: "unit process exited".to_string(),
            critical: true,
        })
        .await;
    }
}

#[async_trait]
impl ComputationUnit for ProcessUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn post(&self, request: UnitRequest) -> Result<(), String> {
        if request.is_control() && request.kind == control::TERMINATE {
            self.terminating.store(true, Ordering::Release);
        }
        let mut line = serde_json::to_string(&request).map_err(|e| e.to_string())?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("write to unit {} failed: {e}", self.name))?;
        stdin.flush().await.map_err(|e| e.to_string())
    }
}
