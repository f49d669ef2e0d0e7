use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::interface_adapters::protocol::encode_event;
use crate::use_cases::EngineEvent;

/// Serializes lifecycle events as NDJSON into `out` until a run finishes.
///
/// Returns how many events were written. Lagging skips ahead; a closed
/// channel ends the journal like a terminal event does.
pub async fn journal_events<W>(
    mut events_rx: broadcast::Receiver<EngineEvent>,
    mut out: W,
) -> std::io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    loop {
        match events_rx.recv().await {
            Ok(event) => {
                let line = match encode_event(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(error = ?e, event = event.name(), "failed to serialize event");
                        continue;
                    }
                };
                log_event(&event);

                out.write_all(line.as_bytes()).await?;
                out.write_all(b"\n").await?;
                written += 1;

                if event.is_terminal() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "event journal lagged; skipping ahead");
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("event channel closed; journal exiting");
                break;
            }
        }
    }
    out.flush().await?;
    Ok(written)
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::Step {
            iteration,
            time,
            progress,
            ..
        } => debug!(iteration, time, progress, "step"),
        EngineEvent::Statistics {
            iteration,
            ticks_per_second,
            mean_compute_ms,
        } => info!(iteration, ticks_per_second, mean_compute_ms, "statistics"),
        EngineEvent::UnitProgress { unit, progress, .. } => {
            debug!(%unit, ?progress, "unit progress")
        }
        EngineEvent::Completed { report }
        | EngineEvent::Stopped { report }
        | EngineEvent::Error { report, .. } => info!(
            event = event.name(),
            run_id = %report.run_id,
            iterations = report.iterations,
            success = report.success,
            "run finished"
        ),
        other => debug!(event = other.name(), "engine event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn when_channel_closes_then_journal_flushes_what_it_saw() {
        let (events, events_rx) = broadcast::channel(8);
        events
            .send(EngineEvent::Paused {
                run_id: "r".into(),
                iteration: 3,
            })
            .expect("subscriber");
        events
            .send(EngineEvent::Resumed {
                run_id: "r".into(),
                iteration: 3,
            })
            .expect("subscriber");
        drop(events);

        let mut out = Vec::new();
        let written = journal_events(events_rx, &mut out).await.expect("journal");

        assert_eq!(written, 2);
        let text = String::from_utf8(out).expect("utf8");
        let kinds: Vec<String> = text
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).expect("json line");
                value["type"].as_str().unwrap_or_default().to_string()
            })
            .collect();
        assert_eq!(kinds, vec!["paused", "resumed"]);
    }
}
