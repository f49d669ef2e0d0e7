// Tick loop driving a single run from start to finalization.

use crate::domain::computation::control;
use crate::domain::ports::{Clock, ResultSink};
use crate::domain::report;
use crate::domain::stop_conditions;
use crate::domain::{
    ComputationOutcome, ComputationResult, EngineError, RunStatus, SimulationRun,
    TelemetryBuffer, TelemetryFrame, Termination, UnitSample,
};
use crate::use_cases::dispatcher::Dispatcher;
use crate::use_cases::engine::{Closing, Lifecycle, RunOutcome};
use crate::use_cases::types::{BarrierMode, EngineEvent, EngineSettings};
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// One request issued on every tick.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlannedRequest {
    pub(crate) unit: String,
    pub(crate) kind: String,
}

pub(crate) struct StepScheduler {
    pub(crate) run: SimulationRun,
    pub(crate) plan: Vec<PlannedRequest>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) settings: EngineSettings,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) results: Option<Arc<dyn ResultSink>>,
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) telemetry: TelemetryBuffer,
    pub(crate) started: Instant,
}

// Resolves once the run is no longer Running.
async fn left_running(status_rx: &mut watch::Receiver<RunStatus>) {
    if status_rx
        .wait_for(|status| *status != RunStatus::Running)
        .await
        .is_err()
    {
        // Sender dropped: nothing can change the status any more.
        std::future::pending::<()>().await;
    }
}

async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    if stop_rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// Resolves once the run is paused or asked to stop.
async fn interrupted(
    status_rx: &mut watch::Receiver<RunStatus>,
    stop_rx: &mut watch::Receiver<bool>,
) {
    tokio::select! {
        _ = left_running(status_rx) => {}
        _ = stop_requested(stop_rx) => {}
    }
}

// Parks until the status changes or a stop arrives.
async fn parked(
    status_rx: &mut watch::Receiver<RunStatus>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<(), EngineError> {
    tokio::select! {
        changed = status_rx.changed() => changed.map_err(|_| EngineError::Internal {
            reason: "status channel closed".to_string(),
        }),
        _ = stop_requested(stop_rx) => Ok(()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "tick loop panicked".to_string())
}

impl StepScheduler {
    /// Runs the tick loop to completion and finalizes the run.
    pub(crate) async fn drive(mut self) {
        let span = info_span!("run", run_id = %self.run.id);
        let termination = match AssertUnwindSafe(self.run_loop())
            .catch_unwind()
            .instrument(span.clone())
            .await
        {
            Ok(Ok(termination)) => termination,
            Ok(Err(error)) => Termination::Failed {
                cause: error.to_string(),
            },
            Err(payload) => Termination::Failed {
                cause: EngineError::Internal {
                    reason: panic_message(payload),
                }
                .to_string(),
            },
        };
        self.finalize(termination).instrument(span).await;
    }

    async fn run_loop(&mut self) -> Result<Termination, EngineError> {
        let mut status_rx = self.lifecycle.status_tx.subscribe();
        let mut stop_rx = self.lifecycle.stop_tx.subscribe();

        loop {
            if *stop_rx.borrow_and_update() {
                return Ok(Termination::Stopped);
            }
            let status = *status_rx.borrow_and_update();
            match status {
                RunStatus::Running => {}
                RunStatus::Paused => {
                    debug!(iteration = self.run.iteration, "parked at tick boundary");
                    parked(&mut status_rx, &mut stop_rx).await?;
                    continue;
                }
                other => {
                    return Err(EngineError::Internal {
                        reason: format!("tick loop observed {other:?} state"),
                    });
                }
            }

            if self.run.is_exhausted() {
                return self
                    .settle(Termination::Exhausted, &mut status_rx, &mut stop_rx)
                    .await;
            }
            if let Some(error) = self.dispatcher.take_poison() {
                return Err(error);
            }

            let tick_start = Instant::now();
            let batch = tokio::select! {
                batch = self.fan_out() => batch,
                _ = interrupted(&mut status_rx, &mut stop_rx) => {
                    debug!(
                        iteration = self.run.iteration + 1,
                        "run interrupted during barrier; tick discarded"
                    );
                    continue;
                }
            };
            if *stop_rx.borrow() || *status_rx.borrow() != RunStatus::Running {
                debug!(
                    iteration = self.run.iteration + 1,
                    "run interrupted as the barrier resolved; tick discarded"
                );
                continue;
            }
            let batch = batch?;
            if let Some(error) = self.dispatcher.take_poison() {
                return Err(error);
            }

            self.record_tick(batch, tick_start.elapsed());

            // Pacing keeps the iteration rate independent of unit latency.
            let remaining = self.settings.tick_budget.saturating_sub(tick_start.elapsed());
            if !remaining.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = interrupted(&mut status_rx, &mut stop_rx) => {}
                }
            }

            if let Some(condition) =
                stop_conditions::first_satisfied(&self.run, &self.run.config.stop_conditions)
            {
                info!(
                    condition = condition.kind(),
                    iteration = self.run.iteration,
                    "stop condition satisfied"
                );
                let finished = Termination::Condition {
                    condition: condition.clone(),
                };
                return self.settle(finished, &mut status_rx, &mut stop_rx).await;
            }
            if self.run.is_exhausted() {
                return self
                    .settle(Termination::Exhausted, &mut status_rx, &mut stop_rx)
                    .await;
            }
        }
    }

    /// Ends a run that reached its natural end at a tick boundary.
    ///
    /// A paused run stays parked until it is resumed or stopped; a stop
    /// requested before this point takes precedence over the finish.
    async fn settle(
        &self,
        finished: Termination,
        status_rx: &mut watch::Receiver<RunStatus>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<Termination, EngineError> {
        loop {
            match self.lifecycle.close() {
                Closing::Finish => return Ok(finished),
                Closing::Stop => return Ok(Termination::Stopped),
                Closing::Parked => {
                    debug!(iteration = self.run.iteration, "parked before finishing");
                    parked(status_rx, stop_rx).await?;
                }
            }
        }
    }

    /// Issues every planned request concurrently and waits for the whole batch.
    ///
    /// Results come back in plan order regardless of arrival order. A critical
    /// failure aborts the barrier; the remaining requests are cancelled when
    /// their futures are dropped.
    async fn fan_out(&self) -> Result<Vec<ComputationResult>, EngineError> {
        let payload = self.run.snapshot_payload();
        let deadline = self.settings.request_deadline();

        let mut inflight: FuturesUnordered<_> = self
            .plan
            .iter()
            .enumerate()
            .map(|(slot, planned)| {
                let payload = payload.clone();
                async move {
                    let result = self
                        .dispatcher
                        .dispatch(&planned.unit, &planned.kind, payload, deadline)
                        .await;
                    (slot, result)
                }
            })
            .collect();

        let mut slots: Vec<Option<ComputationResult>> = self.plan.iter().map(|_| None).collect();
        while let Some((slot, result)) = inflight.next().await {
            if result.is_critical_failure() {
                let message = match result.outcome {
                    ComputationOutcome::Failed { error } => error,
                    _ => String::new(),
                };
                return Err(EngineError::CriticalComputation {
                    unit: result.unit,
                    message,
                });
            }
            slots[slot] = Some(result);
        }
        Ok(slots.into_iter().flatten().collect())
    }

    fn record_tick(&mut self, batch: Vec<ComputationResult>, compute_time: Duration) {
        let soft = self.settings.barrier == BarrierMode::SoftRealTime;

        let mut samples = Vec::with_capacity(batch.len());
        for result in batch {
            if let Some(data) = result.outcome.data() {
                self.run.state.apply_update(data);
            }
            let outcome = match result.outcome {
                ComputationOutcome::TimedOut { .. } if soft => ComputationOutcome::Missed,
                other => other,
            };
            samples.push(UnitSample {
                unit: result.unit,
                kind: result.kind,
                outcome,
            });
        }

        self.run.advance(self.clock.now_millis());
        let iteration = self.run.iteration;
        self.report_unit_failures(iteration, &samples);

        let frame = TelemetryFrame {
            iteration,
            time: self.run.time,
            timestamp: self.run.last_update,
            compute_ms: compute_time.as_secs_f64() * 1000.0,
            state: self.run.state.clone(),
            samples,
        };
        self.telemetry.record(frame.clone());
        self.lifecycle
            .progress_tx
            .send_replace(self.run.progress_snapshot());
        debug!(iteration, time = self.run.time, "tick recorded");
        let _ = self.lifecycle.events.send(EngineEvent::Step {
            iteration,
            time: self.run.time,
            progress: self.run.progress,
            frame,
        });

        let interval = self.settings.statistics_interval;
        if interval > 0 && iteration % interval == 0 {
            let stats = self.telemetry.stats();
            let elapsed = self.started.elapsed().as_secs_f64();
            let ticks_per_second = if elapsed > 0.0 {
                stats.frames as f64 / elapsed
            } else {
                0.0
            };
            let _ = self.lifecycle.events.send(EngineEvent::Statistics {
                iteration,
                ticks_per_second,
                mean_compute_ms: stats.mean_compute_ms(),
            });
        }
    }

    fn report_unit_failures(&self, iteration: u64, samples: &[UnitSample]) {
        for sample in samples {
            let error = match &sample.outcome {
                ComputationOutcome::Failed { error } => EngineError::Computation {
                    unit: sample.unit.clone(),
                    kind: sample.kind.clone(),
                    message: error.clone(),
                },
                ComputationOutcome::TimedOut { after_ms } => EngineError::ComputationTimeout {
                    unit: sample.unit.clone(),
                    kind: sample.kind.clone(),
                    after_ms: *after_ms,
                },
                ComputationOutcome::Missed => {
                    debug!(unit = %sample.unit, kind = %sample.kind, iteration, "unit missed tick");
                    continue;
                }
                ComputationOutcome::Completed { .. } => continue,
            };
            warn!(iteration, error = %error, "computation did not complete");
            let _ = self.lifecycle.events.send(EngineEvent::UnitError {
                unit: sample.unit.clone(),
                kind: Some(sample.kind.clone()),
                iteration: Some(iteration),
                error: error.to_string(),
            });
        }
    }

    async fn finalize(mut self, termination: Termination) {
        self.lifecycle.seal();
        let leftovers = self.dispatcher.cancel_all();
        if leftovers > 0 {
            warn!(leftovers, "pending computations outlived the run; cancelled");
        }
        if termination == Termination::Stopped {
            self.dispatcher.broadcast_control(control::STOP).await;
        }

        let now = self.clock.now_millis();
        let status = termination.terminal_status();
        self.run.finish(status, now);
        let report = report::synthesize(
            &self.run,
            self.telemetry.stats(),
            &termination,
            self.settings.tick_budget,
            now,
        );

        if let Some(results) = &self.results
            && let Err(e) = results.store_result(&report).await
        {
            warn!(error = %e, "failed to store simulation report");
        }

        let event = match &termination {
            Termination::Stopped => {
                info!(iteration = self.run.iteration, "simulation stopped");
                EngineEvent::Stopped {
                    report: report.clone(),
                }
            }
            Termination::Failed { cause } => {
                error!(iteration = self.run.iteration, %cause, "simulation failed");
                EngineEvent::Error {
                    cause: cause.clone(),
                    report: report.clone(),
                }
            }
            Termination::Exhausted | Termination::Condition { .. } => {
                info!(
                    iteration = self.run.iteration,
                    success = report.success,
                    "simulation completed"
                );
                EngineEvent::Completed {
                    report: report.clone(),
                }
            }
        };

        let outcome = RunOutcome {
            frames: self.telemetry.frames(),
            run: self.run,
            report,
        };
        self.lifecycle.publish_terminal(status, outcome, event);
    }
}
