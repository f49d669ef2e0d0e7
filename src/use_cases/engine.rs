// Engine controller: run lifecycle, unit registry and observers.

use crate::domain::ports::{Clock, ComputationUnit, ConfigSource, IdGenerator, ResultSink};
use crate::domain::{
    EngineError, RunProgress, RunStatus, SimulationConfig, SimulationReport, SimulationRun,
    StopCondition, TelemetryBuffer, TelemetryFrame,
};
use crate::use_cases::dispatcher::{DispatchStats, Dispatcher, ReplySink};
use crate::use_cases::scheduler::{PlannedRequest, StepScheduler};
use crate::use_cases::types::{EngineEvent, EngineSettings};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Collaborators injected into the engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub results: Option<Arc<dyn ResultSink>>,
}

/// Everything a finished run leaves behind.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: SimulationRun,
    pub report: SimulationReport,
    pub frames: Vec<TelemetryFrame>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Status, progress and events shared between the controller and the scheduler.
///
/// The status stays Running or Paused until the scheduler publishes the
/// terminal status; a stop is carried as a request until then.
pub(crate) struct Lifecycle {
    pub(crate) status_tx: watch::Sender<RunStatus>,
    pub(crate) progress_tx: watch::Sender<RunProgress>,
    pub(crate) events: broadcast::Sender<EngineEvent>,
    pub(crate) stop_tx: watch::Sender<bool>,
    // Set once the scheduler has committed to ending the run.
    closing: AtomicBool,
    last: Mutex<Option<Arc<RunOutcome>>>,
}

/// What the scheduler may do with a run that reached its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Closing {
    Finish,
    Stop,
    Parked,
}

impl Lifecycle {
    fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Commits to ending the run unless it is parked.
    ///
    /// A natural finish only closes from Running; a pending stop request
    /// wins over it.
    pub(crate) fn close(&self) -> Closing {
        let mut closing = Closing::Parked;
        self.status_tx.send_if_modified(|status| {
            if self.stop_requested() {
                closing = Closing::Stop;
            } else if *status == RunStatus::Running {
                closing = Closing::Finish;
            }
            if closing != Closing::Parked {
                self.closing.store(true, Ordering::Release);
            }
            false
        });
        closing
    }

    /// Refuses further pause, resume and stop calls for this run.
    pub(crate) fn seal(&self) {
        self.status_tx.send_if_modified(|_| {
            self.closing.store(true, Ordering::Release);
            false
        });
    }

    /// Publishes the terminal status and event as one step.
    ///
    /// Runs under the status channel's write lock, so a racing `start` sees
    /// either the old run still active or the terminal event already sent.
    pub(crate) fn publish_terminal(
        &self,
        status: RunStatus,
        outcome: RunOutcome,
        event: EngineEvent,
    ) {
        self.progress_tx
            .send_replace(outcome.run.progress_snapshot());
        *lock(&self.last) = Some(Arc::new(outcome));
        self.status_tx.send_modify(|current| {
            if !current.can_transition_to(status) {
                error!(from = ?*current, to = ?status, "illegal terminal transition");
            }
            *current = status;
            let _ = self.events.send(event);
        });
    }
}

/// Controls simulation runs over a set of attached computation units.
///
/// One run is active at a time. The tick loop runs on its own task; the
/// controller methods only flip the shared status and never block on it.
pub struct Engine {
    settings: EngineSettings,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    results: Option<Arc<dyn ResultSink>>,
    // Unit name -> computation kinds requested from it on every tick.
    plans: RwLock<BTreeMap<String, Vec<String>>>,
    lifecycle: Arc<Lifecycle>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Must be called inside a tokio runtime; the dispatcher spawns its router.
    pub fn new(settings: EngineSettings, deps: EngineDeps) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (status_tx, _) = watch::channel(RunStatus::Idle);
        let (progress_tx, _) = watch::channel(RunProgress::default());
        let (stop_tx, _) = watch::channel(false);
        let dispatcher = Arc::new(Dispatcher::new(
            deps.ids,
            deps.clock.clone(),
            events.clone(),
            settings.reply_capacity,
        ));

        Self {
            settings,
            dispatcher,
            clock: deps.clock,
            results: deps.results,
            plans: RwLock::new(BTreeMap::new()),
            lifecycle: Arc::new(Lifecycle {
                status_tx,
                progress_tx,
                events,
                stop_tx,
                closing: AtomicBool::new(false),
                last: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Sink a unit backend uses to reply to the engine under `unit`'s name.
    pub fn reply_sink(&self, unit: &str) -> ReplySink {
        self.dispatcher.reply_sink(unit)
    }

    /// Handshakes with `unit` and requests `kinds` from it on every tick.
    pub async fn attach_unit(
        &self,
        unit: Arc<dyn ComputationUnit>,
        kinds: Vec<String>,
    ) -> Result<(), EngineError> {
        let name = unit.name().to_string();
        self.dispatcher
            .attach(unit, self.settings.handshake_timeout)
            .await
            .inspect_err(|e| warn!(unit = %name, error = %e, "unit attach failed"))?;
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, kinds);
        Ok(())
    }

    pub fn unit_names(&self) -> Vec<String> {
        self.dispatcher.unit_names()
    }

    fn plan_for(&self, config: &SimulationConfig) -> Result<Vec<PlannedRequest>, EngineError> {
        let plans = self.plans.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(selected) = &config.units
            && let Some(missing) = selected.iter().find(|name| !plans.contains_key(*name))
        {
            return Err(EngineError::configuration(format!(
                "unit {missing} is not attached"
            )));
        }

        Ok(plans
            .iter()
            .filter(|(unit, _)| {
                config
                    .units
                    .as_ref()
                    .is_none_or(|selected| selected.contains(*unit))
            })
            .flat_map(|(unit, kinds)| {
                kinds.iter().map(|kind| PlannedRequest {
                    unit: unit.clone(),
                    kind: kind.clone(),
                })
            })
            .collect())
    }

    /// Starts a new run and returns its id.
    ///
    /// A run that is Running or Paused (including one still winding down
    /// after `stop`) is left untouched and the call fails with `ConcurrentStart`.
    pub fn start(&self, config: SimulationConfig) -> Result<String, EngineError> {
        config
            .validate()
            .inspect_err(|e| warn!(error = %e, "rejected simulation config"))?;
        let plan = self.plan_for(&config)?;

        let lifecycle = &self.lifecycle;
        let mut active_run = None;
        lifecycle.status_tx.send_if_modified(|status| {
            if status.is_active() {
                active_run = Some(
                    lifecycle
                        .progress_tx
                        .borrow()
                        .run_id
                        .clone()
                        .unwrap_or_default(),
                );
                return false;
            }
            lifecycle.closing.store(false, Ordering::Release);
            lifecycle.stop_tx.send_replace(false);
            *status = RunStatus::Running;
            true
        });
        if let Some(run_id) = active_run {
            warn!(%run_id, "start rejected: a run is already active");
            return Err(EngineError::ConcurrentStart { run_id });
        }

        for condition in &config.stop_conditions {
            if let StopCondition::Unknown { name } = condition {
                warn!(kind = %name, "unknown stop condition kind will never fire");
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let now = self.clock.now_millis();
        let run = SimulationRun::new(run_id.clone(), config, now);
        lifecycle.progress_tx.send_replace(run.progress_snapshot());
        // A critical error reported between runs belongs to no run.
        if let Some(stale) = self.dispatcher.take_poison() {
            warn!(error = %stale, "discarding unit error reported between runs");
        }

        info!(
            run_id = %run_id,
            name = %run.config.name,
            max_iterations = run.config.max_iterations,
            requests_per_tick = plan.len(),
            "simulation started"
        );
        let _ = lifecycle.events.send(EngineEvent::Started {
            run_id: run_id.clone(),
            name: run.config.name.clone(),
            max_iterations: run.config.max_iterations,
            timestamp: now,
        });

        let scheduler = StepScheduler {
            run,
            plan,
            dispatcher: self.dispatcher.clone(),
            settings: self.settings.clone(),
            clock: self.clock.clone(),
            results: self.results.clone(),
            lifecycle: lifecycle.clone(),
            telemetry: TelemetryBuffer::new(self.settings.telemetry),
            started: Instant::now(),
        };
        *lock(&self.task) = Some(tokio::spawn(scheduler.drive()));
        Ok(run_id)
    }

    /// Loads a stored configuration and starts it.
    pub async fn start_from(
        &self,
        source: &dyn ConfigSource,
        config_id: &str,
    ) -> Result<String, EngineError> {
        let config = source
            .load_config(config_id)
            .await
            .inspect_err(|e| warn!(config_id, error = %e, "failed to load simulation config"))?;
        self.start(config)
    }

    fn transition(&self, from: &[RunStatus], to: RunStatus) -> bool {
        let lifecycle = &self.lifecycle;
        lifecycle.status_tx.send_if_modified(|status| {
            let open = !lifecycle.closing.load(Ordering::Acquire) && !lifecycle.stop_requested();
            if open && from.contains(status) && status.can_transition_to(to) {
                *status = to;
                true
            } else {
                false
            }
        })
    }

    /// Returns false when there was no running run to pause.
    pub fn pause(&self) -> bool {
        if !self.transition(&[RunStatus::Running], RunStatus::Paused) {
            return false;
        }
        let progress = self.progress();
        info!(iteration = progress.iteration, "simulation paused");
        let _ = self.lifecycle.events.send(EngineEvent::Paused {
            run_id: progress.run_id.unwrap_or_default(),
            iteration: progress.iteration,
        });
        true
    }

    pub fn resume(&self) -> bool {
        if !self.transition(&[RunStatus::Paused], RunStatus::Running) {
            return false;
        }
        let progress = self.progress();
        info!(iteration = progress.iteration, "simulation resumed");
        let _ = self.lifecycle.events.send(EngineEvent::Resumed {
            run_id: progress.run_id.unwrap_or_default(),
            iteration: progress.iteration,
        });
        true
    }

    /// Requests a stop; returns false when there is no active run to stop.
    ///
    /// The status stays active until the run is finalized, at which point it
    /// becomes Stopped and the `stopped` event is sent.
    pub fn stop(&self) -> bool {
        let lifecycle = &self.lifecycle;
        let mut requested = false;
        lifecycle.status_tx.send_if_modified(|status| {
            requested = status.is_active()
                && !lifecycle.closing.load(Ordering::Acquire)
                && !lifecycle.stop_tx.send_replace(true);
            false
        });
        if requested {
            info!(iteration = self.progress().iteration, "stop requested");
        }
        requested
    }

    /// Waits for the current run's task to finish and returns the latest report.
    pub async fn wait(&self) -> Option<SimulationReport> {
        let handle = lock(&self.task).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "scheduler task failed");
        }
        self.last_run().map(|outcome| outcome.report.clone())
    }

    pub fn status(&self) -> RunStatus {
        *self.lifecycle.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.lifecycle.status_tx.subscribe()
    }

    pub fn progress(&self) -> RunProgress {
        self.lifecycle.progress_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.lifecycle.events.subscribe()
    }

    /// Outcome of the most recently finalized run.
    pub fn last_run(&self) -> Option<Arc<RunOutcome>> {
        lock(&self.lifecycle.last).clone()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn pending_count(&self) -> usize {
        self.dispatcher.pending_count()
    }

    /// Stops any run, waits for it, then terminates and detaches every unit.
    pub async fn shutdown(&self) {
        self.stop();
        self.wait().await;
        self.dispatcher.detach_all().await;
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::computation::control;
    use crate::domain::{CorrelationId, Termination, UnitMessage};
    use crate::use_cases::test_support::{FixedClock, ScriptedUnit, StepIds, reply_ok};
    use serde_json::json;
    use std::time::Duration;

    fn settings() -> EngineSettings {
        EngineSettings {
            tick_budget: Duration::from_millis(2),
            ..Default::default()
        }
    }

    fn engine_with(ids: Arc<dyn IdGenerator>) -> Engine {
        paced_engine(ids, settings())
    }

    fn paced_engine(ids: Arc<dyn IdGenerator>, settings: EngineSettings) -> Engine {
        Engine::new(
            settings,
            EngineDeps {
                ids,
                clock: Arc::new(FixedClock(1_700_000_000_000)),
                results: None,
            },
        )
    }

    fn engine() -> Engine {
        engine_with(Arc::new(StepIds::default()))
    }

    struct PanickingIds;

    impl IdGenerator for PanickingIds {
        fn next_id(&self) -> CorrelationId {
            panic!("id space exhausted");
        }
    }

    #[tokio::test]
    async fn when_iterations_run_out_then_run_completes_without_success() {
        let engine = engine();
        engine
            .start(SimulationConfig::new(0.1, 3))
            .expect("start should succeed");

        let report = engine.wait().await.expect("report");

        assert_eq!(engine.status(), RunStatus::Completed);
        assert_eq!(report.iterations, 3);
        assert_eq!(report.termination, Termination::Exhausted);
        assert!(!report.success);
        assert_eq!(engine.progress().iteration, 3);
    }

    #[tokio::test]
    async fn when_config_is_invalid_then_start_fails_and_stays_idle() {
        let engine = engine();

        let result = engine.start(SimulationConfig::new(0.0, 10));

        assert!(matches!(result, Err(EngineError::Configuration { .. })));
        assert_eq!(engine.status(), RunStatus::Idle);
    }

    #[tokio::test]
    async fn when_config_selects_unattached_unit_then_start_fails() {
        let engine = engine();
        let mut config = SimulationConfig::new(0.1, 10);
        config.units = Some(vec!["ghost".to_string()]);

        let result = engine.start(config);

        assert!(matches!(result, Err(EngineError::Configuration { .. })));
        assert_eq!(engine.status(), RunStatus::Idle);
    }

    #[tokio::test]
    async fn when_run_is_active_then_second_start_is_rejected_untouched() {
        let engine = engine();
        let first = engine
            .start(SimulationConfig::new(0.1, 100_000))
            .expect("first start");

        let second = engine.start(SimulationConfig::new(0.1, 5));

        assert!(matches!(
            second,
            Err(EngineError::ConcurrentStart { ref run_id }) if *run_id == first
        ));
        assert_eq!(engine.status(), RunStatus::Running);
        assert_eq!(engine.progress().run_id.as_deref(), Some(first.as_str()));

        assert!(engine.pause());
        assert!(matches!(
            engine.start(SimulationConfig::new(0.1, 5)),
            Err(EngineError::ConcurrentStart { .. })
        ));
        engine.stop();
        engine.wait().await;
    }

    #[tokio::test]
    async fn pause_and_resume_are_no_ops_outside_their_states() {
        let engine = engine();

        assert!(!engine.pause());
        assert!(!engine.resume());
        assert!(!engine.stop());
        assert_eq!(engine.status(), RunStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn when_paused_then_no_ticks_are_recorded_until_resume() {
        let engine = engine();
        engine
            .start(SimulationConfig::new(0.1, 100_000))
            .expect("start");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(engine.pause());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let parked = engine.progress().iteration;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(engine.progress().iteration, parked);

        assert!(engine.resume());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(engine.progress().iteration > parked);

        engine.stop();
        let report = engine.wait().await.expect("report");
        assert_eq!(report.termination, Termination::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn when_stopped_then_units_receive_stop_and_run_can_restart() {
        let engine = engine();
        let unit = ScriptedUnit::new(engine.reply_sink("physics"), reply_ok);
        let received = unit.received();
        engine
            .attach_unit(Arc::new(unit), vec!["integrate".into()])
            .await
            .expect("attach");
        let mut events = engine.subscribe();

        engine
            .start(SimulationConfig::new(0.1, 100_000))
            .expect("start");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.stop());
        engine.wait().await;

        assert_eq!(engine.status(), RunStatus::Stopped);
        assert_eq!(engine.pending_count(), 0);
        let kinds: Vec<String> = received
            .lock()
            .expect("received")
            .iter()
            .map(|request| request.kind.clone())
            .collect();
        assert_eq!(kinds.first().map(String::as_str), Some(control::INIT));
        assert_eq!(kinds.last().map(String::as_str), Some(control::STOP));

        let mut saw_stopped = false;
        while let Ok(event) = events.try_recv() {
            saw_stopped |= matches!(event, EngineEvent::Stopped { .. });
        }
        assert!(saw_stopped);

        engine
            .start(SimulationConfig::new(0.1, 2))
            .expect("restart after stop");
        let report = engine.wait().await.expect("report");
        assert_eq!(report.iterations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn when_start_follows_stop_immediately_then_rejection_matches_active_status() {
        let engine = engine();
        let first = engine
            .start(SimulationConfig::new(0.1, 100_000))
            .expect("start");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(engine.stop());
        assert!(!engine.stop());
        assert!(!engine.pause());
        let status = engine.status();
        let restart = engine.start(SimulationConfig::new(0.1, 2));

        assert!(status.is_active(), "status was {status:?}");
        assert!(matches!(
            restart,
            Err(EngineError::ConcurrentStart { ref run_id }) if *run_id == first
        ));
        let report = engine.wait().await.expect("report");
        assert_eq!(report.termination, Termination::Stopped);
        assert_eq!(engine.status(), RunStatus::Stopped);

        engine
            .start(SimulationConfig::new(0.1, 2))
            .expect("restart once stopped");
        assert_eq!(engine.wait().await.expect("report").iterations, 2);
    }

    fn slow_ticks() -> EngineSettings {
        EngineSettings {
            tick_budget: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn when_paused_after_the_last_tick_then_run_completes_only_after_resume() {
        let engine = paced_engine(Arc::new(StepIds::default()), slow_ticks());
        let mut events = engine.subscribe();
        engine.start(SimulationConfig::new(1.0, 1)).expect("start");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(engine.pause());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.status(), RunStatus::Paused);
        assert_eq!(engine.progress().iteration, 1);

        assert!(engine.resume());
        let report = engine.wait().await.expect("report");

        assert_eq!(engine.status(), RunStatus::Completed);
        assert_eq!(report.termination, Termination::Exhausted);
        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["started", "step", "paused", "resumed", "completed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn when_stopped_after_the_last_tick_then_run_ends_stopped() {
        let engine = paced_engine(Arc::new(StepIds::default()), slow_ticks());
        let mut events = engine.subscribe();
        engine.start(SimulationConfig::new(1.0, 1)).expect("start");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(engine.stop());
        let report = engine.wait().await.expect("report");

        assert_eq!(engine.status(), RunStatus::Stopped);
        assert_eq!(report.termination, Termination::Stopped);
        assert_eq!(report.iterations, 1);
        let mut terminal = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.is_terminal() {
                terminal.push(event.name());
            }
        }
        assert_eq!(terminal, vec!["stopped"]);
    }

    #[tokio::test]
    async fn when_loop_panics_then_run_ends_in_error() {
        let engine = engine_with(Arc::new(PanickingIds));
        engine
            .attach_unit(
                Arc::new(ScriptedUnit::new(engine.reply_sink("physics"), reply_ok)),
                vec!["integrate".into()],
            )
            .await
            .expect("attach");

        engine.start(SimulationConfig::new(0.1, 10)).expect("start");
        let report = engine.wait().await.expect("report");

        assert_eq!(engine.status(), RunStatus::Error);
        assert!(matches!(
            report.termination,
            Termination::Failed { ref cause } if cause.contains("id space exhausted")
        ));
    }

    #[tokio::test]
    async fn when_unit_reports_uncorrelated_critical_error_then_run_fails() {
        let engine = engine();
        let sink = engine.reply_sink("physics");
        engine
            .attach_unit(
                Arc::new(ScriptedUnit::new(sink.clone(), reply_ok)),
                vec!["integrate".into()],
            )
            .await
            .expect("attach");

        engine
            .start(SimulationConfig::new(0.1, 100_000))
            .expect("start");
        sink.send(UnitMessage::Error {
            id: None,
            error: "coolant lost".into(),
            critical: true,
        })
        .await;
        let report = engine.wait().await.expect("report");

        assert_eq!(engine.status(), RunStatus::Error);
        assert!(matches!(
            report.termination,
            Termination::Failed { ref cause } if cause.contains("coolant lost")
        ));
    }

    #[tokio::test]
    async fn unit_results_update_the_run_state() {
        let engine = engine();
        let unit = ScriptedUnit::new(engine.reply_sink("burner"), |request| {
            let iteration = request.payload["iteration"].as_u64().unwrap_or(0);
            vec![UnitMessage::Result {
                id: request.id.clone().expect("id"),
                data: json!({ "scalars": { "fuel": 10.0 - iteration as f64 } }),
            }]
        });
        engine
            .attach_unit(Arc::new(unit), vec!["burn".into()])
            .await
            .expect("attach");

        engine.start(SimulationConfig::new(1.0, 4)).expect("start");
        engine.wait().await;

        let outcome = engine.last_run().expect("outcome");
        assert_eq!(outcome.run.state.scalar("fuel"), Some(6.0));
        assert_eq!(outcome.frames.len(), 4);
        let stats = engine.dispatch_stats();
        assert_eq!(stats.issued, 4);
        assert_eq!(stats.issued, stats.settled());
    }
}
