// Final run report synthesis.

use crate::domain::run::{RunStatus, SimulationRun, Termination};
use crate::domain::stop_conditions::StopCondition;
use crate::domain::telemetry::{ScalarSummary, TelemetryStats};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

// Recommendation thresholds.
const TIMEOUT_RATE_THRESHOLD: f64 = 0.05;
const FAILURE_RATE_THRESHOLD: f64 = 0.10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetrics {
    pub computations: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub missed: u64,
    pub failure_rate: f64,
    pub timeout_rate: f64,
    pub mean_compute_ms: f64,
    pub max_compute_ms: f64,
    pub scalars: BTreeMap<String, ScalarSummary>,
}

impl From<&TelemetryStats> for ReportMetrics {
    fn from(stats: &TelemetryStats) -> Self {
        Self {
            computations: stats.computations,
            failures: stats.failures,
            timeouts: stats.timeouts,
            missed: stats.missed,
            failure_rate: stats.failure_rate(),
            timeout_rate: stats.timeout_rate(),
            mean_compute_ms: stats.mean_compute_ms(),
            max_compute_ms: stats.max_compute_ms,
            scalars: stats.scalars.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub run_id: String,
    pub name: String,
    /// Simulated seconds covered by the run.
    pub duration: f64,
    pub wall_duration_ms: u64,
    pub iterations: u64,
    pub success: bool,
    pub terminal_state: RunStatus,
    pub termination: Termination,
    pub metrics: ReportMetrics,
    pub recommendations: Vec<String>,
    pub generated_at: u64,
}

/// Builds the report for a finalized run.
pub fn synthesize(
    run: &SimulationRun,
    stats: &TelemetryStats,
    termination: &Termination,
    tick_budget: Duration,
    now_ms: u64,
) -> SimulationReport {
    let metrics = ReportMetrics::from(stats);
    let recommendations = recommend(run, &metrics, termination, tick_budget);
    SimulationReport {
        run_id: run.id.clone(),
        name: run.config.name.clone(),
        duration: run.time,
        wall_duration_ms: now_ms.saturating_sub(run.started_at),
        iterations: run.iteration,
        success: termination.is_success(),
        terminal_state: termination.terminal_status(),
        termination: termination.clone(),
        metrics,
        recommendations,
        generated_at: now_ms,
    }
}

fn recommend(
    run: &SimulationRun,
    metrics: &ReportMetrics,
    termination: &Termination,
    tick_budget: Duration,
) -> Vec<String> {
    let mut out = Vec::new();

    match termination {
        Termination::Failed { cause } => out.push(format!(
            "Run aborted at iteration {}: {cause}. Inspect the failing unit before retrying.",
            run.iteration
        )),
        Termination::Stopped => out.push(format!(
            "Run stopped manually at {:.1}% progress; results cover {} iterations only.",
            run.progress, run.iteration
        )),
        Termination::Exhausted => out.push(format!(
            "Reached maxIterations ({}) without meeting a stop condition; \
             increase maxIterations or revisit stop condition targets.",
            run.config.max_iterations
        )),
        Termination::Condition {
            condition: StopCondition::ResourceDepleted { resource },
        } => out.push(format!(
            "Resource '{resource}' was depleted at t={:.3}; budget more of it or reduce consumption.",
            run.time
        )),
        Termination::Condition { .. } => {}
    }

    if metrics.timeout_rate > TIMEOUT_RATE_THRESHOLD {
        out.push(format!(
            "{:.1}% of computations produced no output in time; raise the computation timeout \
             or lighten per-tick unit workloads.",
            metrics.timeout_rate * 100.0
        ));
    }
    if metrics.failure_rate > FAILURE_RATE_THRESHOLD {
        out.push(format!(
            "{:.1}% of computations failed; check unit inputs and error logs.",
            metrics.failure_rate * 100.0
        ));
    }
    let budget_ms = tick_budget.as_secs_f64() * 1000.0;
    if budget_ms > 0.0 && metrics.mean_compute_ms > budget_ms {
        out.push(format!(
            "Mean tick compute time {:.2}ms exceeds the {:.2}ms budget; \
             the simulation runs slower than its target rate.",
            metrics.mean_compute_ms, budget_ms
        ));
    }

    if out.is_empty() {
        out.push("No issues detected.".to_string());
    }
    out
}
