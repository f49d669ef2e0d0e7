// Framework bootstrap for the simulation runner binary.

use crate::domain::ports::ConfigSource;
use crate::domain::SimulationReport;
use crate::frameworks::config;
use crate::interface_adapters::events::journal_events;
use crate::interface_adapters::state::{FileStore, SystemClock};
use crate::interface_adapters::units::{TaskUnit, UnitFailure};
use crate::interface_adapters::utils::ids::SequentialIds;
use crate::use_cases::{Engine, EngineDeps};

use serde_json::{Value, json};
use std::{io::Result, sync::Arc};
use tokio::io::{AsyncWrite, BufWriter};

/// Name and per-tick kind of the built-in ballistics unit.
pub const DEMO_UNIT: &str = "physics-calculator";
pub const DEMO_KIND: &str = "propulsion";

const GRAVITY: f64 = -9.81;

fn init_runtime() {
    let _ = dotenvy::dotenv();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = matches!(std::env::var("LOG_FORMAT").as_deref(), Ok("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::capture();
        tracing::error!(%info, ?backtrace, "panic");
    }));
}

fn vector3(state: &Value, name: &str) -> [f64; 3] {
    let mut out = [0.0; 3];
    if let Some(items) = state["vectors"][name].as_array() {
        for (slot, item) in out.iter_mut().zip(items) {
            *slot = item.as_f64().unwrap_or(0.0);
        }
    }
    out
}

/// One explicit Euler step of a vertical-thrust rocket under constant gravity.
///
/// Reads `position`, `velocity`, `fuel`, `thrust` (m/s^2) and `burnRate`
/// (fuel per second) from the snapshot; thrust only applies while fuel lasts.
pub fn ballistics(kind: &str, payload: &Value) -> std::result::Result<Value, UnitFailure> {
    if kind != DEMO_KIND {
        return Err(UnitFailure::recoverable(format!("unsupported kind {kind}")));
    }
    let time_step = payload["timeStep"].as_f64().unwrap_or(0.0);
    let factor = payload["realTimeFactor"].as_f64().unwrap_or(1.0);
    let dt = time_step * factor;
    if !(dt.is_finite() && dt > 0.0) {
        return Err(UnitFailure::critical(format!("invalid step {dt}")));
    }

    let scalar = |name: &str| payload["scalars"][name].as_f64().unwrap_or(0.0);
    let mut position = vector3(payload, "position");
    let mut velocity = vector3(payload, "velocity");
    let mut fuel = scalar("fuel");

    let thrust = if fuel > 0.0 { scalar("thrust") } else { 0.0 };
    fuel = (fuel - scalar("burnRate") * dt).max(0.0);

    let acceleration = [0.0, 0.0, thrust + GRAVITY];
    for ((v, p), a) in velocity.iter_mut().zip(position.iter_mut()).zip(acceleration) {
        *v += a * dt;
        *p += *v * dt;
    }

    Ok(json!({
        "scalars": { "fuel": fuel, "altitude": position[2] },
        "vectors": { "position": position, "velocity": velocity },
    }))
}

/// Attaches the ballistics unit, runs `config_id` to completion and shuts down.
///
/// Lifecycle events are journaled to `journal` as NDJSON. Ctrl-C stops the run.
pub async fn run<W>(
    engine: &Engine,
    source: &dyn ConfigSource,
    config_id: &str,
    journal: W,
) -> Result<SimulationReport>
where
    W: AsyncWrite + Unpin,
{
    let unit = TaskUnit::spawn(engine.reply_sink(DEMO_UNIT), ballistics);
    engine
        .attach_unit(Arc::new(unit), vec![DEMO_KIND.to_string()])
        .await
        .map_err(std::io::Error::other)?;

    let events = engine.subscribe();
    let run_id = engine
        .start_from(source, config_id)
        .await
        .map_err(std::io::Error::other)?;
    tracing::info!(%run_id, config_id, "running simulation");

    let mut status = engine.watch_status();
    let finished = async {
        tokio::select! {
            _ = status.wait_for(|s| s.is_terminal()) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupt received; stopping simulation");
                engine.stop();
            }
        }
        engine.wait().await
    };
    let (written, report) = tokio::join!(journal_events(events, journal), finished);
    match written {
        Ok(count) => tracing::debug!(events = count, "event journal closed"),
        Err(e) => tracing::warn!(error = %e, "event journal failed"),
    }

    engine.shutdown().await;
    report.ok_or_else(|| std::io::Error::other("simulation finished without a report"))
}

pub async fn run_with_config() -> Result<SimulationReport> {
    init_runtime();

    let settings = config::engine_settings()
        .inspect_err(|e| tracing::error!(error = %e, "invalid engine settings"))
        .map_err(std::io::Error::other)?;
    let store = Arc::new(FileStore::new(config::config_dir(), config::reports_dir()));
    tracing::debug!(
        config_dir = %store.config_dir.display(),
        reports_dir = %store.reports_dir.display(),
        tick_budget_ms = settings.tick_budget.as_millis(),
        barrier = ?settings.barrier,
        "engine configured"
    );

    let engine = Engine::new(
        settings,
        EngineDeps {
            ids: Arc::new(SequentialIds::new()),
            clock: Arc::new(SystemClock),
            results: Some(store.clone()),
        },
    );

    let config_id = config::simulation_id();
    tokio::fs::create_dir_all(&store.reports_dir).await?;
    let journal_path = store
        .reports_dir
        .join(format!("{config_id}.events.ndjson"));
    let journal = tokio::fs::File::create(&journal_path)
        .await
        .inspect_err(|e| {
            tracing::error!(path = %journal_path.display(), error = %e, "failed to open event journal");
        })?;

    let report = run(&engine, store.as_ref(), &config_id, BufWriter::new(journal)).await?;
    tracing::info!(
        run_id = %report.run_id,
        success = report.success,
        iterations = report.iterations,
        recommendations = ?report.recommendations,
        "simulation finished"
    );
    Ok(report)
}
