use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::ports::{Clock, ConfigSource, ResultSink};
use crate::domain::{SimulationConfig, SimulationReport, StoreError};
use crate::interface_adapters::protocol::{ConfigFormat, parse_config};

// In-memory config and report store, used by tests and embedding callers.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    pub configs: Arc<Mutex<HashMap<String, SimulationConfig>>>,
    pub reports: Arc<Mutex<Vec<SimulationReport>>>,
}

impl InMemoryStore {
    pub async fn insert_config(&self, id: impl Into<String>, config: SimulationConfig) {
        self.configs.lock().await.insert(id.into(), config);
    }

    pub async fn reports(&self) -> Vec<SimulationReport> {
        self.reports.lock().await.clone()
    }
}

#[async_trait]
impl ConfigSource for InMemoryStore {
    async fn load_config(&self, id: &str) -> Result<SimulationConfig, StoreError> {
        let configs = self.configs.lock().await;
        configs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }
}

#[async_trait]
impl ResultSink for InMemoryStore {
    async fn store_result(&self, report: &SimulationReport) -> Result<(), StoreError> {
        self.reports.lock().await.push(report.clone());
        Ok(())
    }
}

// Directory-backed store: `<id>.toml` or `<id>.json` configs in, `<run_id>.json` reports out.
#[derive(Clone, Debug)]
pub struct FileStore {
    pub config_dir: PathBuf,
    pub reports_dir: PathBuf,
}

impl FileStore {
    pub fn new(config_dir: impl Into<PathBuf>, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            reports_dir: reports_dir.into(),
        }
    }

    // Ids name files directly inside the directory; anything path-like is unknown.
    fn is_plain_id(id: &str) -> bool {
        !id.is_empty()
            && Path::new(id).file_name().and_then(|name| name.to_str()) == Some(id)
            && id != ".."
    }
}

#[async_trait]
impl ConfigSource for FileStore {
    async fn load_config(&self, id: &str) -> Result<SimulationConfig, StoreError> {
        if !Self::is_plain_id(id) {
            return Err(StoreError::NotFound { id: id.to_string() });
        }

        for extension in ["toml", "json"] {
            let path = self.config_dir.join(format!("{id}.{extension}"));
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::Io(format!("{}: {e}", path.display()))),
            };
            let format = ConfigFormat::from_path(&path).unwrap_or(ConfigFormat::Json);
            debug!(path = %path.display(), "loading simulation config");
            return parse_config(&text, format);
        }
        Err(StoreError::NotFound { id: id.to_string() })
    }
}

#[async_trait]
impl ResultSink for FileStore {
    async fn store_result(&self, report: &SimulationReport) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.reports_dir)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let body =
            serde_json::to_vec_pretty(report).map_err(|e| StoreError::Parse(e.to_string()))?;
        let path = self.reports_dir.join(format!("{}.json", report.run_id));
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| StoreError::Io(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "simulation report written");
        Ok(())
    }
}

// System clock adapter used by the engine.
#[derive(Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}
