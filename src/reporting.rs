//! Optional persistence of pipeline results for offline analysis.

use serde::Serialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::config::AnalyticsConfig;
use crate::error::Result;

/// Set to anything but `0`/`false` to record artifacts.
pub const ANALYTICS_ENV: &str = "NL2SQL_ENABLE_ANALYTICS";

pub trait ArtifactSink: Send + Sync {
    fn record(&self, key: &str, artifact_id: &str, artifact: &Value) -> Result<()>;
}

/// Writes `<output_dir>/<key>/<artifact_id>_<timestamp>.json`.
pub struct FileSink {
    output_dir: PathBuf,
}

impl FileSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// A sink for `config`, or `None` unless analytics are switched on in the environment.
    pub fn from_env(config: &AnalyticsConfig) -> Option<Self> {
        analytics_enabled().then(|| Self::new(&config.output_dir))
    }
}

impl ArtifactSink for FileSink {
    fn record(&self, key: &str, artifact_id: &str, artifact: &Value) -> Result<()> {
        let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let dir = self.output_dir.join(key);
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}_{}.json", artifact_id, timestamp));
        let document = json!({
            "data": artifact,
            "metadata": {
                "version": env!("CARGO_PKG_VERSION"),
                "recorded_at": chrono::Utc::now().to_rfc3339(),
            },
        });
        std::fs::write(&path, serde_json::to_vec_pretty(&document)?)?;

        debug!("Recorded artifact {}", path.display());
        Ok(())
    }
}

pub fn analytics_enabled() -> bool {
    std::env::var(ANALYTICS_ENV)
        .map(|v| {
            let v = v.trim().to_lowercase();
            !v.is_empty() && v != "0" && v != "false"
        })
        .unwrap_or(false)
}

/// Records `artifact` if a sink is configured. Failures are logged, never returned.
pub fn record_artifact<T: Serialize>(
    sink: Option<&dyn ArtifactSink>,
    key: &str,
    artifact_id: &str,
    artifact: &T,
) {
    let Some(sink) = sink else {
        return;
    };
    let result = serde_json::to_value(artifact)
        .map_err(Into::into)
        .and_then(|value| sink.record(key, artifact_id, &value));
    if let Err(e) = result {
        warn!("Failed to record {} artifact {}: {}", key, artifact_id, e);
    }
}
