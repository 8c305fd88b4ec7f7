// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Experiment tracking
//!
//! Each stage reports a metric triple plus a reference to the model it
//! scored. The backend is picked from the tracking URI scheme:
//!
//! - no URI: tracking disabled
//! - `file://<dir>`: JSON lines appended to `<dir>/runs.jsonl`
//! - `http(s)://<host>`: an MLflow-compatible REST server
//!
//! Credentials are held in [`TrackingConfig`] and handed to the tracker
//! when it is built; the process environment is only ever read.

use crate::error::{PersistenceError, TrackingError};
use crate::metrics::ClassificationMetric;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const TRACKING_URI_ENV: &str = "MLFLOW_TRACKING_URI";
pub const TRACKING_USERNAME_ENV: &str = "MLFLOW_TRACKING_USERNAME";
pub const TRACKING_PASSWORD_ENV: &str = "MLFLOW_TRACKING_PASSWORD";

/// File the local tracker appends to inside its directory
pub const FILE_STORE_NAME: &str = "runs.jsonl";

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub tracking_uri: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub experiment_id: String,
    pub timeout_secs: u64,
    /// Surface tracking failures as stage failures instead of warnings
    pub fail_on_error: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tracking_uri: None,
            username: None,
            password: None,
            experiment_id: "0".to_string(),
            timeout_secs: 30,
            fail_on_error: false,
        }
    }
}

impl fmt::Debug for TrackingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingConfig")
            .field("tracking_uri", &self.tracking_uri)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("experiment_id", &self.experiment_id)
            .field("timeout_secs", &self.timeout_secs)
            .field("fail_on_error", &self.fail_on_error)
            .finish()
    }
}

impl TrackingConfig {
    /// Defaults overridden by the `MLFLOW_TRACKING_*` variables
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Replace URI and credentials with whatever `lookup` yields for the
    /// `MLFLOW_TRACKING_*` keys; empty values are ignored
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(uri) = non_empty(TRACKING_URI_ENV) {
            self.tracking_uri = Some(uri);
        }
        if let Some(username) = non_empty(TRACKING_USERNAME_ENV) {
            self.username = Some(username);
        }
        if let Some(password) = non_empty(TRACKING_PASSWORD_ENV) {
            self.password = Some(password);
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.tracking_uri
            .as_deref()
            .is_some_and(|uri| !uri.trim().is_empty())
    }
}

/// What a tracking record points at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReference {
    pub name: String,
    pub path: Option<PathBuf>,
    pub sha256: Option<String>,
}

impl ModelReference {
    /// Reference to a model that has not been written anywhere
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            sha256: None,
        }
    }

    /// Reference to a persisted model, pinned by content digest
    pub fn for_file(name: impl Into<String>, path: &Path) -> Result<Self, PersistenceError> {
        Ok(Self {
            name: name.into(),
            path: Some(path.to_path_buf()),
            sha256: Some(crate::storage::sha256_file(path)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRun {
    pub label: Option<String>,
    pub metric: ClassificationMetric,
    pub model: ModelReference,
}

impl TrackedRun {
    pub fn new(metric: ClassificationMetric, model: ModelReference) -> Self {
        Self {
            label: None,
            metric,
            model,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A store that accepts one record per scored model
pub trait ExperimentTracker {
    fn log_run(&self, run: &TrackedRun) -> Result<(), TrackingError>;

    /// Short backend name for logs
    fn backend(&self) -> &str;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledTracker;

impl ExperimentTracker for DisabledTracker {
    fn log_run(&self, run: &TrackedRun) -> Result<(), TrackingError> {
        tracing::debug!("Tracking disabled, dropping record for {}", run.model.name);
        Ok(())
    }

    fn backend(&self) -> &str {
        "disabled"
    }
}

#[derive(Serialize)]
struct FileRecord<'a> {
    timestamp: String,
    #[serde(flatten)]
    run: &'a TrackedRun,
}

/// Appends one JSON object per run to a local file
#[derive(Debug, Clone)]
pub struct FileTracker {
    path: PathBuf,
}

impl FileTracker {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(FILE_STORE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ExperimentTracker for FileTracker {
    fn log_run(&self, run: &TrackedRun) -> Result<(), TrackingError> {
        let io_error = |source| TrackingError::Io {
            path: self.path.clone(),
            source,
        };

        let mut line = serde_json::to_string(&FileRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            run,
        })?;
        line.push('\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .map_err(io_error)?;

        Ok(())
    }

    fn backend(&self) -> &str {
        "file"
    }
}

/// Client for the MLflow tracking REST API
pub struct MlflowTracker {
    base_uri: String,
    experiment_id: String,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::blocking::Client,
}

impl fmt::Debug for MlflowTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MlflowTracker")
            .field("base_uri", &self.base_uri)
            .field("experiment_id", &self.experiment_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

fn metric_entries(metric: &ClassificationMetric, timestamp_ms: i64) -> serde_json::Value {
    let entry = |key: &str, value: f64| {
        json!({ "key": key, "value": value, "timestamp": timestamp_ms, "step": 0 })
    };
    json!([
        entry("f1_score", metric.f1_score()),
        entry("precision", metric.precision_score()),
        entry("recall_score", metric.recall_score()),
    ])
}

fn log_batch_body(run_id: &str, run: &TrackedRun, timestamp_ms: i64) -> serde_json::Value {
    let mut tags = vec![json!({ "key": "model", "value": run.model.name })];
    if let Some(label) = &run.label {
        tags.push(json!({ "key": "label", "value": label }));
    }
    if let Some(path) = &run.model.path {
        tags.push(json!({ "key": "model_path", "value": path.display().to_string() }));
    }
    if let Some(digest) = &run.model.sha256 {
        tags.push(json!({ "key": "model_sha256", "value": digest }));
    }

    json!({
        "run_id": run_id,
        "metrics": metric_entries(&run.metric, timestamp_ms),
        "tags": tags,
    })
}

impl MlflowTracker {
    pub fn new(config: &TrackingConfig, base_uri: &str) -> Result<Self, TrackingError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|source| TrackingError::Http {
                endpoint: base_uri.to_string(),
                source,
            })?;

        Ok(Self {
            base_uri: base_uri.trim_end_matches('/').to_string(),
            experiment_id: config.experiment_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            client,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base_uri, method)
    }

    fn post(&self, method: &str, body: &serde_json::Value) -> Result<serde_json::Value, TrackingError> {
        let endpoint = self.endpoint(method);

        let mut request = self.client.post(&endpoint).json(body);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().map_err(|source| TrackingError::Http {
            endpoint: endpoint.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackingError::Status {
                endpoint,
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }

        response
            .json()
            .map_err(|source| TrackingError::Http { endpoint, source })
    }
}

impl ExperimentTracker for MlflowTracker {
    fn log_run(&self, run: &TrackedRun) -> Result<(), TrackingError> {
        let now = chrono::Utc::now().timestamp_millis();

        let created = self.post(
            "runs/create",
            &json!({ "experiment_id": self.experiment_id, "start_time": now }),
        )?;
        let run_id = created["run"]["info"]["run_id"]
            .as_str()
            .ok_or_else(|| TrackingError::Status {
                endpoint: self.endpoint("runs/create"),
                status: 200,
                body: format!("response carries no run id: {}", created),
            })?
            .to_string();

        self.post("runs/log-batch", &log_batch_body(&run_id, run, now))?;
        self.post(
            "runs/update",
            &json!({
                "run_id": run_id,
                "status": "FINISHED",
                "end_time": chrono::Utc::now().timestamp_millis(),
            }),
        )?;

        tracing::debug!("Logged run {} to {}", run_id, self.base_uri);
        Ok(())
    }

    fn backend(&self) -> &str {
        "mlflow"
    }
}

/// Build the tracker selected by the configured URI
pub fn tracker_from_config(config: &TrackingConfig) -> Result<Box<dyn ExperimentTracker>, TrackingError> {
    let uri = match config.tracking_uri.as_deref().map(str::trim) {
        None | Some("") => return Ok(Box::new(DisabledTracker)),
        Some(uri) => uri,
    };

    if let Some(dir) = uri.strip_prefix("file://").or_else(|| uri.strip_prefix("file:")) {
        if dir.is_empty() {
            return Err(TrackingError::Config("file tracking URI has no path".to_string()));
        }
        return Ok(Box::new(FileTracker::new(dir)));
    }

    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(Box::new(MlflowTracker::new(config, uri)?));
    }

    Err(TrackingError::Config(format!(
        "unsupported tracking URI scheme: {}",
        uri
    )))
}

/// The tracker as seen by pipeline stages, with the failure policy applied
pub struct TrackingBoundary {
    tracker: Box<dyn ExperimentTracker>,
    fail_on_error: bool,
}

impl fmt::Debug for TrackingBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingBoundary")
            .field("backend", &self.tracker.backend())
            .field("fail_on_error", &self.fail_on_error)
            .finish()
    }
}

impl TrackingBoundary {
    pub fn new(tracker: Box<dyn ExperimentTracker>, fail_on_error: bool) -> Self {
        Self {
            tracker,
            fail_on_error,
        }
    }

    pub fn from_config(config: &TrackingConfig) -> Result<Self, TrackingError> {
        let tracker = tracker_from_config(config)?;
        tracing::info!("Experiment tracking backend: {}", tracker.backend());
        Ok(Self::new(tracker, config.fail_on_error))
    }

    pub fn disabled() -> Self {
        Self::new(Box::new(DisabledTracker), false)
    }

    /// Send one record; a failure only propagates when the policy says so
    pub fn record(&self, run: &TrackedRun) -> Result<(), TrackingError> {
        match self.tracker.log_run(run) {
            Ok(()) => Ok(()),
            Err(err) if self.fail_on_error => Err(err),
            Err(err) => {
                tracing::warn!(
                    "Tracking via {} failed, continuing without it: {}",
                    self.tracker.backend(),
                    err
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FailingTracker;
    use std::collections::HashMap;

    fn run() -> TrackedRun {
        TrackedRun::new(
            ClassificationMetric::new(0.9, 0.8, 1.0).unwrap(),
            ModelReference::in_memory("GradientBoostedTrees"),
        )
        .with_label("Train")
    }

    #[test]
    fn test_overrides_from_lookup() {
        let env: HashMap<&str, &str> = [
            (TRACKING_URI_ENV, "https://tracking.example.org/repo.mlflow"),
            (TRACKING_USERNAME_ENV, "sensor-bot"),
            (TRACKING_PASSWORD_ENV, "s3cret"),
        ]
        .into_iter()
        .collect();

        let config = TrackingConfig::default().with_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(
            config.tracking_uri.as_deref(),
            Some("https://tracking.example.org/repo.mlflow")
        );
        assert_eq!(config.username.as_deref(), Some("sensor-bot"));
        assert!(config.is_enabled());
        assert!(!format!("{:?}", config).contains("s3cret"));
    }

    #[test]
    fn test_empty_override_keeps_configured_value() {
        let config = TrackingConfig {
            tracking_uri: Some("file:///tmp/runs".to_string()),
            ..TrackingConfig::default()
        }
        .with_overrides(|_| Some("  ".to_string()));

        assert_eq!(config.tracking_uri.as_deref(), Some("file:///tmp/runs"));
    }

    #[test]
    fn test_password_is_not_serialized() {
        let config = TrackingConfig {
            password: Some("s3cret".to_string()),
            ..TrackingConfig::default()
        };

        let yaml = serde_yaml::to_string(&config).unwrap();

        assert!(!yaml.contains("s3cret"));
    }

    #[test]
    fn test_backend_selection() {
        let mut config = TrackingConfig::default();
        assert_eq!(tracker_from_config(&config).unwrap().backend(), "disabled");

        config.tracking_uri = Some("file:///var/lib/sensor/tracking".to_string());
        assert_eq!(tracker_from_config(&config).unwrap().backend(), "file");

        config.tracking_uri = Some("https://tracking.example.org".to_string());
        assert_eq!(tracker_from_config(&config).unwrap().backend(), "mlflow");

        config.tracking_uri = Some("s3://bucket".to_string());
        assert!(matches!(
            tracker_from_config(&config),
            Err(TrackingError::Config(_))
        ));
    }

    #[test]
    fn test_file_tracker_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileTracker::new(dir.path().join("tracking"));

        tracker.log_run(&run()).unwrap();
        tracker.log_run(&run().with_label("Test")).unwrap();

        let contents = std::fs::read_to_string(tracker.path()).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["label"], "Train");
        assert_eq!(lines[1]["label"], "Test");
        assert_eq!(lines[0]["metric"]["f1_score"], 0.9);
        assert!(lines[0]["timestamp"].is_string());
    }

    #[test]
    fn test_log_batch_body() {
        let body = log_batch_body("abc123", &run(), 1_700_000_000_000);

        assert_eq!(body["run_id"], "abc123");
        let keys: Vec<&str> = body["metrics"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["key"].as_str().unwrap())
            .collect();
        assert_eq!(keys, vec!["f1_score", "precision", "recall_score"]);
        assert_eq!(body["metrics"][2]["value"], 1.0);
        assert!(body["tags"]
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t["key"] == "label" && t["value"] == "Train"));
    }

    #[test]
    fn test_model_reference_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, "abc").unwrap();

        let reference = ModelReference::for_file("GradientBoostedTrees", &path).unwrap();

        assert_eq!(
            reference.sha256.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_boundary_swallows_failures_by_default() {
        let boundary = TrackingBoundary::new(Box::new(FailingTracker), false);
        assert!(boundary.record(&run()).is_ok());
    }

    #[test]
    fn test_boundary_surfaces_failures_when_fatal() {
        let boundary = TrackingBoundary::new(Box::new(FailingTracker), true);
        assert!(matches!(
            boundary.record(&run()),
            Err(TrackingError::Config(_))
        ));
    }

    #[test]
    fn test_unreachable_server_is_http_error() {
        let config = TrackingConfig {
            timeout_secs: 2,
            ..TrackingConfig::default()
        };
        let tracker = MlflowTracker::new(&config, "http://127.0.0.1:9/").unwrap();

        let err = tracker.log_run(&run()).unwrap_err();

        assert!(matches!(
            err,
            TrackingError::Http { .. } | TrackingError::Status { .. }
        ));
        assert!(err
            .to_string()
            .contains("http://127.0.0.1:9/api/2.0/mlflow/runs/create"));
    }
}
