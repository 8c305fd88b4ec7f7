// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Error taxonomy for the model lifecycle stages
//!
//! Stage entry points return [`StageError`], which keeps a deliberate
//! rejection by a quality gate ([`Rejection`]) apart from a data or
//! infrastructure failure ([`Failure`]). Callers branch on the variant
//! instead of inspecting messages.

use std::path::PathBuf;
use thiserror::Error;

/// Input files that are missing, unreadable or malformed
#[derive(Debug, Error)]
pub enum DataLoadError {
    #[error("failed to open {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read CSV {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("malformed data in {}: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("failed to load serialized input: {0}")]
    Object(#[from] PersistenceError),
}

/// Failures raised while fitting a classifier
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrainingError {
    #[error("training data is empty")]
    EmptyData,

    #[error("feature matrix has {rows} rows but {labels} labels were given")]
    LengthMismatch { rows: usize, labels: usize },

    #[error("label {label} at row {row} is not binary (expected 0 or 1)")]
    InvalidLabel { row: usize, label: u8 },

    #[error("feature {col} at row {row} is not finite")]
    NonFiniteFeature { row: usize, col: usize },

    #[error("invalid classifier parameter: {0}")]
    InvalidParameter(String),
}

/// Feature width disagrees with what a fitted transform or model expects
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected} feature columns, got {actual}")]
pub struct SchemaError {
    pub expected: usize,
    pub actual: usize,
}

/// Persisted model state that would break prediction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {component} state: {reason}")]
pub struct InvalidStateError {
    pub component: &'static str,
    pub reason: String,
}

/// A classifier could not produce predictions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredictionError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("{0} has not been fitted")]
    NotFitted(String),
}

/// Metric values that cannot be represented as a valid score
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    #[error("{name} must be a finite value in [0, 1], got {value}")]
    OutOfRange { name: &'static str, value: f64 },

    #[error("label sequences differ in length: {y_true} true vs {y_pred} predicted")]
    LengthMismatch { y_true: usize, y_pred: usize },

    #[error("cannot score an empty label sequence")]
    Empty,
}

/// Best-model lookup failures
#[derive(Debug, Error)]
pub enum ModelResolutionError {
    #[error("no saved model versions under {}", .0.display())]
    NoModels(PathBuf),

    #[error("failed to scan model store {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("model version {0} leaves no room for a newer version")]
    VersionExhausted(u64),
}

/// Failures writing or reading serialized artifacts
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error on {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("YAML error on {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("CSV error on {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Experiment-tracking failures
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("tracking request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("tracking server answered {endpoint} with status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("failed to append to tracking store {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode tracking record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid tracking configuration: {0}")]
    Config(String),
}

/// A quality gate refused the trained model
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error(
        "trained model f1 {train_f1:.4} does not exceed expected accuracy {expected_accuracy:.4}"
    )]
    InsufficientAccuracy { train_f1: f64, expected_accuracy: f64 },

    #[error(
        "train/test f1 gap {diff:.4} exceeds overfitting/underfitting threshold {threshold:.4} \
         (train {train_f1:.4}, test {test_f1:.4})"
    )]
    Generalization {
        train_f1: f64,
        test_f1: f64,
        diff: f64,
        threshold: f64,
    },
}

/// Anything that stopped a stage other than a quality gate
#[derive(Debug, Error)]
pub enum Failure {
    #[error(transparent)]
    DataLoad(#[from] DataLoadError),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Prediction(#[from] PredictionError),

    #[error(transparent)]
    Metric(#[from] MetricError),

    #[error(transparent)]
    ModelResolution(#[from] ModelResolutionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),
}

/// Outcome of a stage that did not produce its artifact
#[derive(Debug, Error)]
pub enum StageError {
    #[error("model rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("stage failed: {0}")]
    Failed(#[from] Failure),
}

impl StageError {
    /// True when a quality gate stopped the stage on purpose
    pub fn is_rejection(&self) -> bool {
        matches!(self, StageError::Rejected(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            StageError::Rejected(rejection) => Some(rejection),
            StageError::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            StageError::Rejected(_) => None,
            StageError::Failed(failure) => Some(failure),
        }
    }
}

macro_rules! impl_stage_failure {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StageError {
                fn from(err: $ty) -> Self {
                    StageError::Failed(Failure::from(err))
                }
            }
        )*
    };
}

impl_stage_failure!(
    DataLoadError,
    TrainingError,
    SchemaError,
    PredictionError,
    MetricError,
    ModelResolutionError,
    PersistenceError,
    TrackingError,
);
