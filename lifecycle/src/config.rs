// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Pipeline configuration
//!
//! [`PipelineConfig`] is loaded from an optional YAML file; every field has
//! a default so a partial file (or none at all) is enough. A pipeline run
//! then derives its per-stage configs from a [`RunLayout`], which pins the
//! run's artifact directory and timestamp.

use crate::classifier::BoostingParams;
use crate::resolver::MODEL_FILE_NAME;
use crate::tracking::TrackingConfig;
use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ARTIFACT_DIR: &str = "artifact";
pub const SAVED_MODEL_DIR: &str = "saved_models";
pub const REPORT_FILE_NAME: &str = "report.yaml";
pub const PREPROCESSOR_FILE_NAME: &str = "preprocessing.json";
pub const TRAIN_FILE_NAME: &str = "train.csv";
pub const TEST_FILE_NAME: &str = "test.csv";
pub const TIMESTAMP_FORMAT: &str = "%m_%d_%Y_%H_%M_%S";

/// Validated sensor tables produced by the upstream validation stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub valid_train_file_path: PathBuf,
    pub valid_test_file_path: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        let valid = Path::new(ARTIFACT_DIR).join("data_validation").join("validated");
        Self {
            valid_train_file_path: valid.join(TRAIN_FILE_NAME),
            valid_test_file_path: valid.join(TEST_FILE_NAME),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    /// Train f1 must be strictly greater than this
    pub expected_accuracy: f64,
    /// Largest tolerated |train f1 - test f1|
    pub overfitting_underfitting_threshold: f64,
    pub boosting: BoostingParams,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            expected_accuracy: 0.6,
            overfitting_underfitting_threshold: 0.05,
            boosting: BoostingParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    /// A new model must beat the best one by more than this f1 margin
    pub change_threshold: f64,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            change_threshold: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub artifact_dir: PathBuf,
    pub saved_model_dir: PathBuf,
    pub data: DataConfig,
    pub trainer: TrainerSettings,
    pub evaluation: EvaluationSettings,
    pub tracking: TrackingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from(ARTIFACT_DIR),
            saved_model_dir: PathBuf::from(SAVED_MODEL_DIR),
            data: DataConfig::default(),
            trainer: TrainerSettings::default(),
            evaluation: EvaluationSettings::default(),
            tracking: TrackingConfig::default(),
        }
    }
}

fn check_unit_interval(name: &str, value: f64) -> Result<()> {
    ensure!(
        value.is_finite() && (0.0..=1.0).contains(&value),
        "{} must be within [0, 1], got {}",
        name,
        value
    );
    Ok(())
}

impl PipelineConfig {
    /// Load from YAML, falling back to defaults for anything omitted
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: PipelineConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config YAML {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults when no file is given
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_unit_interval("trainer.expected_accuracy", self.trainer.expected_accuracy)?;
        check_unit_interval(
            "trainer.overfitting_underfitting_threshold",
            self.trainer.overfitting_underfitting_threshold,
        )?;
        check_unit_interval("evaluation.change_threshold", self.evaluation.change_threshold)?;
        ensure!(
            self.tracking.timeout_secs > 0,
            "tracking.timeout_secs must be positive"
        );
        self.trainer
            .boosting
            .validate()
            .context("Invalid trainer.boosting parameters")?;
        Ok(())
    }

    /// Layout for a fresh run started at `now`
    pub fn new_run(&self, now: DateTime<Utc>) -> RunLayout {
        RunLayout::new(&self.artifact_dir, now)
    }

    pub fn data_validation_artifact(&self) -> crate::artifact::DataValidationArtifact {
        crate::artifact::DataValidationArtifact {
            valid_train_file_path: self.data.valid_train_file_path.clone(),
            valid_test_file_path: self.data.valid_test_file_path.clone(),
        }
    }

    pub fn transformation_config(&self, run: &RunLayout) -> DataTransformationConfig {
        let dir = run.stage_dir("data_transformation");
        DataTransformationConfig {
            transformed_train_file_path: dir.join("transformed").join(TRAIN_FILE_NAME),
            transformed_test_file_path: dir.join("transformed").join(TEST_FILE_NAME),
            transformed_object_file_path: dir.join("transformed_object").join(PREPROCESSOR_FILE_NAME),
        }
    }

    pub fn trainer_config(&self, run: &RunLayout) -> ModelTrainerConfig {
        ModelTrainerConfig {
            trained_model_file_path: run
                .stage_dir("model_trainer")
                .join("trained_model")
                .join(MODEL_FILE_NAME),
            expected_accuracy: self.trainer.expected_accuracy,
            overfitting_underfitting_threshold: self.trainer.overfitting_underfitting_threshold,
            boosting: self.trainer.boosting.clone(),
        }
    }

    pub fn evaluation_config(&self, run: &RunLayout) -> ModelEvaluationConfig {
        ModelEvaluationConfig {
            report_file_path: run.stage_dir("model_evaluation").join(REPORT_FILE_NAME),
            change_threshold: self.evaluation.change_threshold,
            saved_model_dir: self.saved_model_dir.clone(),
        }
    }
}

/// Directory and clock of a single pipeline run
#[derive(Debug, Clone, PartialEq)]
pub struct RunLayout {
    pub artifact_dir: PathBuf,
    pub started_at: DateTime<Utc>,
}

impl RunLayout {
    /// `<root>/<%m_%d_%Y_%H_%M_%S>`
    pub fn new(root: &Path, started_at: DateTime<Utc>) -> Self {
        Self {
            artifact_dir: root.join(started_at.format(TIMESTAMP_FORMAT).to_string()),
            started_at,
        }
    }

    /// Resume an existing run directory
    pub fn at(artifact_dir: impl Into<PathBuf>, started_at: DateTime<Utc>) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            started_at,
        }
    }

    pub fn stage_dir(&self, stage: &str) -> PathBuf {
        self.artifact_dir.join(stage)
    }

    /// Version under which an accepted model from this run is saved
    pub fn model_version(&self) -> u64 {
        u64::try_from(self.started_at.timestamp()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataTransformationConfig {
    pub transformed_train_file_path: PathBuf,
    pub transformed_test_file_path: PathBuf,
    pub transformed_object_file_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelTrainerConfig {
    pub trained_model_file_path: PathBuf,
    pub expected_accuracy: f64,
    pub overfitting_underfitting_threshold: f64,
    pub boosting: BoostingParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelEvaluationConfig {
    pub report_file_path: PathBuf,
    pub change_threshold: f64,
    pub saved_model_dir: PathBuf,
}
