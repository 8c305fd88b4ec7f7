// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Artifacts handed from one pipeline stage to the next

use crate::error::PersistenceError;
use crate::metrics::ClassificationMetric;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Validated sensor tables produced upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValidationArtifact {
    pub valid_train_file_path: PathBuf,
    pub valid_test_file_path: PathBuf,
}

/// Output of the transformation stage, input to the trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTransformationArtifact {
    pub transformed_object_file_path: PathBuf,
    pub transformed_train_file_path: PathBuf,
    pub transformed_test_file_path: PathBuf,
}

/// Output of a successful training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTrainerArtifact {
    pub trained_model_file_path: PathBuf,
    pub train_metric_artifact: ClassificationMetric,
    pub test_metric_artifact: ClassificationMetric,
}

/// Verdict and comparison metrics from the evaluator
///
/// `improved_accuracy`, `best_model_path` and `best_model_metric_artifact`
/// are only absent when no best model existed (first-ever training).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEvaluationArtifact {
    pub is_model_accepted: bool,
    pub improved_accuracy: Option<f64>,
    pub best_model_path: Option<PathBuf>,
    pub trained_model_path: PathBuf,
    pub train_model_metric_artifact: ClassificationMetric,
    pub best_model_metric_artifact: Option<ClassificationMetric>,
}

impl ModelEvaluationArtifact {
    /// True when the model was accepted because nothing existed to compare against
    pub fn is_first_model(&self) -> bool {
        self.is_model_accepted && self.best_model_path.is_none()
    }

    /// Write the evaluation report as YAML
    pub fn write_report(&self, path: &Path) -> Result<(), PersistenceError> {
        crate::storage::save_yaml(path, self)
    }

    pub fn read_report(path: &Path) -> Result<Self, PersistenceError> {
        crate::storage::load_yaml(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(f1: f64) -> ClassificationMetric {
        ClassificationMetric::new(f1, f1, f1).unwrap()
    }

    #[test]
    fn test_report_yaml_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_evaluation/report.yaml");
        let artifact = ModelEvaluationArtifact {
            is_model_accepted: false,
            improved_accuracy: Some(-0.01),
            best_model_path: Some(PathBuf::from("saved_models/1700000000/model.json")),
            trained_model_path: PathBuf::from("artifact/run/model_trainer/trained_model/model.json"),
            train_model_metric_artifact: metric(0.79),
            best_model_metric_artifact: Some(metric(0.8)),
        };

        artifact.write_report(&path).unwrap();
        let yaml = std::fs::read_to_string(&path).unwrap();

        assert!(yaml.contains("is_model_accepted: false"));
        assert!(yaml.contains("improved_accuracy: -0.01"));
        assert!(yaml.contains("f1_score: 0.79"));
        assert_eq!(ModelEvaluationArtifact::read_report(&path).unwrap(), artifact);
        assert!(!artifact.is_first_model());
    }

    #[test]
    fn test_first_model_report_has_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.yaml");
        let artifact = ModelEvaluationArtifact {
            is_model_accepted: true,
            improved_accuracy: None,
            best_model_path: None,
            trained_model_path: PathBuf::from("model.json"),
            train_model_metric_artifact: metric(0.9),
            best_model_metric_artifact: None,
        };

        artifact.write_report(&path).unwrap();
        let yaml = std::fs::read_to_string(&path).unwrap();

        assert!(yaml.contains("best_model_path: null"));
        assert!(artifact.is_first_model());
    }
}
