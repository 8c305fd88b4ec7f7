// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Model evaluation stage
//!
//! Compares the freshly trained model with the current best model on the
//! combined validation tables. With no best model the trained model is
//! accepted outright; otherwise it must beat the best f1 by more than
//! `change_threshold`.
//!
//! The auto-accept path sends no tracking record. Both paths write the
//! YAML report.

use crate::artifact::{DataValidationArtifact, ModelEvaluationArtifact, ModelTrainerArtifact};
use crate::classifier::{Classifier, GradientBoostedTrees};
use crate::config::ModelEvaluationConfig;
use crate::datasets::{SensorFrame, TargetValueMapping};
use crate::error::StageError;
use crate::metrics::ClassificationMetric;
use crate::model::SensorModel;
use crate::resolver::ModelResolver;
use crate::tracking::{ModelReference, TrackedRun, TrackingBoundary};
use std::marker::PhantomData;
use std::path::Path;

/// Acceptance rule for a model that has something to beat
///
/// Strict: an improvement equal to the threshold is not enough.
pub fn is_model_accepted(change_threshold: f64, improved_accuracy: f64) -> bool {
    change_threshold < improved_accuracy
}

/// Evaluation stage: decides whether a trained model replaces the best one
pub struct ModelEvaluation<'a, C = GradientBoostedTrees> {
    config: ModelEvaluationConfig,
    validation_artifact: DataValidationArtifact,
    trainer_artifact: ModelTrainerArtifact,
    mapping: TargetValueMapping,
    tracking: &'a TrackingBoundary,
    classifier: PhantomData<C>,
}

impl<'a, C: Classifier> ModelEvaluation<'a, C> {
    /// Evaluate the model named by `trainer_artifact` on the validated tables
    pub fn new(
        config: ModelEvaluationConfig,
        validation_artifact: DataValidationArtifact,
        trainer_artifact: ModelTrainerArtifact,
        tracking: &'a TrackingBoundary,
    ) -> Self {
        Self {
            config,
            validation_artifact,
            trainer_artifact,
            mapping: TargetValueMapping::default(),
            tracking,
            classifier: PhantomData,
        }
    }

    fn score(path: &Path, frame: &SensorFrame) -> Result<(SensorModel<C>, ClassificationMetric), StageError> {
        let model: SensorModel<C> = SensorModel::load(path)?;
        let predictions = model.predict(&frame.features)?;
        let metric = ClassificationMetric::from_predictions(&frame.target, &predictions)?;
        Ok((model, metric))
    }

    /// Score, compare and write the evaluation report
    pub fn initiate_model_evaluation(&self) -> Result<ModelEvaluationArtifact, StageError> {
        let frame = SensorFrame::load_combined(
            &[
                self.validation_artifact.valid_train_file_path.clone(),
                self.validation_artifact.valid_test_file_path.clone(),
            ],
            &self.mapping,
        )?;
        tracing::info!("Evaluating on {} validated rows", frame.len());

        let resolver = ModelResolver::new(&self.config.saved_model_dir);
        let trained_model_path = &self.trainer_artifact.trained_model_file_path;

        let artifact = if !resolver.is_model_exists()? {
            tracing::info!("No best model in {}, accepting the trained model", resolver.model_dir().display());
            ModelEvaluationArtifact {
                is_model_accepted: true,
                improved_accuracy: None,
                best_model_path: None,
                trained_model_path: trained_model_path.clone(),
                train_model_metric_artifact: self.trainer_artifact.test_metric_artifact,
                best_model_metric_artifact: None,
            }
        } else {
            let best_model_path = resolver.get_best_model_path()?;
            let (_, best_metric) = Self::score(&best_model_path, &frame)?;
            let (trained_model, trained_metric) = Self::score(trained_model_path, &frame)?;

            let reference = ModelReference::for_file(trained_model.classifier().name(), trained_model_path)?;
            self.tracking.record(&TrackedRun::new(trained_metric, reference))?;

            let improved_accuracy = trained_metric.f1_score() - best_metric.f1_score();
            let is_model_accepted = is_model_accepted(self.config.change_threshold, improved_accuracy);
            tracing::info!(
                "Trained f1 {:.4} vs best f1 {:.4} ({}): improvement {:+.4}, threshold {:.4}, accepted: {}",
                trained_metric.f1_score(),
                best_metric.f1_score(),
                best_model_path.display(),
                improved_accuracy,
                self.config.change_threshold,
                is_model_accepted
            );

            ModelEvaluationArtifact {
                is_model_accepted,
                improved_accuracy: Some(improved_accuracy),
                best_model_path: Some(best_model_path),
                trained_model_path: trained_model_path.clone(),
                train_model_metric_artifact: trained_metric,
                best_model_metric_artifact: Some(best_metric),
            }
        };

        artifact.write_report(&self.config.report_file_path)?;
        tracing::info!("Evaluation report written to {}", self.config.report_file_path.display());

        Ok(artifact)
    }
}
