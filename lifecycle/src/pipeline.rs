// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Training pipeline for the sensor fault model
//!
//! Orchestrates:
//! - Data transformation
//! - Model training behind the accuracy and generalization gates
//! - Evaluation against the current best model
//! - Promotion of an accepted model into the saved model store
//! - Run summary serialization
//!
//! Every stage leaves its artifact as `<run>/<stage>/artifact.json`, so a
//! later stage can be resumed from an existing run directory.

use crate::artifact::{DataTransformationArtifact, ModelEvaluationArtifact, ModelTrainerArtifact};
use crate::config::{PipelineConfig, RunLayout};
use crate::error::{ModelResolutionError, StageError};
use crate::evaluator::ModelEvaluation;
use crate::metrics::ClassificationMetric;
use crate::resolver::ModelResolver;
use crate::trainer::ModelTrainer;
use crate::tracking::TrackingBoundary;
use crate::transformation::DataTransformation;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STAGE_DATA_TRANSFORMATION: &str = "data_transformation";
pub const STAGE_MODEL_TRAINER: &str = "model_trainer";
pub const STAGE_MODEL_EVALUATION: &str = "model_evaluation";

const STAGE_ARTIFACT_FILE: &str = "artifact.json";

/// Everything one complete pipeline run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub artifact_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub transformation: DataTransformationArtifact,
    pub trainer: ModelTrainerArtifact,
    pub evaluation: ModelEvaluationArtifact,
    pub promoted_model_path: Option<PathBuf>,
    pub version: String,
}

pub struct TrainingPipeline {
    config: PipelineConfig,
    run: RunLayout,
    tracking: TrackingBoundary,
}

impl TrainingPipeline {
    /// Pipeline whose tracker is built from `config.tracking`
    pub fn new(config: PipelineConfig, run: RunLayout) -> Result<Self, StageError> {
        let tracking = TrackingBoundary::from_config(&config.tracking)?;
        Ok(Self::with_tracking(config, run, tracking))
    }

    pub fn with_tracking(config: PipelineConfig, run: RunLayout, tracking: TrackingBoundary) -> Self {
        Self { config, run, tracking }
    }

    pub fn run_layout(&self) -> &RunLayout {
        &self.run
    }

    fn save_stage_artifact<T: Serialize>(&self, stage: &str, artifact: &T) -> Result<(), StageError> {
        let path = self.run.stage_dir(stage).join(STAGE_ARTIFACT_FILE);
        crate::storage::save_json(&path, artifact)?;
        Ok(())
    }

    /// Artifact left behind by an earlier stage of this run
    pub fn load_stage_artifact<T: DeserializeOwned>(&self, stage: &str) -> Result<T, StageError> {
        let path = self.run.stage_dir(stage).join(STAGE_ARTIFACT_FILE);
        Ok(crate::storage::load_json(&path)?)
    }

    pub fn start_data_transformation(&self) -> Result<DataTransformationArtifact, StageError> {
        tracing::info!("Starting data transformation");
        let artifact = DataTransformation::new(
            self.config.transformation_config(&self.run),
            self.config.data_validation_artifact(),
        )
        .initiate_data_transformation()?;
        self.save_stage_artifact(STAGE_DATA_TRANSFORMATION, &artifact)?;
        Ok(artifact)
    }

    pub fn start_model_trainer(
        &self,
        transformation: &DataTransformationArtifact,
    ) -> Result<ModelTrainerArtifact, StageError> {
        tracing::info!("Starting model training");
        let artifact = ModelTrainer::new(
            self.config.trainer_config(&self.run),
            transformation.clone(),
            &self.tracking,
        )
        .initiate_model_trainer()?;
        self.save_stage_artifact(STAGE_MODEL_TRAINER, &artifact)?;
        Ok(artifact)
    }

    pub fn start_model_evaluation(
        &self,
        trainer: &ModelTrainerArtifact,
    ) -> Result<ModelEvaluationArtifact, StageError> {
        tracing::info!("Starting model evaluation");
        let artifact = ModelEvaluation::<crate::classifier::GradientBoostedTrees>::new(
            self.config.evaluation_config(&self.run),
            self.config.data_validation_artifact(),
            trainer.clone(),
            &self.tracking,
        )
        .initiate_model_evaluation()?;
        self.save_stage_artifact(STAGE_MODEL_EVALUATION, &artifact)?;
        Ok(artifact)
    }

    /// Copy an accepted model into the saved model store
    ///
    /// The new version is always above every existing one, so the promoted
    /// model becomes the best model for the next run.
    pub fn start_model_promotion(
        &self,
        evaluation: &ModelEvaluationArtifact,
    ) -> Result<Option<PathBuf>, StageError> {
        if !evaluation.is_model_accepted {
            tracing::info!("Trained model was not accepted, nothing to promote");
            return Ok(None);
        }

        let resolver = ModelResolver::new(&self.config.saved_model_dir);
        let version = match resolver.versions()?.last() {
            Some(&latest) => {
                let next = latest
                    .checked_add(1)
                    .ok_or(ModelResolutionError::VersionExhausted(latest))?;
                self.run.model_version().max(next)
            }
            None => self.run.model_version(),
        };

        let promoted = resolver.promote(&evaluation.trained_model_path, version)?;
        Ok(Some(promoted))
    }

    /// Run every stage in order
    pub fn run(&self) -> Result<PipelineRun, StageError> {
        tracing::info!("Pipeline run in {}", self.run.artifact_dir.display());

        let transformation = self.start_data_transformation()?;
        let trainer = self.start_model_trainer(&transformation)?;
        let evaluation = self.start_model_evaluation(&trainer)?;
        let promoted_model_path = self.start_model_promotion(&evaluation)?;

        Ok(PipelineRun {
            artifact_dir: self.run.artifact_dir.clone(),
            started_at: self.run.started_at,
            transformation,
            trainer,
            evaluation,
            promoted_model_path,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}

fn metric_row(name: &str, metric: &ClassificationMetric) -> String {
    format!(
        "| {} | {:.4} | {:.4} | {:.4} |\n",
        name,
        metric.f1_score(),
        metric.precision_score(),
        metric.recall_score()
    )
}

impl PipelineRun {
    /// Generate a markdown summary
    pub fn to_markdown(&self) -> String {
        let mut report = String::new();

        report.push_str("# Sensor Fault Model Pipeline Run\n\n");
        report.push_str(&format!("**Started:** {}\n\n", self.started_at.format("%Y-%m-%d %H:%M:%S UTC")));
        report.push_str(&format!("**Version:** {}\n\n", self.version));
        report.push_str(&format!("**Artifacts:** {}\n\n", self.artifact_dir.display()));

        report.push_str("## Training\n\n");
        report.push_str("| Split | F1 Score | Precision | Recall |\n");
        report.push_str("|-------|----------|-----------|--------|\n");
        report.push_str(&metric_row("Train", &self.trainer.train_metric_artifact));
        report.push_str(&metric_row("Test", &self.trainer.test_metric_artifact));
        report.push_str(&format!(
            "\nTrained model: {}\n\n",
            self.trainer.trained_model_file_path.display()
        ));

        report.push_str("## Evaluation\n\n");
        let evaluation = &self.evaluation;
        if evaluation.is_first_model() {
            report.push_str("No best model existed; the trained model was accepted as the first model.\n\n");
        } else {
            report.push_str(&format!(
                "**Accepted:** {}\n\n",
                if evaluation.is_model_accepted { "yes" } else { "no" }
            ));
            if let Some(improved) = evaluation.improved_accuracy {
                report.push_str(&format!("**F1 improvement:** {:+.4}\n\n", improved));
            }
        }

        report.push_str("| Model | F1 Score | Precision | Recall |\n");
        report.push_str("|-------|----------|-----------|--------|\n");
        report.push_str(&metric_row("Trained", &evaluation.train_model_metric_artifact));
        if let Some(best) = &evaluation.best_model_metric_artifact {
            report.push_str(&metric_row("Best", best));
        }
        if let Some(path) = &evaluation.best_model_path {
            report.push_str(&format!("\nBest model: {}\n", path.display()));
        }

        report.push_str("\n## Promotion\n\n");
        match &self.promoted_model_path {
            Some(path) => report.push_str(&format!("Promoted to {}\n", path.display())),
            None => report.push_str("Not promoted\n"),
        }

        report
    }

    /// Save the run as JSON and the markdown summary into `output_dir`
    pub fn save(&self, output_dir: &Path) -> Result<Vec<PathBuf>, crate::error::PersistenceError> {
        let json_path = output_dir.join("pipeline_run.json");
        crate::storage::save_json(&json_path, self)?;

        let md_path = output_dir.join("pipeline_run.md");
        crate::storage::write_atomically(&md_path, self.to_markdown().as_bytes())?;

        tracing::info!("Run summary saved to {}", md_path.display());
        Ok(vec![json_path, md_path])
    }
}
