// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Model lifecycle for sensor fault detection
//!
//! This crate provides:
//! - Data transformation (constant imputation + robust scaling)
//! - Gradient-boosted tree training behind accuracy and generalization gates
//! - Evaluation of a trained model against the current best model
//! - A versioned store of accepted models
//! - Experiment tracking (MLflow REST, local JSON lines, or disabled)
//! - A pipeline that runs every stage and summarizes the run

pub mod artifact;
pub mod classifier;
pub mod config;
pub mod datasets;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod preprocess;
pub mod resolver;
pub mod storage;
pub mod tracking;
pub mod trainer;
pub mod transformation;

#[cfg(test)]
pub(crate) mod testing;

pub use artifact::{
    DataTransformationArtifact, DataValidationArtifact, ModelEvaluationArtifact, ModelTrainerArtifact,
};
pub use classifier::{BoostingParams, Classifier, GradientBoostedTrees};
pub use config::{PipelineConfig, RunLayout};
pub use datasets::{FeatureMatrix, LabeledArray, SensorFrame, TargetValueMapping};
pub use error::{Failure, Rejection, StageError};
pub use evaluator::{is_model_accepted, ModelEvaluation};
pub use metrics::{ClassificationMetric, ConfusionMatrix};
pub use model::SensorModel;
pub use pipeline::{PipelineRun, TrainingPipeline};
pub use preprocess::Preprocessor;
pub use resolver::ModelResolver;
pub use tracking::{ExperimentTracker, TrackingBoundary, TrackingConfig};
pub use trainer::ModelTrainer;
pub use transformation::DataTransformation;
