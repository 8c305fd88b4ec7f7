// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Model trainer stage
//!
//! Fits a classifier on the transformed training array and only persists
//! it when two gates pass:
//!
//! 1. train f1 strictly above `expected_accuracy`
//! 2. |train f1 - test f1| at most `overfitting_underfitting_threshold`
//!
//! A rejected model leaves nothing on disk.

use crate::artifact::{DataTransformationArtifact, ModelTrainerArtifact};
use crate::classifier::{Classifier, GradientBoostedTrees};
use crate::config::ModelTrainerConfig;
use crate::datasets::{load_array, FeatureMatrix, LabeledArray};
use crate::error::{Rejection, SchemaError, StageError, TrainingError};
use crate::metrics::ClassificationMetric;
use crate::model::SensorModel;
use crate::preprocess::Preprocessor;
use crate::tracking::{ModelReference, TrackedRun, TrackingBoundary};

/// Training stage: fits, gates and persists a sensor fault model
pub struct ModelTrainer<'a, C = GradientBoostedTrees> {
    config: ModelTrainerConfig,
    transformation_artifact: DataTransformationArtifact,
    classifier: C,
    tracking: &'a TrackingBoundary,
}

impl<'a> ModelTrainer<'a, GradientBoostedTrees> {
    /// Trainer for the boosted-tree model configured in `config.boosting`
    pub fn new(
        config: ModelTrainerConfig,
        transformation_artifact: DataTransformationArtifact,
        tracking: &'a TrackingBoundary,
    ) -> Self {
        let classifier = GradientBoostedTrees::new(config.boosting.clone());
        Self::with_classifier(config, transformation_artifact, classifier, tracking)
    }
}

impl<'a, C: Classifier + Clone> ModelTrainer<'a, C> {
    /// Trainer that fits copies of an unfitted `classifier`
    pub fn with_classifier(
        config: ModelTrainerConfig,
        transformation_artifact: DataTransformationArtifact,
        classifier: C,
        tracking: &'a TrackingBoundary,
    ) -> Self {
        Self {
            config,
            transformation_artifact,
            classifier,
            tracking,
        }
    }

    /// Fit a fresh copy of the configured classifier
    pub fn train_model(&self, x_train: &FeatureMatrix, y_train: &[u8]) -> Result<C, TrainingError> {
        let mut model = self.classifier.clone();
        model.fit(x_train, y_train)?;
        Ok(model)
    }

    fn score(model: &C, data: &LabeledArray) -> Result<ClassificationMetric, StageError> {
        let predictions = model.predict(&data.features)?;
        Ok(ClassificationMetric::from_predictions(&data.labels, &predictions)?)
    }

    fn track(&self, model: &C, metric: ClassificationMetric, label: &str) -> Result<(), StageError> {
        let run = TrackedRun::new(metric, ModelReference::in_memory(model.name())).with_label(label);
        self.tracking.record(&run)?;
        Ok(())
    }

    /// Train, apply both gates and save the model when they pass
    pub fn initiate_model_trainer(&self) -> Result<ModelTrainerArtifact, StageError> {
        tracing::info!("Loading transformed training and testing arrays");
        let train = load_array(&self.transformation_artifact.transformed_train_file_path)?;
        let test = load_array(&self.transformation_artifact.transformed_test_file_path)?;

        tracing::info!("Training {} on {} rows", self.classifier.name(), train.len());
        let model = self.train_model(&train.features, &train.labels)?;

        let train_metric = Self::score(&model, &train)?;
        self.track(&model, train_metric, "Train")?;
        tracing::info!("Train f1 score: {:.4}", train_metric.f1_score());

        if train_metric.f1_score() <= self.config.expected_accuracy {
            return Err(Rejection::InsufficientAccuracy {
                train_f1: train_metric.f1_score(),
                expected_accuracy: self.config.expected_accuracy,
            }
            .into());
        }

        let test_metric = Self::score(&model, &test)?;
        self.track(&model, test_metric, "Test")?;
        tracing::info!("Test f1 score: {:.4}", test_metric.f1_score());

        let diff = (train_metric.f1_score() - test_metric.f1_score()).abs();
        if diff > self.config.overfitting_underfitting_threshold {
            return Err(Rejection::Generalization {
                train_f1: train_metric.f1_score(),
                test_f1: test_metric.f1_score(),
                diff,
                threshold: self.config.overfitting_underfitting_threshold,
            }
            .into());
        }

        let preprocessor = Preprocessor::load(&self.transformation_artifact.transformed_object_file_path)?;
        if preprocessor.n_features() != train.features.cols() {
            return Err(SchemaError {
                expected: train.features.cols(),
                actual: preprocessor.n_features(),
            }
            .into());
        }

        let sensor_model = SensorModel::new(preprocessor, model);
        sensor_model.save(&self.config.trained_model_file_path)?;

        Ok(ModelTrainerArtifact {
            trained_model_file_path: self.config.trained_model_file_path.clone(),
            train_metric_artifact: train_metric,
            test_metric_artifact: test_metric,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::BoostingParams;
    use crate::datasets::save_array;
    use crate::error::{DataLoadError, Failure};
    use crate::testing::{confusion_array, FailingTracker, RecordingTracker, StubClassifier};
    use std::path::Path;

    fn write_inputs(dir: &Path, train: &LabeledArray, test: &LabeledArray) -> DataTransformationArtifact {
        let artifact = DataTransformationArtifact {
            transformed_object_file_path: dir.join("transformed_object/preprocessing.json"),
            transformed_train_file_path: dir.join("transformed/train.csv"),
            transformed_test_file_path: dir.join("transformed/test.csv"),
        };
        save_array(&artifact.transformed_train_file_path, train).unwrap();
        save_array(&artifact.transformed_test_file_path, test).unwrap();
        Preprocessor::identity(train.features.cols())
            .save(&artifact.transformed_object_file_path)
            .unwrap();
        artifact
    }

    fn trainer_config(dir: &Path, expected_accuracy: f64, threshold: f64) -> ModelTrainerConfig {
        ModelTrainerConfig {
            trained_model_file_path: dir.join("model_trainer/trained_model/model.json"),
            expected_accuracy,
            overfitting_underfitting_threshold: threshold,
            boosting: BoostingParams::default(),
        }
    }

    #[test]
    fn test_insufficient_accuracy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        // train f1 0.50
        let artifact = write_inputs(dir.path(), &confusion_array(1, 1, 1, 1), &confusion_array(1, 1, 1, 1));
        let config = trainer_config(dir.path(), 0.60, 0.05);
        let model_path = config.trained_model_file_path.clone();
        let recorder = RecordingTracker::default();
        let tracking = TrackingBoundary::new(Box::new(recorder.clone()), false);
        let trainer = ModelTrainer::with_classifier(config, artifact, StubClassifier::on_column(0), &tracking);

        let err = trainer.initiate_model_trainer().unwrap_err();

        match err.rejection() {
            Some(Rejection::InsufficientAccuracy {
                train_f1,
                expected_accuracy,
            }) => {
                assert!((train_f1 - 0.5).abs() < 1e-9);
                assert_eq!(*expected_accuracy, 0.6);
            }
            other => panic!("expected InsufficientAccuracy, got {:?}", other),
        }
        assert!(!model_path.exists());
        assert_eq!(recorder.labels(), vec![Some("Train".to_string())]);
    }

    #[test]
    fn test_generalization_gap_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        // train f1 0.90, test f1 0.60
        let artifact = write_inputs(dir.path(), &confusion_array(9, 1, 1, 5), &confusion_array(3, 2, 2, 3));
        let config = trainer_config(dir.path(), 0.60, 0.10);
        let model_path = config.trained_model_file_path.clone();
        let recorder = RecordingTracker::default();
        let tracking = TrackingBoundary::new(Box::new(recorder.clone()), false);
        let trainer = ModelTrainer::with_classifier(config, artifact, StubClassifier::on_column(0), &tracking);

        let err = trainer.initiate_model_trainer().unwrap_err();

        match err.rejection() {
            Some(Rejection::Generalization { diff, threshold, .. }) => {
                assert!((diff - 0.30).abs() < 1e-9);
                assert_eq!(*threshold, 0.10);
            }
            other => panic!("expected Generalization, got {:?}", other),
        }
        assert!(!model_path.exists());
        assert_eq!(
            recorder.labels(),
            vec![Some("Train".to_string()), Some("Test".to_string())]
        );
    }

    #[test]
    fn test_train_f1_equal_to_expected_accuracy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        // train f1 exactly 0.50
        let artifact = write_inputs(dir.path(), &confusion_array(1, 1, 1, 1), &confusion_array(1, 1, 1, 1));
        let config = trainer_config(dir.path(), 0.50, 0.05);
        let model_path = config.trained_model_file_path.clone();
        let tracking = TrackingBoundary::disabled();
        let trainer = ModelTrainer::with_classifier(config, artifact, StubClassifier::on_column(0), &tracking);

        let err = trainer.initiate_model_trainer().unwrap_err();

        assert!(matches!(
            err.rejection(),
            Some(Rejection::InsufficientAccuracy { train_f1, .. }) if *train_f1 == 0.5
        ));
        assert!(!model_path.exists());
    }

    #[test]
    fn test_underfit_gap_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        // train f1 0.70, test f1 1.00
        let artifact = write_inputs(dir.path(), &confusion_array(7, 3, 3, 7), &confusion_array(4, 0, 0, 4));
        let config = trainer_config(dir.path(), 0.60, 0.05);
        let model_path = config.trained_model_file_path.clone();
        let tracking = TrackingBoundary::disabled();
        let trainer = ModelTrainer::with_classifier(config, artifact, StubClassifier::on_column(0), &tracking);

        let err = trainer.initiate_model_trainer().unwrap_err();

        match err.rejection() {
            Some(Rejection::Generalization {
                train_f1,
                test_f1,
                diff,
                ..
            }) => {
                assert!(test_f1 > train_f1);
                assert!((diff - 0.30).abs() < 1e-9);
            }
            other => panic!("expected Generalization, got {:?}", other),
        }
        assert!(!model_path.exists());
    }

    #[test]
    fn test_gap_equal_to_threshold_passes() {
        let dir = tempfile::tempdir().unwrap();
        // train f1 1.00, test f1 0.50
        let artifact = write_inputs(dir.path(), &confusion_array(4, 0, 0, 4), &confusion_array(1, 1, 1, 1));
        let config = trainer_config(dir.path(), 0.60, 0.50);
        let tracking = TrackingBoundary::disabled();
        let trainer = ModelTrainer::with_classifier(config, artifact, StubClassifier::on_column(0), &tracking);

        let result = trainer.initiate_model_trainer().unwrap();

        assert_eq!(result.train_metric_artifact.f1_score(), 1.0);
        assert_eq!(result.test_metric_artifact.f1_score(), 0.5);
        assert!(result.trained_model_file_path.exists());
    }

    #[test]
    fn test_passing_model_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        // train f1 0.85, test f1 0.80
        let artifact = write_inputs(dir.path(), &confusion_array(17, 3, 3, 7), &confusion_array(4, 1, 1, 4));
        let config = trainer_config(dir.path(), 0.5, 0.10);
        let tracking = TrackingBoundary::disabled();
        let trainer = ModelTrainer::with_classifier(config, artifact, StubClassifier::on_column(0), &tracking);

        let result = trainer.initiate_model_trainer().unwrap();

        assert!(result.trained_model_file_path.exists());
        assert!((result.train_metric_artifact.f1_score() - 0.85).abs() < 1e-9);
        assert!((result.test_metric_artifact.f1_score() - 0.80).abs() < 1e-9);

        let saved: SensorModel<StubClassifier> = SensorModel::load(&result.trained_model_file_path).unwrap();
        assert_eq!(saved.classifier(), &StubClassifier::on_column(0));
    }

    #[test]
    fn test_missing_array_is_data_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = DataTransformationArtifact {
            transformed_object_file_path: dir.path().join("none.json"),
            transformed_train_file_path: dir.path().join("missing_train.csv"),
            transformed_test_file_path: dir.path().join("missing_test.csv"),
        };
        let tracking = TrackingBoundary::disabled();
        let trainer = ModelTrainer::with_classifier(
            trainer_config(dir.path(), 0.6, 0.05),
            artifact,
            StubClassifier::on_column(0),
            &tracking,
        );

        let err = trainer.initiate_model_trainer().unwrap_err();

        assert!(matches!(
            err.failure(),
            Some(Failure::DataLoad(DataLoadError::Io { .. }))
        ));
    }

    #[test]
    fn test_fatal_tracking_failure_stops_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = write_inputs(dir.path(), &confusion_array(17, 3, 3, 7), &confusion_array(4, 1, 1, 4));
        let config = trainer_config(dir.path(), 0.5, 0.10);
        let model_path = config.trained_model_file_path.clone();

        let lenient = TrackingBoundary::new(Box::new(FailingTracker), false);
        let trainer = ModelTrainer::with_classifier(config.clone(), artifact.clone(), StubClassifier::on_column(0), &lenient);
        assert!(trainer.initiate_model_trainer().is_ok());
        std::fs::remove_file(&model_path).unwrap();

        let strict = TrackingBoundary::new(Box::new(FailingTracker), true);
        let trainer = ModelTrainer::with_classifier(config, artifact, StubClassifier::on_column(0), &strict);
        let err = trainer.initiate_model_trainer().unwrap_err();

        assert!(matches!(err.failure(), Some(Failure::Tracking(_))));
        assert!(!model_path.exists());
    }

    #[test]
    fn test_boosted_trees_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let make = |offset: f64| LabeledArray {
            features: FeatureMatrix::from_rows(
                (0..40)
                    .map(|i| vec![i as f64 + offset, (i % 7) as f64])
                    .collect(),
            )
            .unwrap(),
            labels: (0..40).map(|i| u8::from(i >= 20)).collect(),
        };
        let artifact = write_inputs(dir.path(), &make(0.0), &make(0.25));
        let mut config = trainer_config(dir.path(), 0.6, 0.05);
        config.boosting.n_estimators = 20;
        let tracking = TrackingBoundary::disabled();
        let trainer = ModelTrainer::new(config, artifact, &tracking);

        let result = trainer.initiate_model_trainer().unwrap();

        assert_eq!(result.train_metric_artifact.f1_score(), 1.0);
        assert_eq!(result.test_metric_artifact.f1_score(), 1.0);
        let saved: SensorModel = SensorModel::load(&result.trained_model_file_path).unwrap();
        assert_eq!(saved.classifier().n_trees(), 20);
    }

    #[test]
    fn test_train_model_rejects_non_binary_labels() {
        let tracking = TrackingBoundary::disabled();
        let trainer = ModelTrainer::with_classifier(
            trainer_config(Path::new("."), 0.6, 0.05),
            DataTransformationArtifact {
                transformed_object_file_path: "p.json".into(),
                transformed_train_file_path: "train.csv".into(),
                transformed_test_file_path: "test.csv".into(),
            },
            StubClassifier::on_column(0),
            &tracking,
        );
        let x = FeatureMatrix::from_rows(vec![vec![0.0], vec![1.0]]).unwrap();

        assert_eq!(
            trainer.train_model(&x, &[0, 2]).unwrap_err(),
            TrainingError::InvalidLabel { row: 1, label: 2 }
        );
    }
}
