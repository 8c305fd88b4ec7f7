// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Data transformation stage
//!
//! Fits the preprocessor on the validated training table and writes the
//! numeric arrays the trainer consumes, along with the fitted transform.

use crate::artifact::{DataTransformationArtifact, DataValidationArtifact};
use crate::config::DataTransformationConfig;
use crate::datasets::{save_array, LabeledArray, SensorFrame, TargetValueMapping};
use crate::error::{DataLoadError, StageError};
use crate::preprocess::Preprocessor;

pub struct DataTransformation {
    config: DataTransformationConfig,
    validation_artifact: DataValidationArtifact,
    mapping: TargetValueMapping,
}

impl DataTransformation {
    pub fn new(config: DataTransformationConfig, validation_artifact: DataValidationArtifact) -> Self {
        Self {
            config,
            validation_artifact,
            mapping: TargetValueMapping::default(),
        }
    }

    pub fn initiate_data_transformation(&self) -> Result<DataTransformationArtifact, StageError> {
        let train = SensorFrame::load(&self.validation_artifact.valid_train_file_path, &self.mapping)?;
        let test = SensorFrame::load(&self.validation_artifact.valid_test_file_path, &self.mapping)?;

        if train.feature_names != test.feature_names {
            return Err(DataLoadError::Malformed {
                path: self.validation_artifact.valid_test_file_path.clone(),
                reason: "columns do not match the training table".to_string(),
            }
            .into());
        }

        let preprocessor = Preprocessor::fit(&train.features);
        tracing::info!(
            "Fitted preprocessor on {} rows x {} features",
            train.len(),
            preprocessor.n_features()
        );

        let transformed_train = LabeledArray {
            features: preprocessor.transform(&train.features)?,
            labels: train.target,
        };
        let transformed_test = LabeledArray {
            features: preprocessor.transform(&test.features)?,
            labels: test.target,
        };

        save_array(&self.config.transformed_train_file_path, &transformed_train)?;
        save_array(&self.config.transformed_test_file_path, &transformed_test)?;
        preprocessor.save(&self.config.transformed_object_file_path)?;

        tracing::info!(
            "Transformed arrays written to {}",
            self.config
                .transformed_train_file_path
                .parent()
                .unwrap_or(&self.config.transformed_train_file_path)
                .display()
        );

        Ok(DataTransformationArtifact {
            transformed_object_file_path: self.config.transformed_object_file_path.clone(),
            transformed_train_file_path: self.config.transformed_train_file_path.clone(),
            transformed_test_file_path: self.config.transformed_test_file_path.clone(),
        })
    }
}
