// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Composed predictor: fitted preprocessor + fitted classifier as one unit

use crate::classifier::{Classifier, GradientBoostedTrees};
use crate::datasets::FeatureMatrix;
use crate::error::{PersistenceError, PredictionError};
use crate::preprocess::Preprocessor;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The persisted sensor fault model
///
/// Built once per successful training run and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "C: Classifier")]
pub struct SensorModel<C = GradientBoostedTrees> {
    preprocessor: Preprocessor,
    model: C,
}

impl<C: Classifier> SensorModel<C> {
    pub fn new(preprocessor: Preprocessor, model: C) -> Self {
        Self { preprocessor, model }
    }

    /// Transform raw sensor readings, then classify them
    pub fn predict(&self, raw: &FeatureMatrix) -> Result<Vec<u8>, PredictionError> {
        let transformed = self.preprocessor.transform(raw)?;
        self.model.predict(&transformed)
    }

    pub fn classifier(&self) -> &C {
        &self.model
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        crate::storage::save_json(path, self)?;
        tracing::info!("Sensor model ({}) saved to {}", self.model.name(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, PersistenceError> {
        crate::storage::load_json(path)
    }
}
