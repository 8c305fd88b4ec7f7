// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Versioned store of accepted models
//!
//! Layout: `<model_dir>/<version>/model.json`, where `<version>` is an
//! integer timestamp. The highest version holding a model file is the
//! current best model.
//! Entries whose name is not an integer are ignored.

use crate::error::{ModelResolutionError, PersistenceError};
use std::path::{Path, PathBuf};

/// File name of a persisted model inside a version directory
pub const MODEL_FILE_NAME: &str = "model.json";

#[derive(Debug, Clone)]
pub struct ModelResolver {
    model_dir: PathBuf,
}

impl ModelResolver {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// All versions in ascending order; a missing store has none
    pub fn versions(&self) -> Result<Vec<u64>, ModelResolutionError> {
        if !self.model_dir.exists() {
            return Ok(Vec::new());
        }

        let io_error = |source| ModelResolutionError::Io {
            path: self.model_dir.clone(),
            source,
        };

        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&self.model_dir).map_err(io_error)? {
            let entry = entry.map_err(io_error)?;
            match entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
                Some(version) => versions.push(version),
                None => tracing::debug!(
                    "Ignoring non-version entry {} in model store",
                    entry.path().display()
                ),
            }
        }

        versions.sort_unstable();
        Ok(versions)
    }

    pub fn model_path(&self, version: u64) -> PathBuf {
        self.model_dir.join(version.to_string()).join(MODEL_FILE_NAME)
    }

    /// Highest version whose directory actually holds a model file
    ///
    /// Version directories without a model (for example left behind by an
    /// interrupted promotion) are skipped, so an older model still counts.
    pub fn best_version(&self) -> Result<Option<u64>, ModelResolutionError> {
        for version in self.versions()?.into_iter().rev() {
            if self.model_path(version).is_file() {
                return Ok(Some(version));
            }
            tracing::warn!(
                "Model store version {} has no {}, skipping it",
                version,
                MODEL_FILE_NAME
            );
        }
        Ok(None)
    }

    /// Path of the model in the highest populated version directory
    pub fn get_best_model_path(&self) -> Result<PathBuf, ModelResolutionError> {
        self.best_version()?
            .map(|v| self.model_path(v))
            .ok_or_else(|| ModelResolutionError::NoModels(self.model_dir.clone()))
    }

    /// True iff at least one version directory holds a model file
    ///
    /// An unreadable store is an error, not "no model", so it can never
    /// trigger the first-model auto-accept by accident.
    pub fn is_model_exists(&self) -> Result<bool, ModelResolutionError> {
        Ok(self.best_version()?.is_some())
    }

    /// Copy an accepted model into the store under `version`
    pub fn promote(&self, trained_model_path: &Path, version: u64) -> Result<PathBuf, PersistenceError> {
        let destination = self.model_path(version);
        crate::storage::copy_atomically(trained_model_path, &destination)?;
        tracing::info!("Promoted {} to {}", trained_model_path.display(), destination.display());
        Ok(destination)
    }
}
