// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Feature preprocessing: constant imputation followed by robust scaling
//!
//! Missing readings are replaced by a fill value, then every column is
//! centred on its median and divided by its interquartile range. A column
//! with zero spread is left unscaled.

use crate::datasets::FeatureMatrix;
use crate::error::{DataLoadError, InvalidStateError, PersistenceError, SchemaError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fitted imputation + robust scaling transform
///
/// A loaded transform is checked before use: one finite center and one
/// positive scale per feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PreprocessorState")]
pub struct Preprocessor {
    fill_value: f64,
    centers: Vec<f64>,
    scales: Vec<f64>,
}

#[derive(Deserialize)]
struct PreprocessorState {
    fill_value: f64,
    centers: Vec<f64>,
    scales: Vec<f64>,
}

impl TryFrom<PreprocessorState> for Preprocessor {
    type Error = InvalidStateError;

    fn try_from(state: PreprocessorState) -> Result<Self, Self::Error> {
        let invalid = |reason: String| InvalidStateError {
            component: "preprocessor",
            reason,
        };

        if state.centers.len() != state.scales.len() {
            return Err(invalid(format!(
                "{} centers but {} scales",
                state.centers.len(),
                state.scales.len()
            )));
        }
        if !state.fill_value.is_finite() {
            return Err(invalid(format!("fill value {} is not finite", state.fill_value)));
        }
        if let Some(col) = state.centers.iter().position(|c| !c.is_finite()) {
            return Err(invalid(format!("center of feature {} is not finite", col)));
        }
        if let Some(col) = state.scales.iter().position(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(invalid(format!("scale of feature {} is not positive", col)));
        }

        Ok(Self {
            fill_value: state.fill_value,
            centers: state.centers,
            scales: state.scales,
        })
    }
}

/// Linear-interpolated quantile of an ascending slice
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

impl Preprocessor {
    pub const DEFAULT_FILL_VALUE: f64 = 0.0;

    /// Fit on a feature matrix, imputing with the default fill value
    pub fn fit(x: &FeatureMatrix) -> Self {
        let fill_value = Self::DEFAULT_FILL_VALUE;
        let mut centers = Vec::with_capacity(x.cols());
        let mut scales = Vec::with_capacity(x.cols());

        for col in 0..x.cols() {
            let mut values: Vec<f64> = x
                .column(col)
                .into_iter()
                .map(|v| if v.is_nan() { fill_value } else { v })
                .collect();
            values.sort_by(|a, b| a.total_cmp(b));

            let median = quantile(&values, 0.5);
            let iqr = quantile(&values, 0.75) - quantile(&values, 0.25);

            centers.push(if median.is_finite() { median } else { 0.0 });
            scales.push(if iqr.is_finite() && iqr > 0.0 { iqr } else { 1.0 });
        }

        tracing::debug!("Fitted preprocessor on {} rows x {} features", x.rows(), x.cols());

        Self {
            fill_value,
            centers,
            scales,
        }
    }

    /// Pass-through transform for `n` already-scaled features
    pub fn identity(n: usize) -> Self {
        Self {
            fill_value: Self::DEFAULT_FILL_VALUE,
            centers: vec![0.0; n],
            scales: vec![1.0; n],
        }
    }

    pub fn n_features(&self) -> usize {
        self.centers.len()
    }

    pub fn transform(&self, x: &FeatureMatrix) -> Result<FeatureMatrix, SchemaError> {
        if x.cols() != self.n_features() {
            return Err(SchemaError {
                expected: self.n_features(),
                actual: x.cols(),
            });
        }

        Ok(x.map_cells(|col, v| {
            let v = if v.is_nan() { self.fill_value } else { v };
            (v - self.centers[col]) / self.scales[col]
        }))
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        crate::storage::save_json(path, self)
    }

    /// Load the transform produced by the transformation stage
    pub fn load(path: &Path) -> Result<Self, DataLoadError> {
        Ok(crate::storage::load_json(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: Vec<Vec<f64>>) -> FeatureMatrix {
        FeatureMatrix::from_rows(rows).unwrap()
    }

    #[test]
    fn test_quantile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert!((quantile(&sorted, 0.5) - 2.5).abs() < 1e-12);
        assert!((quantile(&sorted, 0.25) - 1.75).abs() < 1e-12);
        assert!((quantile(&sorted, 0.75) - 3.25).abs() < 1e-12);
    }

    #[test]
    fn test_fit_centres_and_scales() {
        let x = matrix(vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0], vec![5.0]]);
        let pre = Preprocessor::fit(&x);

        let out = pre.transform(&x).unwrap();

        // median 3, iqr 4 - 2 = 2
        assert_eq!(out.column(0), vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_missing_values_are_imputed_before_scaling() {
        let x = matrix(vec![vec![f64::NAN], vec![0.0], vec![2.0], vec![4.0]]);
        let pre = Preprocessor::fit(&x);

        let out = pre.transform(&x).unwrap();

        assert!(out.iter_rows().all(|r| r[0].is_finite()));
        assert_eq!(out.get(0, 0), out.get(1, 0));
    }

    #[test]
    fn test_constant_column_is_not_scaled() {
        let x = matrix(vec![vec![7.0], vec![7.0], vec![7.0]]);
        let pre = Preprocessor::fit(&x);

        assert_eq!(pre.transform(&x).unwrap().column(0), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_transform_checks_width() {
        let pre = Preprocessor::identity(2);
        let err = pre.transform(&matrix(vec![vec![1.0]])).unwrap_err();

        assert_eq!(err, SchemaError { expected: 2, actual: 1 });
    }

    #[test]
    fn test_inconsistent_state_is_refused_on_load() {
        for json in [
            r#"{"fill_value":0.0,"centers":[0.0,0.0],"scales":[1.0]}"#,
            r#"{"fill_value":0.0,"centers":[0.0],"scales":[0.0]}"#,
            r#"{"fill_value":0.0,"centers":[0.0],"scales":[-2.0]}"#,
        ] {
            assert!(serde_json::from_str::<Preprocessor>(json).is_err(), "accepted {}", json);
        }

        let pre: Preprocessor = serde_json::from_str(r#"{"fill_value":0.0,"centers":[1.0],"scales":[2.0]}"#).unwrap();
        assert_eq!(pre.n_features(), 1);
    }

    #[test]
    fn test_corrupt_object_file_is_data_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preprocessing.json");
        std::fs::write(&path, r#"{"fill_value":0.0,"centers":[0.0,0.0],"scales":[1.0]}"#).unwrap();

        let err = Preprocessor::load(&path).unwrap_err();

        assert!(matches!(err, DataLoadError::Object(PersistenceError::Json { .. })));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transformed_object/preprocessing.json");
        let pre = Preprocessor::fit(&matrix(vec![vec![1.0, 10.0], vec![3.0, 30.0]]));

        pre.save(&path).unwrap();

        assert_eq!(Preprocessor::load(&path).unwrap(), pre);
    }

    #[test]
    fn test_load_missing_object_is_data_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Preprocessor::load(&dir.path().join("none.json")).unwrap_err();

        assert!(matches!(err, DataLoadError::Object(_)));
    }
}
