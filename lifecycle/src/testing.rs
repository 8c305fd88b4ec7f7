// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Fixtures shared by stage tests

use crate::classifier::{validate_training_data, Classifier};
use crate::datasets::{FeatureMatrix, LabeledArray};
use crate::error::{PredictionError, SchemaError, TrackingError, TrainingError};
use crate::tracking::{ExperimentTracker, TrackedRun};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

/// Predicts 1 whenever the chosen column is above 0.5
///
/// Lets a test dictate the exact confusion matrix a model produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StubClassifier {
    pub column: usize,
}

impl StubClassifier {
    pub fn on_column(column: usize) -> Self {
        Self { column }
    }
}

impl Classifier for StubClassifier {
    fn fit(&mut self, x: &FeatureMatrix, y: &[u8]) -> Result<(), TrainingError> {
        validate_training_data(x, y)
    }

    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<u8>, PredictionError> {
        if self.column >= x.cols() {
            return Err(SchemaError {
                expected: self.column + 1,
                actual: x.cols(),
            }
            .into());
        }
        Ok(x.iter_rows().map(|row| u8::from(row[self.column] > 0.5)).collect())
    }

    fn name(&self) -> &str {
        "StubClassifier"
    }
}

/// Single-feature array whose column-0 stub predictions give these counts
pub fn confusion_array(tp: usize, fp: usize, fn_: usize, tn: usize) -> LabeledArray {
    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for (feature, label, count) in [(1.0, 1, tp), (1.0, 0, fp), (0.0, 1, fn_), (0.0, 0, tn)] {
        for _ in 0..count {
            rows.push(vec![feature]);
            labels.push(label);
        }
    }
    LabeledArray {
        features: FeatureMatrix::from_rows(rows).unwrap(),
        labels,
    }
}

/// Write a validated sensor CSV with a `class` column of `pos`/`neg`
pub fn write_sensor_csv(path: &Path, columns: &[&str], rows: &[(Vec<f64>, &str)]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut writer = csv::Writer::from_path(path).unwrap();

    let mut header: Vec<&str> = columns.to_vec();
    header.push("class");
    writer.write_record(&header).unwrap();

    for (values, class) in rows {
        let mut record: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        record.push(class.to_string());
        writer.write_record(&record).unwrap();
    }
    writer.flush().unwrap();
}

/// Keeps every record it is given
#[derive(Debug, Clone, Default)]
pub struct RecordingTracker {
    pub runs: Rc<RefCell<Vec<TrackedRun>>>,
}

impl RecordingTracker {
    pub fn labels(&self) -> Vec<Option<String>> {
        self.runs.borrow().iter().map(|r| r.label.clone()).collect()
    }
}

impl ExperimentTracker for RecordingTracker {
    fn log_run(&self, run: &TrackedRun) -> Result<(), TrackingError> {
        self.runs.borrow_mut().push(run.clone());
        Ok(())
    }

    fn backend(&self) -> &str {
        "recording"
    }
}

/// Always fails, to exercise the failure policy
#[derive(Debug, Clone, Copy)]
pub struct FailingTracker;

impl ExperimentTracker for FailingTracker {
    fn log_run(&self, _run: &TrackedRun) -> Result<(), TrackingError> {
        Err(TrackingError::Config("tracking server unavailable".to_string()))
    }

    fn backend(&self) -> &str {
        "failing"
    }
}
