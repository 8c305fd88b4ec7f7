// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Classification metrics for the sensor fault classifier
//!
//! Labels are binary with `1` (`pos`, a failing component) as the positive
//! class:
//! - Confusion Matrix
//! - Precision, Recall, F1-Score (the score every gate compares)

use crate::error::MetricError;
use serde::{Deserialize, Serialize};

/// Label value treated as the positive class
pub const POSITIVE_LABEL: u8 = 1;

/// Confusion matrix for binary classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// True Positives (failures predicted as failures)
    pub tp: usize,
    /// True Negatives (healthy predicted as healthy)
    pub tn: usize,
    /// False Positives (healthy predicted as failures)
    pub fp: usize,
    /// False Negatives (failures predicted as healthy)
    pub fn_: usize,
}

impl ConfusionMatrix {
    /// Create from ground truth and predicted labels
    pub fn from_predictions(y_true: &[u8], y_pred: &[u8]) -> Result<Self, MetricError> {
        if y_true.len() != y_pred.len() {
            return Err(MetricError::LengthMismatch {
                y_true: y_true.len(),
                y_pred: y_pred.len(),
            });
        }
        if y_true.is_empty() {
            return Err(MetricError::Empty);
        }

        let mut matrix = Self::default();

        for (truth, pred) in y_true.iter().zip(y_pred.iter()) {
            match (*truth == POSITIVE_LABEL, *pred == POSITIVE_LABEL) {
                (true, true) => matrix.tp += 1,
                (false, false) => matrix.tn += 1,
                (false, true) => matrix.fp += 1,
                (true, false) => matrix.fn_ += 1,
            }
        }

        Ok(matrix)
    }

    /// Precision: TP / (TP + FP)
    pub fn precision(&self) -> f64 {
        let denom = self.tp + self.fp;
        if denom == 0 {
            return 0.0;
        }
        self.tp as f64 / denom as f64
    }

    /// Recall (Sensitivity): TP / (TP + FN)
    pub fn recall(&self) -> f64 {
        let denom = self.tp + self.fn_;
        if denom == 0 {
            return 0.0;
        }
        self.tp as f64 / denom as f64
    }

    /// F1 Score: 2 * (Precision * Recall) / (Precision + Recall)
    pub fn f1_score(&self) -> f64 {
        let precision = self.precision();
        let recall = self.recall();
        let denom = precision + recall;
        if denom == 0.0 {
            return 0.0;
        }
        2.0 * precision * recall / denom
    }
}

/// F1 / precision / recall triple recorded for a trained model
///
/// Values are validated on construction and on deserialization; anything
/// non-finite or outside `[0, 1]` is reported as a [`MetricError`] rather
/// than clamped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MetricValues")]
pub struct ClassificationMetric {
    f1_score: f64,
    precision_score: f64,
    recall_score: f64,
}

#[derive(Deserialize)]
struct MetricValues {
    f1_score: f64,
    precision_score: f64,
    recall_score: f64,
}

impl TryFrom<MetricValues> for ClassificationMetric {
    type Error = MetricError;

    fn try_from(values: MetricValues) -> Result<Self, Self::Error> {
        Self::new(values.f1_score, values.precision_score, values.recall_score)
    }
}

fn check_unit(name: &'static str, value: f64) -> Result<f64, MetricError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(MetricError::OutOfRange { name, value })
    }
}

impl ClassificationMetric {
    pub fn new(f1_score: f64, precision_score: f64, recall_score: f64) -> Result<Self, MetricError> {
        Ok(Self {
            f1_score: check_unit("f1_score", f1_score)?,
            precision_score: check_unit("precision_score", precision_score)?,
            recall_score: check_unit("recall_score", recall_score)?,
        })
    }

    /// Score predicted labels against ground truth
    pub fn from_predictions(y_true: &[u8], y_pred: &[u8]) -> Result<Self, MetricError> {
        let cm = ConfusionMatrix::from_predictions(y_true, y_pred)?;
        Self::from_confusion_matrix(&cm)
    }

    pub fn from_confusion_matrix(cm: &ConfusionMatrix) -> Result<Self, MetricError> {
        Self::new(cm.f1_score(), cm.precision(), cm.recall())
    }

    pub fn f1_score(&self) -> f64 {
        self.f1_score
    }

    pub fn precision_score(&self) -> f64 {
        self.precision_score
    }

    pub fn recall_score(&self) -> f64 {
        self.recall_score
    }

    /// Format as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "F1 Score:  {:.4}\nPrecision: {:.4}\nRecall:    {:.4}\n",
            self.f1_score, self.precision_score, self.recall_score
        )
    }
}
