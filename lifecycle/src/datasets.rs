// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Dataset loading for the training and evaluation stages
//!
//! Two on-disk shapes are handled:
//! - validated sensor tables: CSV with a header and the `class` target column
//! - transformed arrays: headerless numeric CSV whose last column is the label

use crate::error::{DataLoadError, PersistenceError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Name of the target column in validated sensor tables
pub const TARGET_COLUMN: &str = "class";

/// Cell values read as missing sensor readings
const MISSING_MARKERS: &[&str] = &["", "na", "nan", "null"];

/// Dense row-major matrix of sensor features; missing readings are NaN
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    /// Build from rows; returns `None` when rows have different widths
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Option<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != cols) {
            return None;
        }
        let n_rows = rows.len();
        let data = rows.into_iter().flatten().collect();
        Some(Self {
            rows: n_rows,
            cols,
            data,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        let start = idx * self.cols;
        &self.data[start..start + self.cols]
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> + '_ {
        (0..self.rows).map(move |i| self.row(i))
    }

    /// Copy one column out
    pub fn column(&self, col: usize) -> Vec<f64> {
        self.iter_rows().map(|r| r[col]).collect()
    }

    /// Apply `f(col, value)` to every cell
    pub fn map_cells(&self, f: impl Fn(usize, f64) -> f64) -> Self {
        let cols = self.cols;
        let data = self
            .data
            .iter()
            .enumerate()
            .map(|(i, v)| f(i % cols.max(1), *v))
            .collect();
        Self {
            rows: self.rows,
            cols: self.cols,
            data,
        }
    }

    /// Stack `other` below `self`; `None` when widths differ
    pub fn vstack(&self, other: &FeatureMatrix) -> Option<Self> {
        if self.is_empty() {
            return Some(other.clone());
        }
        if other.is_empty() {
            return Some(self.clone());
        }
        if self.cols != other.cols {
            return None;
        }
        let mut data = self.data.clone();
        data.extend_from_slice(&other.data);
        Some(Self {
            rows: self.rows + other.rows,
            cols: self.cols,
            data,
        })
    }
}

/// Fixed categorical mapping of the target column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetValueMapping {
    pub neg: u8,
    pub pos: u8,
}

impl Default for TargetValueMapping {
    fn default() -> Self {
        Self { neg: 0, pos: 1 }
    }
}

impl TargetValueMapping {
    /// Map a raw target value to its integer label
    pub fn map_label(&self, raw: &str) -> Option<u8> {
        match raw.trim() {
            "neg" => Some(self.neg),
            "pos" => Some(self.pos),
            _ => None,
        }
    }
}

/// Feature matrix paired with one integer label per row
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledArray {
    pub features: FeatureMatrix,
    pub labels: Vec<u8>,
}

impl LabeledArray {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

fn malformed(path: &Path, reason: impl Into<String>) -> DataLoadError {
    DataLoadError::Malformed {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn open(path: &Path) -> Result<File, DataLoadError> {
    File::open(path).map_err(|source| DataLoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_cell(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if MISSING_MARKERS.iter().any(|m| trimmed.eq_ignore_ascii_case(m)) {
        return Some(f64::NAN);
    }
    trimmed.parse::<f64>().ok()
}

/// Load a transformed array (features..., label) from headerless CSV
pub fn load_array(path: &Path) -> Result<LabeledArray, DataLoadError> {
    let file = open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(file);

    let mut rows = Vec::new();
    let mut labels = Vec::new();

    for (idx, result) in reader.records().enumerate() {
        let record = result.map_err(|source| DataLoadError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

        let mut values = Vec::with_capacity(record.len());
        for (col, field) in record.iter().enumerate() {
            let value = field.trim().parse::<f64>().map_err(|_| {
                malformed(path, format!("row {} column {}: '{}' is not numeric", idx, col, field))
            })?;
            values.push(value);
        }

        let label = values
            .pop()
            .ok_or_else(|| malformed(path, format!("row {} is empty", idx)))?;
        let label = match label {
            l if l == 0.0 => 0,
            l if l == 1.0 => 1,
            other => {
                return Err(malformed(path, format!("row {} has non-binary label {}", idx, other)));
            }
        };

        rows.push(values);
        labels.push(label);
    }

    if rows.is_empty() {
        return Err(malformed(path, "array contains no rows"));
    }

    let features = FeatureMatrix::from_rows(rows)
        .ok_or_else(|| malformed(path, "rows have differing numbers of columns"))?;

    tracing::debug!(
        "Loaded array {} ({} rows x {} features)",
        path.display(),
        features.rows(),
        features.cols()
    );

    Ok(LabeledArray { features, labels })
}

/// Write a transformed array (features..., label) as headerless CSV
pub fn save_array(path: &Path, array: &LabeledArray) -> Result<(), PersistenceError> {
    let csv_error = |source| PersistenceError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    for (row, label) in array.features.iter_rows().zip(array.labels.iter()) {
        let record: Vec<String> = row
            .iter()
            .map(|v| v.to_string())
            .chain(std::iter::once(label.to_string()))
            .collect();
        writer.write_record(&record).map_err(csv_error)?;
    }

    let bytes = writer.into_inner().map_err(|e| PersistenceError::Io {
        path: path.to_path_buf(),
        source: e.into_error(),
    })?;
    crate::storage::write_atomically(path, &bytes)
}

/// A validated sensor table split into features and mapped target
#[derive(Debug, Clone, PartialEq)]
pub struct SensorFrame {
    pub feature_names: Vec<String>,
    pub features: FeatureMatrix,
    pub target: Vec<u8>,
}

impl SensorFrame {
    /// Load a validated CSV, mapping the target column and dropping it from features
    pub fn load(path: &Path, mapping: &TargetValueMapping) -> Result<Self, DataLoadError> {
        let file = open(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(file);

        let headers = reader
            .headers()
            .map_err(|source| DataLoadError::Csv {
                path: path.to_path_buf(),
                source,
            })?
            .clone();

        let target_idx = headers
            .iter()
            .position(|h| h.trim() == TARGET_COLUMN)
            .ok_or_else(|| malformed(path, format!("missing target column '{}'", TARGET_COLUMN)))?;

        let feature_names: Vec<String> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != target_idx)
            .map(|(_, h)| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        let mut target = Vec::new();

        for (idx, result) in reader.records().enumerate() {
            let record = result.map_err(|source| DataLoadError::Csv {
                path: path.to_path_buf(),
                source,
            })?;

            let raw_target = record.get(target_idx).unwrap_or("");
            let label = mapping.map_label(raw_target).ok_or_else(|| {
                malformed(path, format!("row {}: unknown target value '{}'", idx, raw_target))
            })?;

            let mut values = Vec::with_capacity(feature_names.len());
            for (col, field) in record.iter().enumerate() {
                if col == target_idx {
                    continue;
                }
                let value = parse_cell(field).ok_or_else(|| {
                    malformed(
                        path,
                        format!("row {} column '{}': '{}' is not numeric", idx, headers.get(col).unwrap_or("?"), field),
                    )
                })?;
                values.push(value);
            }

            rows.push(values);
            target.push(label);
        }

        let features = if rows.is_empty() {
            FeatureMatrix {
                rows: 0,
                cols: feature_names.len(),
                data: Vec::new(),
            }
        } else {
            FeatureMatrix::from_rows(rows)
                .ok_or_else(|| malformed(path, "rows have differing numbers of columns"))?
        };

        tracing::debug!(
            "Loaded sensor table {} ({} rows, {} features)",
            path.display(),
            features.rows(),
            features.cols()
        );

        Ok(Self {
            feature_names,
            features,
            target,
        })
    }

    /// Load several tables and stack them in order
    pub fn load_combined(paths: &[PathBuf], mapping: &TargetValueMapping) -> Result<Self, DataLoadError> {
        let mut combined: Option<SensorFrame> = None;

        for path in paths {
            let frame = Self::load(path, mapping)?;
            combined = Some(match combined {
                None => frame,
                Some(acc) => acc.concat(frame, path)?,
            });
        }

        combined.ok_or_else(|| malformed(Path::new("<none>"), "no tables given"))
    }

    fn concat(mut self, other: SensorFrame, other_path: &Path) -> Result<Self, DataLoadError> {
        if self.feature_names != other.feature_names {
            return Err(malformed(other_path, "columns do not match the previous table"));
        }
        self.features = self
            .features
            .vstack(&other.features)
            .ok_or_else(|| malformed(other_path, "feature width does not match the previous table"))?;
        self.target.extend(other.target);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }
}
