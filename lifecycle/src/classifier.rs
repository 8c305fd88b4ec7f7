// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Classifiers for sensor fault detection
//!
//! Implements:
//! - The [`Classifier`] trait every trainable model satisfies
//! - [`GradientBoostedTrees`]: binary logistic-loss boosting over
//!   depth-limited regression trees with histogram split search
//!
//! Training is deterministic: the same data, parameters and seed always
//! produce the same trees.

use crate::datasets::FeatureMatrix;
use crate::error::{InvalidStateError, PredictionError, SchemaError, TrainingError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Trait for all trainable classifiers
///
/// Models are persisted inside a [`crate::model::SensorModel`], hence the
/// serde bounds.
pub trait Classifier: Serialize + DeserializeOwned {
    /// Fit on features and binary labels (0 or 1)
    fn fit(&mut self, x: &FeatureMatrix, y: &[u8]) -> Result<(), TrainingError>;

    /// Predict one label per row
    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<u8>, PredictionError>;

    /// Get model name
    fn name(&self) -> &str;
}

/// Checks shared by every classifier before fitting
pub fn validate_training_data(x: &FeatureMatrix, y: &[u8]) -> Result<(), TrainingError> {
    if x.is_empty() || y.is_empty() {
        return Err(TrainingError::EmptyData);
    }
    if x.rows() != y.len() {
        return Err(TrainingError::LengthMismatch {
            rows: x.rows(),
            labels: y.len(),
        });
    }
    if let Some((row, &label)) = y.iter().enumerate().find(|(_, l)| **l > 1) {
        return Err(TrainingError::InvalidLabel { row, label });
    }
    for (row, values) in x.iter_rows().enumerate() {
        if let Some(col) = values.iter().position(|v| !v.is_finite()) {
            return Err(TrainingError::NonFiniteFeature { row, col });
        }
    }
    Ok(())
}

/// Boosting hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostingParams {
    /// Number of boosting rounds
    pub n_estimators: usize,
    /// Maximum tree depth
    pub max_depth: usize,
    /// Shrinkage applied to every leaf weight
    pub learning_rate: f64,
    /// Minimum hessian sum in a child
    pub min_child_weight: f64,
    /// L2 regularisation on leaf weights
    pub reg_lambda: f64,
    /// Minimum gain required to split
    pub gamma: f64,
    /// Fraction of rows sampled per round
    pub subsample: f64,
    /// Maximum histogram bins per feature
    pub max_bins: usize,
    /// Seed for row subsampling
    pub seed: u64,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 6,
            learning_rate: 0.3,
            min_child_weight: 1.0,
            reg_lambda: 1.0,
            gamma: 0.0,
            subsample: 1.0,
            max_bins: 256,
            seed: 0,
        }
    }
}

impl BoostingParams {
    pub fn validate(&self) -> Result<(), TrainingError> {
        let invalid = |msg: String| Err(TrainingError::InvalidParameter(msg));

        if self.n_estimators == 0 {
            return invalid("n_estimators must be at least 1".to_string());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !(self.subsample > 0.0 && self.subsample <= 1.0) {
            return invalid(format!("subsample must be in (0, 1], got {}", self.subsample));
        }
        if !(2..=u16::MAX as usize).contains(&self.max_bins) {
            return invalid(format!("max_bins must be in [2, {}], got {}", u16::MAX, self.max_bins));
        }
        if self.reg_lambda < 0.0 || self.min_child_weight < 0.0 || self.gamma < 0.0 {
            return invalid("reg_lambda, min_child_weight and gamma must be non-negative".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        weight: f64,
    },
}

/// Regression tree stored as a flat node list; node 0 is the root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    fn predict_row(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { weight } => return *weight,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] < *threshold { *left } else { *right };
                }
            }
        }
    }

    /// Every split must point forward to an existing node and read an
    /// existing feature, so prediction always terminates in bounds
    fn check(&self, n_features: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".to_string());
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Leaf { weight } if !weight.is_finite() => {
                    return Err(format!("leaf {} has a non-finite weight", idx));
                }
                Node::Leaf { .. } => {}
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if *feature >= n_features {
                        return Err(format!(
                            "node {} splits on feature {} of {}",
                            idx, feature, n_features
                        ));
                    }
                    if threshold.is_nan() {
                        return Err(format!("node {} has a NaN threshold", idx));
                    }
                    for child in [*left, *right] {
                        if child <= idx || child >= self.nodes.len() {
                            return Err(format!("node {} points at invalid child {}", idx, child));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Quantised copy of the training features
///
/// A value falls into bin `k` when exactly `k` thresholds are `<=` it, so
/// "bin <= j" is the same test as "value < thresholds[j]".
struct FeatureBins {
    thresholds: Vec<Vec<f64>>,
    binned: Vec<Vec<u16>>,
}

impl FeatureBins {
    fn build(x: &FeatureMatrix, max_bins: usize) -> Self {
        let mut thresholds = Vec::with_capacity(x.cols());
        let mut binned = Vec::with_capacity(x.cols());

        for col in 0..x.cols() {
            let values = x.column(col);
            let cuts = Self::candidate_thresholds(&values, max_bins);
            let bins = values
                .iter()
                .map(|v| cuts.partition_point(|t| *t <= *v) as u16)
                .collect();
            thresholds.push(cuts);
            binned.push(bins);
        }

        Self { thresholds, binned }
    }

    fn candidate_thresholds(values: &[f64], max_bins: usize) -> Vec<f64> {
        let mut uniq = values.to_vec();
        uniq.sort_by(|a, b| a.total_cmp(b));
        uniq.dedup();

        if uniq.len() < 2 {
            return Vec::new();
        }

        let mut picks: Vec<f64> = if uniq.len() <= max_bins {
            uniq
        } else {
            let last = uniq.len() - 1;
            (0..max_bins).map(|i| uniq[i * last / (max_bins - 1)]).collect()
        };
        picks.dedup();

        picks.windows(2).map(|w| w[0] + (w[1] - w[0]) / 2.0).collect()
    }
}

struct SplitCandidate {
    feature: usize,
    bin: usize,
}

struct TreeBuilder<'a> {
    bins: &'a FeatureBins,
    grad: &'a [f64],
    hess: &'a [f64],
    params: &'a BoostingParams,
    nodes: Vec<Node>,
}

impl<'a> TreeBuilder<'a> {
    fn score(&self, g: f64, h: f64) -> f64 {
        g * g / (h + self.params.reg_lambda)
    }

    fn leaf_weight(&self, g: f64, h: f64) -> f64 {
        let denom = h + self.params.reg_lambda;
        if denom <= 0.0 {
            return 0.0;
        }
        -g / denom * self.params.learning_rate
    }

    fn best_split(&self, rows: &[usize], g: f64, h: f64) -> Option<SplitCandidate> {
        let parent = self.score(g, h);
        let mut best_gain = 1e-12;
        let mut best = None;

        for (feature, cuts) in self.bins.thresholds.iter().enumerate() {
            if cuts.is_empty() {
                continue;
            }

            // (grad, hess, count) per bin
            let mut hist = vec![(0.0f64, 0.0f64, 0usize); cuts.len() + 1];
            for &r in rows {
                let b = self.bins.binned[feature][r] as usize;
                hist[b].0 += self.grad[r];
                hist[b].1 += self.hess[r];
                hist[b].2 += 1;
            }

            let (mut gl, mut hl, mut nl) = (0.0, 0.0, 0usize);
            for (j, (bg, bh, bn)) in hist.iter().take(cuts.len()).enumerate() {
                gl += bg;
                hl += bh;
                nl += bn;
                let (gr, hr, nr) = (g - gl, h - hl, rows.len() - nl);

                if nl == 0 || nr == 0 {
                    continue;
                }
                if hl < self.params.min_child_weight || hr < self.params.min_child_weight {
                    continue;
                }

                let gain = 0.5 * (self.score(gl, hl) + self.score(gr, hr) - parent) - self.params.gamma;
                if gain > best_gain {
                    best_gain = gain;
                    best = Some(SplitCandidate { feature, bin: j });
                }
            }
        }

        best
    }

    fn build(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let g: f64 = rows.iter().map(|&r| self.grad[r]).sum();
        let h: f64 = rows.iter().map(|&r| self.hess[r]).sum();

        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf {
            weight: self.leaf_weight(g, h),
        });

        if depth >= self.params.max_depth || rows.len() < 2 {
            return idx;
        }

        if let Some(split) = self.best_split(&rows, g, h) {
            let binned = &self.bins.binned[split.feature];
            let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
                rows.into_iter().partition(|&r| binned[r] as usize <= split.bin);

            let threshold = self.bins.thresholds[split.feature][split.bin];
            let left = self.build(left_rows, depth + 1);
            let right = self.build(right_rows, depth + 1);

            self.nodes[idx] = Node::Split {
                feature: split.feature,
                threshold,
                left,
                right,
            };
        }

        idx
    }

    fn into_tree(self) -> RegressionTree {
        RegressionTree { nodes: self.nodes }
    }
}

fn sigmoid(margin: f64) -> f64 {
    1.0 / (1.0 + (-margin).exp())
}

/// Gradient-boosted decision trees with binary logistic loss
///
/// Loaded models are checked for consistency before use; a damaged tree
/// fails deserialization instead of panicking at prediction time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BoostedTreesState")]
pub struct GradientBoostedTrees {
    params: BoostingParams,
    base_margin: f64,
    trees: Vec<RegressionTree>,
    n_features: Option<usize>,
}

#[derive(Deserialize)]
struct BoostedTreesState {
    #[serde(default)]
    params: BoostingParams,
    base_margin: f64,
    trees: Vec<RegressionTree>,
    n_features: Option<usize>,
}

impl TryFrom<BoostedTreesState> for GradientBoostedTrees {
    type Error = InvalidStateError;

    fn try_from(state: BoostedTreesState) -> Result<Self, Self::Error> {
        let invalid = |reason: String| InvalidStateError {
            component: "gradient boosted trees",
            reason,
        };

        if !state.base_margin.is_finite() {
            return Err(invalid(format!("base margin {} is not finite", state.base_margin)));
        }
        match state.n_features {
            None if !state.trees.is_empty() => {
                return Err(invalid("trees present but feature count missing".to_string()));
            }
            None => {}
            Some(n_features) => {
                for (i, tree) in state.trees.iter().enumerate() {
                    tree.check(n_features).map_err(|reason| invalid(format!("tree {}: {}", i, reason)))?;
                }
            }
        }

        Ok(Self {
            params: state.params,
            base_margin: state.base_margin,
            trees: state.trees,
            n_features: state.n_features,
        })
    }
}

impl GradientBoostedTrees {
    pub fn new(params: BoostingParams) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// P(label = 1) for every row
    pub fn predict_proba(&self, x: &FeatureMatrix) -> Result<Vec<f64>, PredictionError> {
        let expected = self
            .n_features
            .ok_or_else(|| PredictionError::NotFitted(self.name().to_string()))?;
        if x.cols() != expected {
            return Err(SchemaError {
                expected,
                actual: x.cols(),
            }
            .into());
        }

        Ok(x.iter_rows()
            .map(|row| {
                let margin = self.base_margin + self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>();
                sigmoid(margin)
            })
            .collect())
    }
}

impl Classifier for GradientBoostedTrees {
    fn fit(&mut self, x: &FeatureMatrix, y: &[u8]) -> Result<(), TrainingError> {
        self.params.validate()?;
        validate_training_data(x, y)?;

        let n = y.len();
        let bins = FeatureBins::build(x, self.params.max_bins);
        let targets: Vec<f64> = y.iter().map(|&l| f64::from(l)).collect();

        let pos_rate = (targets.iter().sum::<f64>() / n as f64).clamp(1e-6, 1.0 - 1e-6);
        let base_margin = (pos_rate / (1.0 - pos_rate)).ln();

        let mut margins = vec![base_margin; n];
        let mut grad = vec![0.0; n];
        let mut hess = vec![0.0; n];
        let mut rng = ChaCha8Rng::seed_from_u64(self.params.seed);
        let mut trees = Vec::with_capacity(self.params.n_estimators);

        for _ in 0..self.params.n_estimators {
            for i in 0..n {
                let p = sigmoid(margins[i]);
                grad[i] = p - targets[i];
                hess[i] = (p * (1.0 - p)).max(1e-16);
            }

            let rows: Vec<usize> = if self.params.subsample < 1.0 {
                (0..n).filter(|_| rng.gen_bool(self.params.subsample)).collect()
            } else {
                (0..n).collect()
            };
            if rows.is_empty() {
                continue;
            }

            let mut builder = TreeBuilder {
                bins: &bins,
                grad: &grad,
                hess: &hess,
                params: &self.params,
                nodes: Vec::new(),
            };
            builder.build(rows, 0);
            let tree = builder.into_tree();

            for (i, margin) in margins.iter_mut().enumerate() {
                *margin += tree.predict_row(x.row(i));
            }
            trees.push(tree);
        }

        tracing::debug!(
            "Fitted {} trees (max depth reached {}) on {} rows x {} features",
            trees.len(),
            trees.iter().map(RegressionTree::depth).max().unwrap_or(0),
            n,
            x.cols()
        );

        self.base_margin = base_margin;
        self.trees = trees;
        self.n_features = Some(x.cols());
        Ok(())
    }

    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<u8>, PredictionError> {
        Ok(self
            .predict_proba(x)?
            .into_iter()
            .map(|p| u8::from(p > 0.5))
            .collect())
    }

    fn name(&self) -> &str {
        "GradientBoostedTrees"
    }
}
