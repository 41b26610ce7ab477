//! # Random Forest Classifier
//!
//! A bagged ensemble of CART trees for the binary approve/reject decision.
//!
//! - Each tree is grown on a bootstrap sample of the training rows. At every
//!   node a random subset of `floor(sqrt(n_features))` features is searched for
//!   the split with the lowest weighted Gini impurity. If none of them can split
//!   the node, the remaining features are examined as well.
//! - Tree `t` draws from its own generator seeded with `seed + t`. Trees are
//!   grown in parallel and the forest is identical for any thread count.
//! - A leaf stores the fraction of positive samples that reached it; the forest
//!   probability is the mean of those fractions over all trees.

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Probabilities strictly above this are classified as approved.
pub const DECISION_THRESHOLD: f64 = 0.5;

/// Largest seed a model artifact can hold; TOML integers are signed 64-bit.
pub const MAX_SEED: u64 = i64::MAX as u64;

#[derive(Error, Debug, PartialEq)]
pub enum ForestError {
    #[error("Cannot fit a forest on an empty training matrix.")]
    EmptyTrainingSet,
    #[error("Training matrix has {rows} rows, but {labels} labels were supplied.")]
    LabelCountMismatch { rows: usize, labels: usize },
    #[error("Labels must be 0 or 1; found {0}.")]
    InvalidLabel(u8),
    #[error("Invalid forest configuration: {0}")]
    InvalidConfig(String),
    #[error("Input has {found} features, but the forest was trained on {expected}.")]
    FeatureMismatch { found: usize, expected: usize },
    #[error("Tree {tree} is malformed at node {node}.")]
    MalformedTree { tree: usize, node: usize },
}

/// Forest hyperparameters. The defaults are the production settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
    /// Features examined per split. `None` means `floor(sqrt(n_features))`.
    #[serde(default)]
    pub max_features: Option<usize>,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 10,
            min_samples_split: 5,
            min_samples_leaf: 2,
            seed: 42,
            max_features: None,
        }
    }
}

impl ForestConfig {
    pub fn features_per_split(&self, n_features: usize) -> usize {
        self.max_features
            .unwrap_or_else(|| (n_features as f64).sqrt().floor() as usize)
            .clamp(1, n_features.max(1))
    }

    pub fn validate(&self) -> Result<(), ForestError> {
        if self.n_trees == 0 {
            return Err(ForestError::InvalidConfig("n_trees must be at least 1".into()));
        }
        if self.min_samples_split < 2 {
            return Err(ForestError::InvalidConfig(
                "min_samples_split must be at least 2".into(),
            ));
        }
        if self.min_samples_leaf == 0 {
            return Err(ForestError::InvalidConfig(
                "min_samples_leaf must be at least 1".into(),
            ));
        }
        if self.seed > MAX_SEED {
            return Err(ForestError::InvalidConfig(format!(
                "seed must be at most {MAX_SEED}"
            )));
        }
        if self.max_features == Some(0) {
            return Err(ForestError::InvalidConfig(
                "max_features must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TreeNode {
    /// Rows with `x[feature] <= threshold` go left.
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        positive_fraction: f64,
        samples: usize,
    },
}

/// Nodes are stored in pre-order; the root is node 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    pub fn positive_fraction(&self, row: ArrayView1<f64>) -> f64 {
        let mut id = 0;
        loop {
            match &self.nodes[id] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => id = if row[*feature] <= *threshold { *left } else { *right },
                TreeNode::Leaf {
                    positive_fraction, ..
                } => return *positive_fraction,
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[TreeNode], id: usize) -> usize {
            match &nodes[id] {
                TreeNode::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
                TreeNode::Leaf { .. } => 0,
            }
        }
        if self.nodes.is_empty() { 0 } else { walk(&self.nodes, 0) }
    }

    /// Children must point forward and features must be in range, which rules out
    /// cycles and out-of-bounds reads in `positive_fraction`.
    fn check(&self, tree: usize, n_features: usize) -> Result<(), ForestError> {
        if self.nodes.is_empty() {
            return Err(ForestError::MalformedTree { tree, node: 0 });
        }
        for (node, entry) in self.nodes.iter().enumerate() {
            let valid = match entry {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    *feature < n_features
                        && threshold.is_finite()
                        && *left > node
                        && *right > node
                        && *left < self.nodes.len()
                        && *right < self.nodes.len()
                }
                TreeNode::Leaf {
                    positive_fraction, ..
                } => (0.0..=1.0).contains(positive_fraction),
            };
            if !valid {
                return Err(ForestError::MalformedTree { tree, node });
            }
        }
        Ok(())
    }
}

/// A fitted forest. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    n_features: usize,
    feature_importances: Vec<f64>,
    config: ForestConfig,
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    /// Grows the forest on standardized features `x` and labels `y` (1 = approved).
    pub fn fit<'a>(
        x: ArrayView2<'a, f64>,
        y: ArrayView1<'a, u8>,
        config: &'a ForestConfig,
    ) -> Result<Self, ForestError> {
        config.validate()?;
        let (n_samples, n_features) = x.dim();
        if n_samples == 0 || n_features == 0 {
            return Err(ForestError::EmptyTrainingSet);
        }
        if y.len() != n_samples {
            return Err(ForestError::LabelCountMismatch {
                rows: n_samples,
                labels: y.len(),
            });
        }
        if let Some(&label) = y.iter().find(|&&label| label > 1) {
            return Err(ForestError::InvalidLabel(label));
        }

        let max_features = config.features_per_split(n_features);
        log::info!(
            "Growing {} trees on {} samples ({} features, {} per split)",
            config.n_trees,
            n_samples,
            n_features,
            max_features
        );

        let grown: Vec<(DecisionTree, Vec<f64>)> = (0..config.n_trees)
            .into_par_iter()
            .map(|index| {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(index as u64));
                let mut bootstrap: Vec<usize> =
                    (0..n_samples).map(|_| rng.gen_range(0..n_samples)).collect();
                let mut builder = TreeBuilder {
                    x,
                    y,
                    config,
                    max_features,
                    nodes: Vec::new(),
                    importances: vec![0.0; n_features],
                };
                builder.build(&mut bootstrap, 0, &mut rng);
                (
                    DecisionTree {
                        nodes: builder.nodes,
                    },
                    builder.importances,
                )
            })
            .collect();

        let mut feature_importances = vec![0.0; n_features];
        let mut trees = Vec::with_capacity(grown.len());
        for (tree, importances) in grown {
            let total: f64 = importances.iter().sum();
            if total > 0.0 {
                for (acc, value) in feature_importances.iter_mut().zip(&importances) {
                    *acc += value / total;
                }
            }
            trees.push(tree);
        }
        let total: f64 = feature_importances.iter().sum();
        if total > 0.0 {
            feature_importances.iter_mut().for_each(|value| *value /= total);
        }

        log::debug!(
            "Forest grown; deepest tree has depth {}",
            trees.iter().map(DecisionTree::depth).max().unwrap_or(0)
        );

        Ok(Self {
            n_features,
            feature_importances,
            config: config.clone(),
            trees,
        })
    }

    /// Probability of the positive class for every row of `x`.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ForestError> {
        if x.ncols() != self.n_features {
            return Err(ForestError::FeatureMismatch {
                found: x.ncols(),
                expected: self.n_features,
            });
        }
        Ok(x.axis_iter(Axis(0))
            .map(|row| {
                let sum: f64 = self.trees.iter().map(|tree| tree.positive_fraction(row)).sum();
                sum / self.trees.len() as f64
            })
            .collect())
    }

    /// Class label for every row of `x`.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<u8>, ForestError> {
        Ok(self.predict_proba(x)?.mapv(Self::classify))
    }

    /// The class chosen for a positive-class probability.
    pub fn classify(probability: f64) -> u8 {
        u8::from(probability > DECISION_THRESHOLD)
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn trees(&self) -> &[DecisionTree] {
        &self.trees
    }

    /// Normalized mean decrease in impurity, one entry per feature.
    pub fn feature_importances(&self) -> &[f64] {
        &self.feature_importances
    }

    /// Structural check for forests that did not come out of `fit`.
    pub fn validate(&self) -> Result<(), ForestError> {
        self.config.validate()?;
        if self.trees.is_empty() {
            return Err(ForestError::InvalidConfig("forest has no trees".into()));
        }
        if self.feature_importances.len() != self.n_features {
            return Err(ForestError::FeatureMismatch {
                found: self.feature_importances.len(),
                expected: self.n_features,
            });
        }
        for (index, tree) in self.trees.iter().enumerate() {
            tree.check(index, self.n_features)?;
        }
        Ok(())
    }
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    child_impurity: f64,
}

struct TreeBuilder<'a> {
    x: ArrayView2<'a, f64>,
    y: ArrayView1<'a, u8>,
    config: &'a ForestConfig,
    max_features: usize,
    nodes: Vec<TreeNode>,
    importances: Vec<f64>,
}

impl TreeBuilder<'_> {
    /// Grows the subtree over `indices` and returns the id of its root.
    fn build(&mut self, indices: &mut [usize], depth: usize, rng: &mut StdRng) -> usize {
        let n = indices.len();
        let positives = indices.iter().filter(|&&i| self.y[i] == 1).count();
        let id = self.nodes.len();
        self.nodes.push(TreeNode::Leaf {
            positive_fraction: positives as f64 / n as f64,
            samples: n,
        });

        let stop = depth >= self.config.max_depth
            || n < self.config.min_samples_split
            || n < 2 * self.config.min_samples_leaf
            || positives == 0
            || positives == n;
        if stop {
            return id;
        }

        let Some(split) = self.best_split(indices, positives, rng) else {
            return id;
        };

        let parent_impurity = gini(positives, n);
        self.importances[split.feature] += n as f64 * (parent_impurity - split.child_impurity);

        let boundary = partition(indices, |i| self.x[[i, split.feature]] <= split.threshold);
        let (left_indices, right_indices) = indices.split_at_mut(boundary);
        let left = self.build(left_indices, depth + 1, rng);
        let right = self.build(right_indices, depth + 1, rng);
        self.nodes[id] = TreeNode::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        id
    }

    fn best_split(
        &self,
        indices: &[usize],
        positives: usize,
        rng: &mut StdRng,
    ) -> Option<SplitCandidate> {
        let n = indices.len();
        let min_leaf = self.config.min_samples_leaf;
        let mut features: Vec<usize> = (0..self.x.ncols()).collect();
        features.shuffle(rng);

        let mut best: Option<SplitCandidate> = None;
        let mut examined = 0;
        let mut sorted: Vec<(f64, u8)> = Vec::with_capacity(n);

        for feature in features {
            if examined >= self.max_features && best.is_some() {
                break;
            }

            sorted.clear();
            sorted.extend(indices.iter().map(|&i| (self.x[[i, feature]], self.y[i])));
            sorted.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));
            if sorted[0].0 >= sorted[n - 1].0 {
                continue;
            }
            examined += 1;

            let mut left_positives = 0;
            for split_at in 1..n {
                left_positives += usize::from(sorted[split_at - 1].1);
                let (lower, upper) = (sorted[split_at - 1].0, sorted[split_at].0);
                if lower >= upper {
                    continue;
                }
                let right_n = n - split_at;
                if split_at < min_leaf || right_n < min_leaf {
                    continue;
                }

                let weighted = (split_at as f64 * gini(left_positives, split_at)
                    + right_n as f64 * gini(positives - left_positives, right_n))
                    / n as f64;
                if best
                    .as_ref()
                    .is_none_or(|candidate| weighted < candidate.child_impurity)
                {
                    let mut threshold = lower + (upper - lower) / 2.0;
                    if threshold >= upper {
                        threshold = lower;
                    }
                    best = Some(SplitCandidate {
                        feature,
                        threshold,
                        child_impurity: weighted,
                    });
                }
            }
        }

        best
    }
}

fn gini(positives: usize, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = positives as f64 / n as f64;
    2.0 * p * (1.0 - p)
}

/// Moves every index satisfying `goes_left` to the front; returns how many did.
fn partition(indices: &mut [usize], goes_left: impl Fn(usize) -> bool) -> usize {
    let mut boundary = 0;
    for k in 0..indices.len() {
        if goes_left(indices[k]) {
            indices.swap(boundary, k);
            boundary += 1;
        }
    }
    boundary
}
