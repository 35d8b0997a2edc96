//! Bootstrap-aggregated CART ensembles.

use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

const MIN_IMPURITY: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criterion {
    /// Variance reduction, for continuous targets.
    Mse,
    /// Gini impurity, for 0/1 targets. Leaves hold the positive-class share.
    Gini,
}

impl Criterion {
    /// Impurity of a node times its sample count.
    fn weighted_impurity(&self, count: f64, sum: f64, sum_sq: f64) -> f64 {
        if count == 0.0 {
            return 0.0;
        }
        match self {
            Self::Mse => (sum_sq - sum * sum / count).max(0.0),
            Self::Gini => 2.0 * sum * (count - sum) / count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxFeatures {
    All,
    Sqrt,
}

impl MaxFeatures {
    fn resolve(&self, n_features: usize) -> usize {
        match self {
            Self::All => n_features,
            Self::Sqrt => ((n_features as f64).sqrt().floor() as usize).max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForestParams {
    pub trees: usize,
    pub max_depth: Option<usize>,
    pub max_features: MaxFeatures,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub criterion: Criterion,
    pub seed: u64,
}

impl ForestParams {
    pub fn regression(trees: usize, seed: u64) -> Self {
        Self {
            trees,
            max_depth: None,
            max_features: MaxFeatures::All,
            min_samples_split: 2,
            min_samples_leaf: 1,
            criterion: Criterion::Mse,
            seed,
        }
    }

    pub fn classification(trees: usize, seed: u64) -> Self {
        Self {
            max_features: MaxFeatures::Sqrt,
            criterion: Criterion::Gini,
            ..Self::regression(trees, seed)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// `None` marks a leaf.
    pub feature: Option<usize>,
    pub threshold: f64,
    pub left: usize,
    pub right: usize,
    pub value: f64,
    /// Training samples (bootstrap draws included) that reached the node.
    pub cover: f64,
}

impl Node {
    fn leaf(value: f64, cover: f64) -> Self {
        Self {
            feature: None,
            threshold: 0.0,
            left: 0,
            right: 0,
            value,
            cover,
        }
    }
}

/// A fitted tree stored as a node arena; node 0 is the root.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionTree {
    pub nodes: Vec<Node>,
    importances: Vec<f64>,
}

struct Builder<'a> {
    x: ArrayView2<'a, f64>,
    y: ArrayView1<'a, f64>,
    params: &'a ForestParams,
    rng: StdRng,
    nodes: Vec<Node>,
    importances: Vec<f64>,
}

struct Split {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

impl Builder<'_> {
    fn build(&mut self, indices: &mut [usize], depth: usize) -> usize {
        let count = indices.len() as f64;
        let (sum, sum_sq) = indices.iter().fold((0.0, 0.0), |(s, q), &i| {
            let v = self.y[i];
            (s + v, q + v * v)
        });
        let value = sum / count;
        let impurity = self.params.criterion.weighted_impurity(count, sum, sum_sq);

        let id = self.nodes.len();
        self.nodes.push(Node::leaf(value, count));

        let depth_reached = self.params.max_depth.is_some_and(|max| depth >= max);
        if depth_reached
            || indices.len() < self.params.min_samples_split
            || impurity <= MIN_IMPURITY * count
        {
            return id;
        }
        let Some(split) = self.best_split(indices) else {
            return id;
        };
        let decrease = impurity - split.impurity;
        if decrease <= MIN_IMPURITY {
            return id;
        }
        self.importances[split.feature] += decrease;

        let column = self.x.column(split.feature);
        indices.sort_by(|&a, &b| column[a].total_cmp(&column[b]));
        let boundary = indices.partition_point(|&i| column[i] <= split.threshold);
        let (left_rows, right_rows) = indices.split_at_mut(boundary);
        let left = self.build(left_rows, depth + 1);
        let right = self.build(right_rows, depth + 1);

        let node = &mut self.nodes[id];
        node.feature = Some(split.feature);
        node.threshold = split.threshold;
        node.left = left;
        node.right = right;
        id
    }

    fn best_split(&mut self, indices: &[usize]) -> Option<Split> {
        let mut candidates: Vec<usize> = (0..self.x.ncols()).collect();
        candidates.shuffle(&mut self.rng);
        // constant features do not use up the budget
        let budget = self.params.max_features.resolve(self.x.ncols());
        let mut visited = 0;

        let min_leaf = self.params.min_samples_leaf.max(1);
        let n = indices.len();
        let (total, total_sq) = indices.iter().fold((0.0, 0.0), |(s, q), &i| {
            (s + self.y[i], q + self.y[i] * self.y[i])
        });

        let mut best: Option<Split> = None;
        let mut order = indices.to_vec();
        for feature in candidates {
            if visited == budget {
                break;
            }
            let column = self.x.column(feature);
            order.sort_by(|&a, &b| column[a].total_cmp(&column[b]));
            if column[order[0]] == column[order[n - 1]] {
                continue;
            }
            visited += 1;

            let (mut left_sum, mut left_sq) = (0.0, 0.0);
            for pos in 0..n - 1 {
                let v = self.y[order[pos]];
                left_sum += v;
                left_sq += v * v;

                let left_n = pos + 1;
                if left_n < min_leaf || n - left_n < min_leaf {
                    continue;
                }
                let (here, next) = (column[order[pos]], column[order[pos + 1]]);
                if here == next {
                    continue;
                }
                let impurity = self
                    .params
                    .criterion
                    .weighted_impurity(left_n as f64, left_sum, left_sq)
                    + self.params.criterion.weighted_impurity(
                        (n - left_n) as f64,
                        total - left_sum,
                        total_sq - left_sq,
                    );
                let improves = match &best {
                    Some(b) => impurity < b.impurity,
                    None => true,
                };
                if improves {
                    let mut threshold = here + (next - here) / 2.0;
                    if threshold >= next {
                        threshold = here;
                    }
                    best = Some(Split {
                        feature,
                        threshold,
                        impurity,
                    });
                }
            }
        }
        best
    }
}

impl DecisionTree {
    /// Fits one tree on the rows listed in `sample` (duplicates allowed).
    pub fn fit(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        sample: &[usize],
        params: &ForestParams,
        rng: StdRng,
    ) -> Self {
        let mut builder = Builder {
            x: x.view(),
            y: y.view(),
            params,
            rng,
            nodes: Vec::new(),
            importances: vec![0.0; x.ncols()],
        };
        let mut indices = sample.to_vec();
        if !indices.is_empty() {
            builder.build(&mut indices, 0);
        }
        Self {
            nodes: builder.nodes,
            importances: builder.importances,
        }
    }

    #[cfg(test)]
    pub fn from_nodes(nodes: Vec<Node>, n_features: usize) -> Self {
        Self {
            nodes,
            importances: vec![0.0; n_features],
        }
    }

    pub fn leaf_for(&self, row: &[f64]) -> usize {
        let mut id = 0;
        while let Some(feature) = self.nodes[id].feature {
            let node = &self.nodes[id];
            id = if row[feature] <= node.threshold {
                node.left
            } else {
                node.right
            };
        }
        id
    }

    pub fn predict_row(&self, row: &[f64]) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        self.nodes[self.leaf_for(row)].value
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], id: usize) -> usize {
            match nodes[id].feature {
                None => 0,
                Some(_) => 1 + walk(nodes, nodes[id].left).max(walk(nodes, nodes[id].right)),
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(&self.nodes, 0)
        }
    }
}

/// Anything made of decision trees whose output is the mean of its trees.
pub trait TreeEnsemble {
    fn trees(&self) -> &[DecisionTree];

    fn predict_row(&self, row: &[f64]) -> f64 {
        let trees = self.trees();
        trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / trees.len().max(1) as f64
    }

    fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.rows()
            .into_iter()
            .map(|row| self.predict_row(&row.to_vec()))
            .collect()
    }

    /// Mean model output over the training distribution.
    fn expected_value(&self) -> f64 {
        let trees = self.trees();
        trees
            .iter()
            .filter_map(|t| t.nodes.first().map(|root| root.value))
            .sum::<f64>()
            / trees.len().max(1) as f64
    }

    /// Impurity decrease per feature, normalized per tree then averaged.
    fn feature_importances(&self) -> Vec<f64> {
        let trees = self.trees();
        let n = trees.first().map_or(0, |t| t.importances.len());
        let mut totals = vec![0.0; n];
        for tree in trees {
            let sum: f64 = tree.importances.iter().sum();
            if sum > 0.0 {
                for (total, imp) in totals.iter_mut().zip(&tree.importances) {
                    *total += imp / sum;
                }
            }
        }
        let grand: f64 = totals.iter().sum();
        if grand > 0.0 {
            totals.iter_mut().for_each(|t| *t /= grand);
        }
        totals
    }
}

impl TreeEnsemble for DecisionTree {
    fn trees(&self) -> &[DecisionTree] {
        std::slice::from_ref(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
    n_features: usize,
}

impl RandomForest {
    /// Every tree draws its bootstrap and feature subsets from its own stream,
    /// seeded from `params.seed`.
    pub fn fit(x: ArrayView2<f64>, y: ArrayView1<f64>, params: &ForestParams) -> Self {
        let n = x.nrows();
        let mut seeds = StdRng::seed_from_u64(params.seed);
        let mut trees = Vec::with_capacity(params.trees);
        for _ in 0..params.trees {
            let mut rng = StdRng::seed_from_u64(seeds.random::<u64>());
            let sample: Vec<usize> = if n == 0 {
                Vec::new()
            } else {
                (0..n).map(|_| rng.random_range(0..n)).collect()
            };
            trees.push(DecisionTree::fit(x, y, &sample, params, rng));
        }
        debug!(
            trees = trees.len(),
            rows = n,
            max_depth = trees.iter().map(DecisionTree::depth).max().unwrap_or(0),
            "forest fitted"
        );
        Self {
            trees,
            n_features: x.ncols(),
        }
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }
}

impl TreeEnsemble for RandomForest {
    fn trees(&self) -> &[DecisionTree] {
        &self.trees
    }
}
