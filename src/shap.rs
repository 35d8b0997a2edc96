//! Exact path-dependent TreeSHAP.
//!
//! Contributions are computed per tree from the training covers stored in
//! each node and averaged over the ensemble, so for every row
//! `expected_value + Σ φ = prediction`.

use crate::forest::{DecisionTree, TreeEnsemble};

#[derive(Debug, Clone, Copy)]
struct PathElement {
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    pweight: f64,
}

fn extend_path(
    path: &mut Vec<PathElement>,
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        pweight: if depth == 0 { 1.0 } else { 0.0 },
    });
    let scale = (depth + 1) as f64;
    for i in (0..depth).rev() {
        path[i + 1].pweight += one_fraction * path[i].pweight * (i + 1) as f64 / scale;
        path[i].pweight = zero_fraction * path[i].pweight * (depth - i) as f64 / scale;
    }
}

fn unwind_path(path: &mut Vec<PathElement>, index: usize) {
    let depth = path.len() - 1;
    let PathElement {
        zero_fraction,
        one_fraction,
        ..
    } = path[index];
    let scale = (depth + 1) as f64;
    let mut next_one_portion = path[depth].pweight;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let previous = path[i].pweight;
            path[i].pweight = next_one_portion * scale / ((i + 1) as f64 * one_fraction);
            next_one_portion =
                previous - path[i].pweight * zero_fraction * (depth - i) as f64 / scale;
        } else {
            path[i].pweight = path[i].pweight * scale / (zero_fraction * (depth - i) as f64);
        }
    }
    for i in index..depth {
        path[i].feature = path[i + 1].feature;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
    path.pop();
}

/// Total permutation weight of the path with element `index` removed.
fn unwound_path_sum(path: &[PathElement], index: usize) -> f64 {
    let depth = path.len() - 1;
    let PathElement {
        zero_fraction,
        one_fraction,
        ..
    } = path[index];
    let scale = (depth + 1) as f64;
    let mut next_one_portion = path[depth].pweight;
    let mut total = 0.0;

    for i in (0..depth).rev() {
        if one_fraction != 0.0 {
            let share = next_one_portion * scale / ((i + 1) as f64 * one_fraction);
            total += share;
            next_one_portion = path[i].pweight - share * zero_fraction * (depth - i) as f64 / scale;
        } else {
            total += path[i].pweight / zero_fraction / ((depth - i) as f64 / scale);
        }
    }
    total
}

struct Walk<'a> {
    tree: &'a DecisionTree,
    row: &'a [f64],
    phi: &'a mut [f64],
}

impl Walk<'_> {
    fn recurse(
        &mut self,
        node_id: usize,
        mut path: Vec<PathElement>,
        zero_fraction: f64,
        one_fraction: f64,
        feature: Option<usize>,
    ) {
        extend_path(&mut path, zero_fraction, one_fraction, feature);
        let tree = self.tree;
        let node = &tree.nodes[node_id];

        let Some(split) = node.feature else {
            for i in 1..path.len() {
                let weight = unwound_path_sum(&path, i);
                let element = path[i];
                if let Some(f) = element.feature {
                    let spread = element.one_fraction - element.zero_fraction;
                    self.phi[f] += weight * spread * node.value;
                }
            }
            return;
        };

        let (hot, cold) = if self.row[split] <= node.threshold {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        let hot_zero = tree.nodes[hot].cover / node.cover;
        let cold_zero = tree.nodes[cold].cover / node.cover;

        let mut incoming_zero = 1.0;
        let mut incoming_one = 1.0;
        // a feature seen higher up is unwound and re-entered here
        if let Some(index) = path.iter().position(|e| e.feature == Some(split)) {
            incoming_zero = path[index].zero_fraction;
            incoming_one = path[index].one_fraction;
            unwind_path(&mut path, index);
        }

        self.recurse(hot, path.clone(), hot_zero * incoming_zero, incoming_one, Some(split));
        self.recurse(cold, path, cold_zero * incoming_zero, 0.0, Some(split));
    }
}

/// SHAP values of one tree for `row`, added into `phi`.
pub fn tree_contributions(tree: &DecisionTree, row: &[f64], phi: &mut [f64]) {
    if tree.nodes.is_empty() {
        return;
    }
    let max_depth = tree.depth() + 2;
    let mut walk = Walk { tree, row, phi };
    walk.recurse(0, Vec::with_capacity(max_depth), 1.0, 1.0, None);
}

/// Per-feature SHAP values of the ensemble's prediction for `row`.
pub fn contributions<E: TreeEnsemble + ?Sized>(
    model: &E,
    row: &[f64],
    n_features: usize,
) -> Vec<f64> {
    let trees = model.trees();
    let mut phi = vec![0.0; n_features];
    for tree in trees {
        tree_contributions(tree, row, &mut phi);
    }
    let count = trees.len().max(1) as f64;
    phi.iter_mut().for_each(|v| *v /= count);
    phi
}

/// Mean absolute SHAP value per feature over `rows`, normalized to sum to one.
/// Falls back to equal shares when every contribution is zero.
pub fn mean_abs_attribution<E: TreeEnsemble + ?Sized>(
    model: &E,
    rows: &[Vec<f64>],
    n_features: usize,
) -> Vec<f64> {
    let mut totals = vec![0.0; n_features];
    for row in rows {
        for (total, phi) in totals.iter_mut().zip(contributions(model, row, n_features)) {
            *total += phi.abs();
        }
    }
    let sum: f64 = totals.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        totals.iter_mut().for_each(|t| *t /= sum);
    } else if n_features > 0 {
        totals.fill(1.0 / n_features as f64);
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::{ForestParams, Node, RandomForest};
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn split(
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        value: f64,
        cover: f64,
    ) -> Node {
        Node {
            feature: Some(feature),
            threshold,
            left,
            right,
            value,
            cover,
        }
    }

    fn leaf(value: f64, cover: f64) -> Node {
        Node {
            feature: None,
            threshold: 0.0,
            left: 0,
            right: 0,
            value,
            cover,
        }
    }

    #[test]
    fn stump_attributes_the_whole_gap_to_its_feature() {
        let tree = DecisionTree::from_nodes(
            vec![split(0, 0.5, 1, 2, 0.5, 2.0), leaf(0.0, 1.0), leaf(1.0, 1.0)],
            2,
        );
        let phi = contributions(&tree, &[1.0, 7.0], 2);
        assert!((phi[0] - 0.5).abs() < 1e-12);
        assert_eq!(phi[1], 0.0);
    }

    #[test]
    fn and_interaction_is_split_evenly() {
        // f0 > 0.5 and f1 > 0.5 -> 1, covers uniform over the four corners
        let tree = DecisionTree::from_nodes(
            vec![
                split(0, 0.5, 1, 2, 0.25, 4.0),
                leaf(0.0, 2.0),
                split(1, 0.5, 3, 4, 0.5, 2.0),
                leaf(0.0, 1.0),
                leaf(1.0, 1.0),
            ],
            2,
        );
        let phi = contributions(&tree, &[1.0, 1.0], 2);
        assert!((phi[0] - 0.375).abs() < 1e-12);
        assert!((phi[1] - 0.375).abs() < 1e-12);
    }

    #[test]
    fn repeated_feature_on_a_path_is_counted_once() {
        let tree = DecisionTree::from_nodes(
            vec![
                split(0, 0.5, 1, 2, 1.0, 4.0),
                leaf(0.0, 2.0),
                split(0, 1.5, 3, 4, 2.0, 2.0),
                leaf(1.0, 1.0),
                leaf(3.0, 1.0),
            ],
            1,
        );
        let phi = contributions(&tree, &[2.0], 1);
        assert!((phi[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn contributions_add_up_to_the_prediction() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut x = Array2::<f64>::zeros((120, 4));
        let mut y = Array1::<f64>::zeros(120);
        for i in 0..120 {
            for j in 0..4 {
                x[[i, j]] = rng.random_range(0.0..1.0);
            }
            let gate = if x[[i, 1]] > 0.5 { 2.0 } else { 0.0 };
            y[i] = 3.0 * x[[i, 0]] + gate * x[[i, 2]];
        }
        let forest = RandomForest::fit(x.view(), y.view(), &ForestParams::regression(8, 5));
        let base = forest.expected_value();
        for i in 0..10 {
            let row = x.row(i).to_vec();
            let phi = contributions(&forest, &row, 4);
            let total = base + phi.iter().sum::<f64>();
            assert!((total - forest.predict_row(&row)).abs() < 1e-9);
        }
    }

    #[test]
    fn flat_model_gets_uniform_attribution() {
        let tree = DecisionTree::from_nodes(vec![leaf(2.0, 10.0)], 3);
        let shares = mean_abs_attribution(&tree, &[vec![0.0, 1.0, 2.0]], 3);
        assert_eq!(shares, vec![1.0 / 3.0; 3]);
    }
}
