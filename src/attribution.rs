//! Tree-ensemble attribution of a target to teacher features.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::causal::IndicatorRule;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::forest::{ForestParams, RandomForest, TreeEnsemble};
use crate::models::{
    AttributionResult, FeatureImportance, FeatureTable, FitMetrics, Prediction, TargetKind,
};
use crate::shap::mean_abs_attribution;
use crate::significance::midranks;

const MIN_TRAIN_ROWS: usize = 2;

fn default_trees() -> usize {
    100
}

fn default_test_fraction() -> f64 {
    0.2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionSpec {
    /// Name the results are reported under.
    pub name: String,
    /// Feature table column the model predicts.
    pub target: String,
    pub kind: TargetKind,
    /// Binarizes the target for classification; `positive` when absent.
    #[serde(default)]
    pub target_rule: Option<IndicatorRule>,
    pub features: Vec<String>,
    #[serde(default = "default_trees")]
    pub trees: usize,
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,
    #[serde(default)]
    pub max_depth: Option<usize>,
}

impl AttributionSpec {
    pub fn validate(&self) -> Result<()> {
        if self.features.is_empty() {
            return Err(PipelineError::Config(format!(
                "attribution `{}` lists no features",
                self.name
            )));
        }
        if self.trees == 0 {
            return Err(PipelineError::Config(format!(
                "attribution `{}` needs at least one tree",
                self.name
            )));
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(PipelineError::Config(format!(
                "attribution `{}` test_fraction must be in (0, 1)",
                self.name
            )));
        }
        if self.max_depth == Some(0) {
            return Err(PipelineError::Config(format!(
                "attribution `{}` max_depth must be positive",
                self.name
            )));
        }
        Ok(())
    }

    fn forest_params(&self, seed: u64) -> ForestParams {
        let params = match self.kind {
            TargetKind::Regression => ForestParams::regression(self.trees, seed),
            TargetKind::Classification => ForestParams::classification(self.trees, seed),
        };
        ForestParams {
            max_depth: self.max_depth,
            ..params
        }
    }
}

pub fn regression_metrics(actual: &[f64], predicted: &[f64]) -> FitMetrics {
    let n = actual.len().max(1) as f64;
    let mean = actual.iter().sum::<f64>() / n;
    let residual_sq: f64 = actual.iter().zip(predicted).map(|(a, p)| (a - p).powi(2)).sum();
    let total_sq: f64 = actual.iter().map(|a| (a - mean).powi(2)).sum();
    let r2 = if total_sq > 0.0 {
        1.0 - residual_sq / total_sq
    } else if residual_sq == 0.0 {
        1.0
    } else {
        0.0
    };
    FitMetrics::Regression {
        r2,
        mae: actual.iter().zip(predicted).map(|(a, p)| (a - p).abs()).sum::<f64>() / n,
        rmse: (residual_sq / n).sqrt(),
    }
}

/// Area under the ROC curve from the rank-sum of positive scores.
pub fn roc_auc(actual: &[f64], scores: &[f64]) -> Option<f64> {
    let positives = actual.iter().filter(|a| **a > 0.5).count();
    let negatives = actual.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }
    let (ranks, _) = midranks(scores);
    let rank_sum: f64 = actual
        .iter()
        .zip(&ranks)
        .filter(|(a, _)| **a > 0.5)
        .map(|(_, r)| r)
        .sum();
    let (p, n) = (positives as f64, negatives as f64);
    Some((rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// Binary metrics; a row is predicted positive only when its probability
/// exceeds 0.5. Undefined ratios are reported as 0.
pub fn classification_metrics(actual: &[f64], probabilities: &[f64]) -> FitMetrics {
    let (mut tp, mut fp, mut tn, mut fne) = (0.0, 0.0, 0.0, 0.0);
    for (&a, &p) in actual.iter().zip(probabilities) {
        match (a > 0.5, p > 0.5) {
            (true, true) => tp += 1.0,
            (false, true) => fp += 1.0,
            (false, false) => tn += 1.0,
            (true, false) => fne += 1.0,
        }
    }
    let ratio = |num: f64, den: f64| if den > 0.0 { num / den } else { 0.0 };
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fne);
    FitMetrics::Classification {
        accuracy: ratio(tp + tn, tp + fp + tn + fne),
        precision,
        recall,
        f1: ratio(2.0 * precision * recall, precision + recall),
        roc_auc: roc_auc(actual, probabilities),
    }
}

/// Trains the ensemble on a seeded split and attributes its held-out
/// predictions to the features with TreeSHAP.
pub fn train(
    table: &FeatureTable,
    spec: &AttributionSpec,
    config: &PipelineConfig,
) -> Result<AttributionResult> {
    let raw_target = table.column(&spec.target)?;
    let target = match spec.kind {
        TargetKind::Regression => raw_target,
        TargetKind::Classification => spec
            .target_rule
            .as_ref()
            .unwrap_or(&IndicatorRule::Positive)
            .apply(&raw_target),
    };
    let features = spec
        .features
        .iter()
        .map(|name| table.column(name))
        .collect::<Result<Vec<_>>>()?;

    let complete: Vec<usize> = (0..table.len())
        .filter(|&i| target[i].is_some() && features.iter().all(|f| f[i].is_some()))
        .collect();
    let n = complete.len();
    let test_rows = (n as f64 * spec.test_fraction).ceil() as usize;
    if n < MIN_TRAIN_ROWS + 1 || n - test_rows < MIN_TRAIN_ROWS || test_rows == 0 {
        return Err(PipelineError::InsufficientRows {
            model: spec.name.clone(),
            found: n,
            required: MIN_TRAIN_ROWS + 1,
        });
    }
    debug!(model = %spec.name, dropped = table.len() - n, "incomplete rows dropped");

    let mut shuffled = complete.clone();
    shuffled.shuffle(&mut StdRng::seed_from_u64(config.seed));
    let (test_part, train_part) = shuffled.split_at(test_rows);
    let mut test_idx = test_part.to_vec();
    let mut train_idx = train_part.to_vec();
    test_idx.sort_unstable();
    train_idx.sort_unstable();

    let matrix = |rows: &[usize]| -> Array2<f64> {
        Array2::from_shape_fn((rows.len(), features.len()), |(r, c)| {
            features[c][rows[r]].unwrap_or_default()
        })
    };
    let vector = |rows: &[usize]| -> Array1<f64> {
        rows.iter().map(|&i| target[i].unwrap_or_default()).collect()
    };
    let (x_train, y_train) = (matrix(&train_idx), vector(&train_idx));
    let (x_test, y_test) = (matrix(&test_idx), vector(&test_idx));

    let params = spec.forest_params(config.seed);
    let forest = RandomForest::fit(x_train.view(), y_train.view(), &params);
    let predicted = forest.predict(x_test.view());
    let actual = y_test.to_vec();
    let predicted = predicted.to_vec();

    let metrics = match spec.kind {
        TargetKind::Regression => regression_metrics(&actual, &predicted),
        TargetKind::Classification => classification_metrics(&actual, &predicted),
    };

    let test_features: Vec<Vec<f64>> = x_test.rows().into_iter().map(|r| r.to_vec()).collect();
    let shares = mean_abs_attribution(&forest, &test_features, forest.n_features());
    let impurity = forest.feature_importances();
    let mut feature_importance: Vec<FeatureImportance> = spec
        .features
        .iter()
        .zip(shares.iter().zip(impurity.iter()))
        .map(|(feature, (&attribution, &impurity))| FeatureImportance {
            feature: feature.clone(),
            attribution,
            impurity,
        })
        .collect();
    feature_importance.sort_by(|a, b| {
        b.attribution
            .total_cmp(&a.attribution)
            .then_with(|| a.feature.cmp(&b.feature))
    });

    let predictions = test_idx
        .iter()
        .zip(actual.iter().zip(&predicted))
        .map(|(&i, (&actual, &predicted))| Prediction {
            teacher_id: table.rows[i].teacher_id.clone(),
            period: table.rows[i].period,
            actual,
            predicted,
        })
        .collect();

    if let Some(top) = feature_importance.first() {
        info!(
            model = %spec.name,
            train = train_idx.len(),
            test = test_idx.len(),
            top_feature = %top.feature,
            share = top.attribution,
            "attribution model trained"
        );
    }

    Ok(AttributionResult {
        model_target: spec.name.clone(),
        kind: spec.kind,
        train_rows: train_idx.len(),
        test_rows: test_idx.len(),
        metrics,
        feature_importance,
        predictions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::feature_row;
    use rand::Rng;

    fn kpi_table(rows: usize) -> FeatureTable {
        let mut rng = StdRng::seed_from_u64(77);
        let rows = (0..rows)
            .map(|i| {
                let mut row = feature_row(&format!("t{:03}", i / 3), 2023, 9 + (i % 3) as u32);
                row.parent_feedback = Some(rng.random_range(0.0..1.0));
                row.student_feedback = Some(rng.random_range(0.0..1.0));
                row.homework_control = Some(rng.random_range(0.0..1.0));
                row.at_risk_intervention = Some(rng.random_range(0.0..1.0));
                row.average_success = Some(rng.random_range(0.0..1.0));
                row.students_lost = if row.parent_feedback < Some(0.5) { 4 } else { 0 };
                let bonus = rng.random_range(0.0..500.0);
                row.bonus = Some(bonus);
                row.kpi_target_ratio = Some(if bonus > 250.0 { 0.8 } else { 0.2 });
                row
            })
            .collect();
        FeatureTable {
            rows,
            ..FeatureTable::default()
        }
    }

    fn regression_spec() -> AttributionSpec {
        PipelineConfig::default()
            .attribution
            .into_iter()
            .find(|s| s.kind == TargetKind::Regression)
            .unwrap()
    }

    #[test]
    fn attribution_sums_to_one_and_finds_the_driver() {
        let table = kpi_table(90);
        let config = PipelineConfig::default();
        let result = train(&table, &regression_spec(), &config).unwrap();
        let total: f64 = result.feature_importance.iter().map(|f| f.attribution).sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(result.feature_importance.iter().all(|f| f.attribution >= 0.0));
        assert_eq!(result.feature_importance[0].feature, "parent_feedback");
        assert_eq!(result.test_rows, 18);
        assert_eq!(result.train_rows, 72);
        assert_eq!(result.predictions.len(), 18);
        match result.metrics {
            FitMetrics::Regression { r2, .. } => assert!(r2 > 0.5, "r2 = {r2}"),
            other => panic!("unexpected metrics {other:?}"),
        }
    }

    #[test]
    fn same_seed_gives_identical_results() {
        let table = kpi_table(60);
        let config = PipelineConfig::default();
        let spec = regression_spec();
        assert_eq!(train(&table, &spec, &config).unwrap(), train(&table, &spec, &config).unwrap());
    }

    #[test]
    fn classifier_reports_binary_metrics() {
        let table = kpi_table(90);
        let config = PipelineConfig::default();
        let spec = AttributionSpec {
            features: vec!["bonus".into(), "parent_feedback".into()],
            trees: 30,
            ..config
                .attribution
                .iter()
                .find(|s| s.kind == TargetKind::Classification)
                .cloned()
                .unwrap()
        };
        let result = train(&table, &spec, &config).unwrap();
        assert_eq!(result.test_rows, 27);
        assert_eq!(result.feature_importance[0].feature, "bonus");
        match result.metrics {
            FitMetrics::Classification { accuracy, roc_auc, .. } => {
                assert!(accuracy > 0.8, "accuracy = {accuracy}");
                assert!(roc_auc.is_some());
            }
            other => panic!("unexpected metrics {other:?}"),
        }
        assert!(result.predictions.iter().all(|p| (0.0..=1.0).contains(&p.predicted)));
    }

    #[test]
    fn too_few_rows_is_a_local_failure() {
        let table = kpi_table(2);
        let err = train(&table, &regression_spec(), &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientRows { found: 2, .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn metric_helpers_handle_degenerate_inputs() {
        assert_eq!(roc_auc(&[1.0, 1.0], &[0.7, 0.2]), None);
        assert_eq!(roc_auc(&[0.0, 1.0, 1.0], &[0.1, 0.4, 0.9]), Some(1.0));
        match classification_metrics(&[0.0, 0.0], &[0.1, 0.2]) {
            FitMetrics::Classification { accuracy, precision, f1, .. } => {
                assert_eq!(accuracy, 1.0);
                assert_eq!(precision, 0.0);
                assert_eq!(f1, 0.0);
            }
            other => panic!("unexpected metrics {other:?}"),
        }
        // an even vote stays negative
        match classification_metrics(&[0.0, 1.0], &[0.5, 0.9]) {
            FitMetrics::Classification { accuracy, precision, recall, .. } => {
                assert_eq!((accuracy, precision, recall), (1.0, 1.0, 1.0));
            }
            other => panic!("unexpected metrics {other:?}"),
        }
        match regression_metrics(&[1.0, 3.0], &[1.0, 3.0]) {
            FitMetrics::Regression { r2, mae, rmse } => {
                assert_eq!((r2, mae, rmse), (1.0, 0.0, 0.0));
            }
            other => panic!("unexpected metrics {other:?}"),
        }
    }
}
