//! Delimited output tables and the run manifest.
//!
//! Every table is rendered in memory first; files are only written once all of
//! them serialized, each through a temporary file and a rename.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::models::{CohortLabel, Direction, FitMetrics, Outcome, TargetKind, TestMethod};
use crate::pipeline::PipelineOutput;
use crate::report;

#[derive(Serialize)]
struct SignificanceRow<'a> {
    scheme: &'a str,
    metric: &'a str,
    cohort_a: CohortLabel,
    cohort_b: CohortLabel,
    n_a: usize,
    n_b: usize,
    status: &'static str,
    statistic: Option<f64>,
    p_value: Option<f64>,
    is_significant: Option<bool>,
    direction: Option<Direction>,
    method: Option<TestMethod>,
    reason: Option<&'a str>,
}

#[derive(Serialize)]
struct LabelRow<'a> {
    scheme: &'a str,
    teacher_id: &'a str,
    period: String,
    label: CohortLabel,
}

#[derive(Serialize)]
struct CausalRow<'a> {
    name: &'a str,
    treatment: &'a str,
    outcome: &'a str,
    status: &'static str,
    ate: Option<f64>,
    odds_ratio: Option<f64>,
    baseline_probability: Option<f64>,
    treated_probability: Option<f64>,
    absolute_probability_delta: Option<f64>,
    observations: Option<usize>,
    iterations: Option<usize>,
    log_likelihood: Option<f64>,
    null_log_likelihood: Option<f64>,
    pseudo_r2: Option<f64>,
    std_err: Option<f64>,
    z: Option<f64>,
    p_value: Option<f64>,
    conclusion: Option<String>,
    reason: Option<&'a str>,
}

#[derive(Serialize)]
struct MetricRow<'a> {
    model: &'a str,
    kind: Option<TargetKind>,
    status: &'static str,
    train_rows: Option<usize>,
    test_rows: Option<usize>,
    metric: &'static str,
    value: Option<f64>,
    reason: Option<&'a str>,
}

#[derive(Serialize)]
struct ImportanceRow<'a> {
    model: &'a str,
    rank: usize,
    feature: &'a str,
    attribution: f64,
    impurity: f64,
}

#[derive(Serialize)]
struct PredictionRow<'a> {
    model: &'a str,
    teacher_id: &'a str,
    period: String,
    actual: f64,
    predicted: f64,
}

#[derive(Serialize)]
struct Manifest<'a> {
    since: String,
    until: String,
    feature_rows: usize,
    students: usize,
    files: Vec<&'static str>,
    config: &'a PipelineConfig,
}

fn render<T: Serialize>(rows: impl IntoIterator<Item = T>) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|err| std::io::Error::other(err.to_string()).into())
}

/// Renders every CSV; an empty table still gets its header row.
fn render_with_header<T: Serialize>(rows: Vec<T>, header: &[&str]) -> Result<Vec<u8>> {
    if rows.is_empty() {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(header)?;
        writer.flush()?;
        return writer
            .into_inner()
            .map_err(|err| std::io::Error::other(err.to_string()).into());
    }
    render(rows)
}

fn significance_rows(output: &PipelineOutput) -> Vec<SignificanceRow<'_>> {
    let mut rows = Vec::new();
    for cohort in &output.cohorts {
        for result in &cohort.results {
            let (status, test, reason) = match &result.test {
                Outcome::Computed(test) => ("computed", Some(test), None),
                Outcome::NotComputable(reason) => ("not_computable", None, Some(reason.as_str())),
            };
            rows.push(SignificanceRow {
                scheme: &result.scheme,
                metric: &result.metric,
                cohort_a: result.cohort_a,
                cohort_b: result.cohort_b,
                n_a: result.n_a,
                n_b: result.n_b,
                status,
                statistic: test.map(|t| t.statistic),
                p_value: test.map(|t| t.p_value),
                is_significant: test.map(|t| t.is_significant),
                direction: test.map(|t| t.direction),
                method: test.map(|t| t.method),
                reason,
            });
        }
    }
    rows
}

fn causal_rows(output: &PipelineOutput) -> Vec<CausalRow<'_>> {
    output
        .causal
        .iter()
        .map(|report| {
            let (status, estimate, reason) = match &report.result {
                Outcome::Computed(e) => ("computed", Some(e), None),
                Outcome::NotComputable(reason) => ("failed", None, Some(reason.as_str())),
            };
            CausalRow {
                name: &report.name,
                treatment: &report.treatment,
                outcome: &report.outcome,
                status,
                ate: estimate.map(|e| e.ate),
                odds_ratio: estimate.map(|e| e.odds_ratio),
                baseline_probability: estimate.map(|e| e.baseline_probability),
                treated_probability: estimate.map(|e| e.treated_probability),
                absolute_probability_delta: estimate.map(|e| e.absolute_probability_delta),
                observations: estimate.map(|e| e.fit.observations),
                iterations: estimate.map(|e| e.fit.iterations),
                log_likelihood: estimate.map(|e| e.fit.log_likelihood),
                null_log_likelihood: estimate.map(|e| e.fit.null_log_likelihood),
                pseudo_r2: estimate.map(|e| e.fit.pseudo_r2),
                std_err: estimate.map(|e| e.fit.treatment_std_err),
                z: estimate.map(|e| e.fit.treatment_z),
                p_value: estimate.map(|e| e.fit.treatment_p_value),
                conclusion: estimate.map(report::conclusion),
                reason,
            }
        })
        .collect()
}

fn metric_rows(output: &PipelineOutput) -> Vec<MetricRow<'_>> {
    let mut rows = Vec::new();
    for report in &output.attribution {
        let result = match &report.result {
            Outcome::Computed(result) => result,
            Outcome::NotComputable(reason) => {
                rows.push(MetricRow {
                    model: &report.name,
                    kind: None,
                    status: "not_computable",
                    train_rows: None,
                    test_rows: None,
                    metric: "",
                    value: None,
                    reason: Some(reason.as_str()),
                });
                continue;
            }
        };
        let values: Vec<(&'static str, Option<f64>)> = match &result.metrics {
            FitMetrics::Regression { r2, mae, rmse } => {
                vec![("r2", Some(*r2)), ("mae", Some(*mae)), ("rmse", Some(*rmse))]
            }
            FitMetrics::Classification {
                accuracy,
                precision,
                recall,
                f1,
                roc_auc,
            } => vec![
                ("accuracy", Some(*accuracy)),
                ("precision", Some(*precision)),
                ("recall", Some(*recall)),
                ("f1", Some(*f1)),
                ("roc_auc", *roc_auc),
            ],
        };
        for (metric, value) in values {
            rows.push(MetricRow {
                model: &report.name,
                kind: Some(result.kind),
                status: "computed",
                train_rows: Some(result.train_rows),
                test_rows: Some(result.test_rows),
                metric,
                value,
                reason: None,
            });
        }
    }
    rows
}

fn computed_attribution(
    output: &PipelineOutput,
) -> impl Iterator<Item = (&str, &crate::models::AttributionResult)> {
    output.attribution.iter().filter_map(|report| match &report.result {
        Outcome::Computed(result) => Some((report.name.as_str(), result)),
        Outcome::NotComputable(_) => None,
    })
}

const FILES: [&str; 11] = [
    "features.csv",
    "cohort_labels.csv",
    "significance.csv",
    "cohort_summary.csv",
    "causal_estimates.csv",
    "attribution_metrics.csv",
    "attribution_importance.csv",
    "predictions.csv",
    "financial.csv",
    "loss_summary.csv",
    "loss_share.csv",
];

fn render_all(output: &PipelineOutput) -> Result<Vec<Vec<u8>>> {
    let labels: Vec<LabelRow> = output
        .cohorts
        .iter()
        .flat_map(|cohort| {
            cohort.labels.iter().zip(&output.table.rows).map(move |(label, row)| LabelRow {
                scheme: &cohort.scheme,
                teacher_id: &row.teacher_id,
                period: row.period.to_string(),
                label: *label,
            })
        })
        .collect();
    let summaries: Vec<_> = output.cohorts.iter().flat_map(|c| c.summaries.iter()).collect();
    let importance: Vec<ImportanceRow> = computed_attribution(output)
        .flat_map(|(model, result)| {
            result
                .feature_importance
                .iter()
                .enumerate()
                .map(move |(rank, f)| ImportanceRow {
                    model,
                    rank: rank + 1,
                    feature: &f.feature,
                    attribution: f.attribution,
                    impurity: f.impurity,
                })
        })
        .collect();
    let predictions: Vec<PredictionRow> = computed_attribution(output)
        .flat_map(|(model, result)| {
            result.predictions.iter().map(move |p| PredictionRow {
                model,
                teacher_id: &p.teacher_id,
                period: p.period.to_string(),
                actual: p.actual,
                predicted: p.predicted,
            })
        })
        .collect();

    Ok(vec![
        render_with_header(output.table.rows.iter().collect(), &["teacher_id", "period"])?,
        render_with_header(labels, &["scheme", "teacher_id", "period", "label"])?,
        render_with_header(significance_rows(output), &["scheme", "metric", "status"])?,
        render_with_header(
            summaries,
            &["scheme", "cohort", "metric", "observations", "mean", "median"],
        )?,
        render_with_header(causal_rows(output), &["name", "treatment", "outcome", "status"])?,
        render_with_header(metric_rows(output), &["model", "kind", "status", "metric", "value"])?,
        render_with_header(importance, &["model", "rank", "feature", "attribution", "impurity"])?,
        render_with_header(predictions, &["model", "teacher_id", "period", "actual", "predicted"])?,
        render_with_header(
            output.financial.iter().collect(),
            &[
                "estimate",
                "probability_delta",
                "student_count",
                "revenue_per_student",
                "retained_students",
                "revenue_delta",
            ],
        )?,
        render(std::iter::once(&output.losses))?,
        render(output.loss_shares.iter())?,
    ])
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let staging = path.with_extension("tmp");
    std::fs::write(&staging, bytes)?;
    std::fs::rename(&staging, path)?;
    Ok(())
}

/// Writes every table, the manifest and, when asked, the markdown summary.
/// Returns the paths written, in a fixed order.
pub fn write_outputs(
    dir: &Path,
    output: &PipelineOutput,
    config: &PipelineConfig,
    summary: Option<&Path>,
) -> Result<Vec<PathBuf>> {
    let tables = render_all(output)?;
    let manifest = serde_json::to_vec_pretty(&Manifest {
        since: output.window.since.to_string(),
        until: output.window.until.to_string(),
        feature_rows: output.table.len(),
        students: output.table.student_count,
        files: FILES.to_vec(),
        config,
    })
    .map_err(std::io::Error::from)?;
    let markdown = summary.map(|_| report::build_summary(output));

    std::fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(FILES.len() + 2);
    for (name, bytes) in FILES.iter().zip(&tables) {
        let path = dir.join(name);
        write_atomic(&path, bytes)?;
        written.push(path);
    }
    let path = dir.join("manifest.json");
    write_atomic(&path, &manifest)?;
    written.push(path);

    if let (Some(path), Some(markdown)) = (summary, markdown) {
        write_atomic(path, markdown.as_bytes())?;
        written.push(path.to_path_buf());
    }
    info!(dir = %dir.display(), files = written.len(), "outputs written");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline;
    use crate::synthetic::{self, SyntheticOptions};

    fn run_into(dir: &Path) -> Vec<PathBuf> {
        let config = PipelineConfig::default();
        let data = synthetic::generate(&SyntheticOptions::default()).unwrap();
        let output = pipeline::run(&data.events, &data.reference, data.window, &config).unwrap();
        let summary = dir.join("summary.md");
        write_outputs(dir, &output, &config, Some(&summary)).unwrap()
    }

    #[test]
    fn repeated_runs_write_identical_bytes() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let a = run_into(first.path());
        let b = run_into(second.path());
        assert_eq!(a.len(), FILES.len() + 2);
        for (left, right) in a.iter().zip(&b) {
            assert_eq!(left.file_name(), right.file_name());
            let left_bytes = std::fs::read(left).unwrap();
            let right_bytes = std::fs::read(right).unwrap();
            assert!(left_bytes == right_bytes, "{} differs", left.display());
        }
    }

    #[test]
    fn tables_have_stable_headers() {
        let dir = tempfile::tempdir().unwrap();
        run_into(dir.path());
        let read_header = |name: &str| {
            let mut reader = csv::Reader::from_path(dir.path().join(name)).unwrap();
            reader.headers().unwrap().iter().map(String::from).collect::<Vec<_>>()
        };
        assert_eq!(
            read_header("attribution_importance.csv"),
            vec!["model", "rank", "feature", "attribution", "impurity"]
        );
        assert_eq!(
            read_header("loss_share.csv"),
            vec![
                "party",
                "observations",
                "mean_loss",
                "std_loss",
                "groups",
                "unit_price",
                "annual_income",
                "annual_loss",
                "loss_percent"
            ]
        );
        let significance = read_header("significance.csv");
        assert_eq!(&significance[..3], &["scheme", "metric", "cohort_a"]);
        let features = read_header("features.csv");
        assert_eq!(features[0], "teacher_id");
        assert!(features.contains(&"loss_normalized".to_string()));

        let mut reader = csv::Reader::from_path(dir.path().join("significance.csv")).unwrap();
        assert_eq!(reader.records().count(), 10);
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["config"]["seed"], 42);
        assert!(dir.path().join("summary.md").exists());
    }
}
