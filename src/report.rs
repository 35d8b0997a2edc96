use std::fmt::Write;

use crate::models::{CausalEstimate, FitMetrics, Outcome};
use crate::pipeline::PipelineOutput;

/// One-sentence reading of a causal estimate.
pub fn conclusion(estimate: &CausalEstimate) -> String {
    let verb = if estimate.odds_ratio >= 1.0 { "raises" } else { "lowers" };
    format!(
        "{} {} the odds of {} by {:.2} times (absolute change ≈ {:+.1}%).",
        estimate.treatment_name,
        verb,
        estimate.outcome_name,
        estimate.odds_ratio,
        estimate.absolute_probability_delta * 100.0
    )
}

fn fmt_opt(value: Option<f64>, digits: usize) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.digits$}"))
}

pub fn build_summary(output: &PipelineOutput) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# KPI Churn Impact Report");
    let _ = writeln!(
        out,
        "Observation window {} to {}: {} teacher-months across {} teachers, {} distinct students.",
        output.window.since,
        output.window.until,
        output.table.len(),
        output
            .table
            .rows
            .iter()
            .map(|r| r.teacher_id.as_str())
            .collect::<std::collections::BTreeSet<_>>()
            .len(),
        output.table.student_count
    );

    let _ = writeln!(out);
    let _ = writeln!(out, "## Cohort Comparisons");
    for cohort in &output.cohorts {
        let _ = writeln!(out, "### {} ({} vs {})", cohort.scheme, cohort.first, cohort.second);
        for result in &cohort.results {
            match &result.test {
                Outcome::Computed(test) => {
                    let _ = writeln!(
                        out,
                        "- {}: U = {:.1}, p = {:.4}{} ({:?} for {}, n = {}/{})",
                        result.metric,
                        test.statistic,
                        test.p_value,
                        if test.is_significant { " *" } else { "" },
                        test.direction,
                        result.cohort_a,
                        result.n_a,
                        result.n_b
                    );
                }
                Outcome::NotComputable(reason) => {
                    let _ = writeln!(out, "- {}: not computable ({reason})", result.metric);
                }
            }
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Causal Estimates");
    if output.causal.is_empty() {
        let _ = writeln!(out, "No causal questions configured.");
    }
    for report in &output.causal {
        match &report.result {
            Outcome::Computed(estimate) => {
                let _ = writeln!(
                    out,
                    "- {}: {} (p = {:.4}, n = {})",
                    report.name,
                    conclusion(estimate),
                    estimate.fit.treatment_p_value,
                    estimate.fit.observations
                );
            }
            Outcome::NotComputable(reason) => {
                let _ = writeln!(out, "- {}: failed ({reason})", report.name);
            }
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Feature Attribution");
    for report in &output.attribution {
        let result = match &report.result {
            Outcome::Computed(result) => result,
            Outcome::NotComputable(reason) => {
                let _ = writeln!(out, "### {}\nNot computable: {reason}", report.name);
                continue;
            }
        };
        let _ = writeln!(out, "### {}", report.name);
        match &result.metrics {
            FitMetrics::Regression { r2, mae, rmse } => {
                let _ = writeln!(out, "R² {r2:.3}, MAE {mae:.3}, RMSE {rmse:.3}");
            }
            FitMetrics::Classification {
                accuracy,
                precision,
                recall,
                f1,
                roc_auc,
            } => {
                let _ = writeln!(
                    out,
                    "accuracy {accuracy:.3}, precision {precision:.3}, recall {recall:.3}, \
                     F1 {f1:.3}, ROC-AUC {}",
                    fmt_opt(*roc_auc, 3)
                );
            }
        }
        for feature in &result.feature_importance {
            let _ = writeln!(out, "- {}: {:.1}%", feature.feature, feature.attribution * 100.0);
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Financial Impact");
    let _ = writeln!(
        out,
        "Monetary loss per teacher-month: mean {}, std {}, total {:.2}.",
        fmt_opt(output.losses.mean, 2),
        fmt_opt(output.losses.std_dev, 2),
        output.losses.total
    );
    for share in &output.loss_shares {
        let _ = writeln!(
            out,
            "- {:?} annual loss {} of income {} over {} groups ({}%)",
            share.party,
            fmt_opt(share.annual_loss, 2),
            fmt_opt(share.annual_income, 2),
            share.groups,
            fmt_opt(share.loss_percent, 2)
        );
    }
    for projection in &output.financial {
        let _ = writeln!(
            out,
            "- {}: {:+.1} retained students, revenue delta {:+.2}",
            projection.estimate, projection.retained_students, projection.revenue_delta
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FitSummary;

    #[test]
    fn conclusion_reads_direction_and_size() {
        let estimate = CausalEstimate {
            treatment_name: "targets_achieved".into(),
            outcome_name: "loss_normalized".into(),
            ate: 1.145,
            odds_ratio: 3.14,
            baseline_probability: 0.12,
            treated_probability: 0.30,
            absolute_probability_delta: 0.18,
            fit: FitSummary {
                observations: 200,
                iterations: 5,
                log_likelihood: -110.0,
                null_log_likelihood: -115.0,
                pseudo_r2: 0.04,
                treatment_std_err: 0.38,
                treatment_z: 3.0,
                treatment_p_value: 0.002,
            },
        };
        assert_eq!(
            conclusion(&estimate),
            "targets_achieved raises the odds of loss_normalized by 3.14 times \
             (absolute change ≈ +18.0%)."
        );
    }
}
