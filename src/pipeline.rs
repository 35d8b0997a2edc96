//! Runs every component over one feature table.

use tracing::{info, warn};

use crate::attribution;
use crate::causal::{self, CausalReport};
use crate::cohort;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::features::{self, ObservationWindow, ReferenceData};
use crate::finance::{self, FinancialProjection, LossShare, LossSummary};
use crate::models::{
    AttributionResult, CohortLabel, CohortSummary, FeatureTable, Outcome, RawEventRecord,
    SignificanceResult,
};
use crate::significance;

#[derive(Debug, Clone, PartialEq)]
pub struct CohortReport {
    pub scheme: String,
    pub first: CohortLabel,
    pub second: CohortLabel,
    /// Row-aligned with the feature table.
    pub labels: Vec<CohortLabel>,
    pub results: Vec<SignificanceResult>,
    pub summaries: Vec<CohortSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributionReport {
    pub name: String,
    pub result: Outcome<AttributionResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub window: ObservationWindow,
    pub table: FeatureTable,
    pub cohorts: Vec<CohortReport>,
    pub causal: Vec<CausalReport>,
    pub attribution: Vec<AttributionReport>,
    pub financial: Vec<FinancialProjection>,
    pub losses: LossSummary,
    pub loss_shares: Vec<LossShare>,
}

/// Cohorts, significance, causal estimates, attribution and the financial
/// projection over an already built feature table.
pub fn analyze(
    table: FeatureTable,
    window: ObservationWindow,
    config: &PipelineConfig,
) -> Result<PipelineOutput> {
    config.validate()?;

    let mut cohorts = Vec::with_capacity(config.cohorts.len());
    for comparison in &config.cohorts {
        let assignment = comparison.scheme.assign(&table);
        let results = significance::compare_cohorts(&table, &assignment, comparison, config)?;
        let summaries = cohort::summarize(
            &table,
            &assignment,
            &[comparison.first, comparison.second],
            &config.metrics,
        )?;
        cohorts.push(CohortReport {
            scheme: assignment.scheme.clone(),
            first: comparison.first,
            second: comparison.second,
            labels: assignment.labels,
            results,
            summaries,
        });
    }

    let causal = causal::estimate_all(&table, &config.causal)?;

    let mut attribution = Vec::with_capacity(config.attribution.len());
    for spec in &config.attribution {
        let result = match attribution::train(&table, spec, config) {
            Ok(result) => Outcome::Computed(result),
            Err(err @ PipelineError::InsufficientRows { .. }) => {
                warn!(model = %spec.name, "{err}");
                Outcome::NotComputable(err.to_string())
            }
            Err(err) => return Err(err),
        };
        attribution.push(AttributionReport {
            name: spec.name.clone(),
            result,
        });
    }

    let mut financial = Vec::new();
    match finance::revenue_per_student(&table, config) {
        Some(revenue) => {
            for report in &causal {
                if let Outcome::Computed(estimate) = &report.result {
                    let students = table.student_count;
                    financial.push(finance::project(&report.name, estimate, students, revenue));
                }
            }
        }
        None => warn!("no course prices or revenue override; financial projection skipped"),
    }
    let losses = finance::summarize_losses(&table);
    let loss_shares = finance::loss_shares(&table, config);

    info!(
        comparisons = cohorts.len(),
        estimates = causal.len(),
        models = attribution.len(),
        "analysis complete"
    );
    Ok(PipelineOutput {
        window,
        table,
        cohorts,
        causal,
        attribution,
        financial,
        losses,
        loss_shares,
    })
}

/// Builds the feature table from raw events and runs the analysis.
pub fn run(
    events: &[RawEventRecord],
    reference: &ReferenceData,
    window: ObservationWindow,
    config: &PipelineConfig,
) -> Result<PipelineOutput> {
    let table = features::build_feature_table(events, reference, &window, config);
    if table.is_empty() {
        return Err(PipelineError::schema(
            "events",
            format!("no events between {} and {}", window.since, window.until),
        ));
    }
    analyze(table, window, config)
}
