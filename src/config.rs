use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::attribution::AttributionSpec;
use crate::causal::{CausalSpec, Indicator, IndicatorRule};
use crate::cohort::{CohortScheme, PercentileCohort, ThresholdCohort};
use crate::error::{PipelineError, Result};
use crate::models::{CohortLabel, Kpi, TargetKind};

/// How a teacher-month without events for a KPI is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingKpiPolicy {
    /// Keep the cell null and leave it out of every statistic.
    Exclude,
    /// Treat the month as a zero score.
    Zero,
}

/// KPI thresholds and weights for the two proposed bonus schemes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BonusPolicy {
    /// Per-KPI attainment threshold in canonical KPI order.
    pub thresholds: [f64; 5],
    /// Share of base pay paid per KPI met under scheme v1.
    pub v1_weights: [f64; 5],
    /// Floor for the all-or-nothing v2 payout.
    pub v2_minimum: f64,
}

impl Default for BonusPolicy {
    fn default() -> Self {
        Self {
            thresholds: [0.90, 0.90, 0.90, 0.85, 0.75],
            v1_weights: [0.111, 0.126, 0.132, 0.130, 0.132],
            v2_minimum: 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortComparison {
    pub scheme: CohortScheme,
    pub first: CohortLabel,
    pub second: CohortLabel,
}

/// Every tunable of a run. Passed by reference into each component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub alpha: f64,
    pub seed: u64,
    pub missing_kpi: MissingKpiPolicy,
    pub min_cohort_size: usize,
    pub academic_year_start_month: u32,
    pub students_per_group: f64,
    /// Lessons a group takes per month, used for the annual income ceiling.
    pub lessons_per_group: f64,
    pub revenue_per_student: Option<f64>,
    pub bonus: BonusPolicy,
    pub metrics: Vec<String>,
    pub cohorts: Vec<CohortComparison>,
    pub causal: Vec<CausalSpec>,
    pub attribution: Vec<AttributionSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let kpis: Vec<String> = Kpi::ALL.iter().map(|k| k.column().to_string()).collect();
        Self {
            alpha: 0.05,
            seed: 42,
            missing_kpi: MissingKpiPolicy::Exclude,
            min_cohort_size: 5,
            academic_year_start_month: 8,
            students_per_group: 10.0,
            lessons_per_group: 40.0,
            revenue_per_student: None,
            bonus: BonusPolicy::default(),
            metrics: kpis.clone(),
            cohorts: vec![
                CohortComparison {
                    scheme: CohortScheme::Threshold(ThresholdCohort {
                        name: "stability".into(),
                        cutoff: 3.0,
                    }),
                    first: CohortLabel::Stable,
                    second: CohortLabel::Unstable,
                },
                CohortComparison {
                    scheme: CohortScheme::Percentile(PercentileCohort {
                        name: "year_rank".into(),
                        fraction: 0.1,
                        success_weight: 0.5,
                        retention_weight: 0.5,
                    }),
                    first: CohortLabel::BestOfYear,
                    second: CohortLabel::BadOfYear,
                },
            ],
            causal: vec![
                CausalSpec {
                    name: "bonus_policy_to_kpi".into(),
                    treatment: Indicator::new("bonus_v1", IndicatorRule::Positive),
                    outcome: Indicator::new("kpi_target_ratio", IndicatorRule::AboveMean),
                    covariates: vec!["bonus_v2".into()],
                },
                CausalSpec {
                    name: "kpi_to_retention".into(),
                    treatment: Indicator::new("targets_achieved", IndicatorRule::Positive),
                    outcome: Indicator::new("loss_normalized", IndicatorRule::BelowMedian),
                    covariates: vec!["mean_motivation".into()],
                },
            ],
            attribution: vec![
                AttributionSpec {
                    name: "students_lost".into(),
                    target: "students_lost".into(),
                    kind: TargetKind::Regression,
                    target_rule: None,
                    features: kpis,
                    trees: 50,
                    test_fraction: 0.2,
                    max_depth: None,
                },
                AttributionSpec {
                    name: "kpi_target_met".into(),
                    target: "kpi_target_ratio".into(),
                    kind: TargetKind::Classification,
                    target_rule: Some(IndicatorRule::AboveMean),
                    features: vec!["bonus".into(), "bonus_v1".into(), "bonus_v2".into()],
                    trees: 100,
                    test_fraction: 0.3,
                    max_depth: None,
                },
            ],
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(PipelineError::Config(format!(
                "alpha must be in (0, 1), got {}",
                self.alpha
            )));
        }
        if self.min_cohort_size < 2 {
            return Err(PipelineError::Config(
                "min_cohort_size must be at least 2".into(),
            ));
        }
        if !(1..=12).contains(&self.academic_year_start_month) {
            return Err(PipelineError::Config(
                "academic_year_start_month must be 1..=12".into(),
            ));
        }
        if self.students_per_group <= 0.0 {
            return Err(PipelineError::Config(
                "students_per_group must be positive".into(),
            ));
        }
        if self.lessons_per_group <= 0.0 {
            return Err(PipelineError::Config(
                "lessons_per_group must be positive".into(),
            ));
        }
        for comparison in &self.cohorts {
            comparison.scheme.validate()?;
            let assignable = comparison.scheme.classifier().labels();
            for label in [comparison.first, comparison.second] {
                if !assignable.contains(&label) {
                    return Err(PipelineError::Config(format!(
                        "cohort comparison `{}` uses {label}, which that scheme never assigns",
                        comparison.scheme.name()
                    )));
                }
            }
            if comparison.first == comparison.second {
                return Err(PipelineError::Config(format!(
                    "cohort comparison `{}` compares {} with itself",
                    comparison.scheme.name(),
                    comparison.first
                )));
            }
        }
        for spec in &self.attribution {
            spec.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.metrics.len(), 5);
        assert_eq!(config.causal.len(), 2);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let raw = r#"
            alpha = 0.01
            seed = 7
            missing_kpi = "zero"

            [[causal]]
            name = "bonus_applied_to_kpi"
            covariates = []
            treatment = { column = "bonus_applied", rule = "positive" }
            outcome = { column = "kpi_target_ratio", rule = "at_least", threshold = 0.5 }
        "#;
        let config: PipelineConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.alpha, 0.01);
        assert_eq!(config.missing_kpi, MissingKpiPolicy::Zero);
        assert_eq!(config.min_cohort_size, 5);
        assert_eq!(config.causal.len(), 1);
        assert_eq!(
            config.causal[0].outcome.rule,
            IndicatorRule::AtLeast { threshold: 0.5 }
        );
    }

    #[test]
    fn cohort_schemes_parse_from_toml() {
        let raw = r#"
            [[cohorts]]
            first = "Stable"
            second = "Unstable"
            scheme = { kind = "threshold", name = "stability", cutoff = 4.0 }
        "#;
        let config: PipelineConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.cohorts.len(), 1);
        assert_eq!(config.cohorts[0].scheme.name(), "stability");
    }

    #[test]
    fn comparison_labels_must_belong_to_the_scheme() {
        let raw = r#"
            [[cohorts]]
            first = "BestOfYear"
            second = "Unstable"
            scheme = { kind = "threshold", name = "stability", cutoff = 3.0 }
        "#;
        let config: PipelineConfig = toml::from_str(raw).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("BestOfYear"));
    }

    #[test]
    fn rejects_out_of_range_alpha() {
        let config = PipelineConfig {
            alpha: 1.5,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }
}
