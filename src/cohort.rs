//! Cohort classification strategies.
//!
//! Each strategy labels every row of the feature table with exactly one
//! [`CohortLabel`]. Labels are recomputed from the table on every run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::models::{CohortLabel, CohortSummary, FeatureTable};

pub trait CohortClassifier {
    fn name(&self) -> &str;
    /// Every label this strategy can assign.
    fn labels(&self) -> &'static [CohortLabel];
    fn label(&self, table: &FeatureTable) -> Vec<CohortLabel>;
}

/// Stable when the teacher's cumulative loss count over the window stays below `cutoff`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCohort {
    pub name: String,
    pub cutoff: f64,
}

impl CohortClassifier for ThresholdCohort {
    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &'static [CohortLabel] {
        &[CohortLabel::Stable, CohortLabel::Unstable]
    }

    fn label(&self, table: &FeatureTable) -> Vec<CohortLabel> {
        let mut totals: BTreeMap<&str, u32> = BTreeMap::new();
        for row in &table.rows {
            *totals.entry(row.teacher_id.as_str()).or_default() += row.students_lost;
        }
        table
            .rows
            .iter()
            .map(|row| {
                if f64::from(totals[row.teacher_id.as_str()]) < self.cutoff {
                    CohortLabel::Stable
                } else {
                    CohortLabel::Unstable
                }
            })
            .collect()
    }
}

/// Ranks teachers within each academic year by a composite of success and
/// retention; the top `fraction` is `BestOfYear`, the bottom `BadOfYear`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileCohort {
    pub name: String,
    pub fraction: f64,
    pub success_weight: f64,
    pub retention_weight: f64,
}

impl PercentileCohort {
    fn composite(&self, success: Option<f64>, loss_rate: f64) -> Option<f64> {
        let total = self.success_weight + self.retention_weight;
        success.map(|s| {
            (self.success_weight * s + self.retention_weight * (1.0 - loss_rate)) / total
        })
    }
}

impl CohortClassifier for PercentileCohort {
    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &'static [CohortLabel] {
        &[CohortLabel::BestOfYear, CohortLabel::BadOfYear, CohortLabel::Neither]
    }

    fn label(&self, table: &FeatureTable) -> Vec<CohortLabel> {
        let mut scores: BTreeMap<(i32, &str), (f64, usize)> = BTreeMap::new();
        for row in &table.rows {
            if let Some(score) = self.composite(row.average_success, row.loss_rate) {
                let entry = scores
                    .entry((row.academic_year, row.teacher_id.as_str()))
                    .or_insert((0.0, 0));
                entry.0 += score;
                entry.1 += 1;
            }
        }

        let mut by_year: BTreeMap<i32, Vec<(&str, f64)>> = BTreeMap::new();
        for ((year, teacher), (sum, count)) in scores {
            by_year.entry(year).or_default().push((teacher, sum / count as f64));
        }

        let mut assigned: BTreeMap<(i32, &str), CohortLabel> = BTreeMap::new();
        for (year, mut ranked) in by_year {
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
            let n = ranked.len();
            let k = ((n as f64 * self.fraction).ceil() as usize).min(n / 2);
            debug!(year, teachers = n, per_tail = k, "ranking teachers");
            for (position, (teacher, _)) in ranked.iter().enumerate() {
                let label = if position < k {
                    CohortLabel::BestOfYear
                } else if position >= n - k {
                    CohortLabel::BadOfYear
                } else {
                    CohortLabel::Neither
                };
                assigned.insert((year, teacher), label);
            }
        }

        table
            .rows
            .iter()
            .map(|row| {
                assigned
                    .get(&(row.academic_year, row.teacher_id.as_str()))
                    .copied()
                    .unwrap_or(CohortLabel::Neither)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CohortScheme {
    Threshold(ThresholdCohort),
    Percentile(PercentileCohort),
}

impl CohortScheme {
    pub fn classifier(&self) -> &dyn CohortClassifier {
        match self {
            Self::Threshold(t) => t,
            Self::Percentile(p) => p,
        }
    }

    pub fn name(&self) -> &str {
        self.classifier().name()
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Threshold(t) if !t.cutoff.is_finite() => Err(PipelineError::Config(format!(
                "cohort `{}` needs a finite cutoff",
                t.name
            ))),
            Self::Percentile(p) if !(p.fraction > 0.0 && p.fraction <= 0.5) => {
                Err(PipelineError::Config(format!(
                    "cohort `{}` fraction must be in (0, 0.5]",
                    p.name
                )))
            }
            Self::Percentile(p)
                if p.success_weight < 0.0
                    || p.retention_weight < 0.0
                    || p.success_weight + p.retention_weight <= 0.0 =>
            {
                Err(PipelineError::Config(format!(
                    "cohort `{}` weights must be non-negative and not both zero",
                    p.name
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn assign(&self, table: &FeatureTable) -> CohortAssignment {
        CohortAssignment {
            scheme: self.name().to_string(),
            labels: self.classifier().label(table),
        }
    }
}

/// Labels for one scheme, aligned with the feature table rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortAssignment {
    pub scheme: String,
    pub labels: Vec<CohortLabel>,
}

impl CohortAssignment {
    pub fn members(&self, label: CohortLabel) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == label)
            .map(|(i, _)| i)
            .collect()
    }

    /// Row indices of both cohorts, or `InsufficientCohortSize` when either side
    /// is smaller than `min_size`.
    pub fn pair(
        &self,
        first: CohortLabel,
        second: CohortLabel,
        min_size: usize,
    ) -> Result<(Vec<usize>, Vec<usize>)> {
        let a = self.members(first);
        let b = self.members(second);
        for (label, members) in [(first, &a), (second, &b)] {
            if members.len() < min_size {
                return Err(PipelineError::InsufficientCohortSize {
                    scheme: self.scheme.clone(),
                    label: label.to_string(),
                    found: members.len(),
                    required: min_size,
                });
            }
        }
        Ok((a, b))
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Mean and median of each metric per cohort, nulls excluded.
pub fn summarize(
    table: &FeatureTable,
    assignment: &CohortAssignment,
    cohorts: &[CohortLabel],
    metrics: &[String],
) -> Result<Vec<CohortSummary>> {
    let mut summaries = Vec::new();
    for metric in metrics {
        let column = table.column(metric)?;
        for cohort in cohorts {
            let values: Vec<f64> = assignment
                .members(*cohort)
                .into_iter()
                .filter_map(|i| column[i])
                .collect();
            summaries.push(CohortSummary {
                scheme: assignment.scheme.clone(),
                cohort: *cohort,
                metric: metric.clone(),
                observations: values.len(),
                mean: mean(&values),
                median: median(&values),
            });
        }
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::feature_row;

    fn table_with_losses(losses: &[(&str, u32)]) -> FeatureTable {
        FeatureTable {
            rows: losses
                .iter()
                .enumerate()
                .map(|(i, (teacher, lost))| {
                    let mut row = feature_row(teacher, 2023, 9 + (i as u32 % 3));
                    row.students_lost = *lost;
                    row
                })
                .collect(),
            ..FeatureTable::default()
        }
    }

    #[test]
    fn threshold_uses_cumulative_teacher_losses() {
        let table = table_with_losses(&[("a", 1), ("a", 1), ("b", 2), ("b", 1), ("c", 0)]);
        let scheme = ThresholdCohort {
            name: "stability".into(),
            cutoff: 3.0,
        };
        let labels = scheme.label(&table);
        assert_eq!(
            labels,
            vec![
                CohortLabel::Stable,
                CohortLabel::Stable,
                CohortLabel::Unstable,
                CohortLabel::Unstable,
                CohortLabel::Stable,
            ]
        );
    }

    #[test]
    fn percentile_labels_tails_within_each_year() {
        let mut rows = Vec::new();
        for i in 0..20u32 {
            let mut row = feature_row(&format!("t{i:02}"), 2023, 10);
            row.average_success = Some(f64::from(i) / 20.0);
            row.loss_rate = 0.0;
            rows.push(row);
        }
        let mut unscored = feature_row("zz", 2023, 10);
        unscored.average_success = None;
        rows.push(unscored);
        let table = FeatureTable {
            rows,
            ..FeatureTable::default()
        };

        let scheme = PercentileCohort {
            name: "year_rank".into(),
            fraction: 0.1,
            success_weight: 0.5,
            retention_weight: 0.5,
        };
        let labels = scheme.label(&table);
        assert_eq!(labels[19], CohortLabel::BestOfYear);
        assert_eq!(labels[18], CohortLabel::BestOfYear);
        assert_eq!(labels[0], CohortLabel::BadOfYear);
        assert_eq!(labels[1], CohortLabel::BadOfYear);
        assert_eq!(labels[10], CohortLabel::Neither);
        assert_eq!(labels[20], CohortLabel::Neither);
        assert_eq!(labels.iter().filter(|l| **l == CohortLabel::BestOfYear).count(), 2);
    }

    #[test]
    fn small_cohorts_are_rejected() {
        let table = table_with_losses(&[("a", 0), ("b", 5), ("c", 0)]);
        let scheme = CohortScheme::Threshold(ThresholdCohort {
            name: "stability".into(),
            cutoff: 3.0,
        });
        let assignment = scheme.assign(&table);
        let err = assignment
            .pair(CohortLabel::Stable, CohortLabel::Unstable, 2)
            .unwrap_err();
        match err {
            PipelineError::InsufficientCohortSize { label, found, .. } => {
                assert_eq!(label, "Unstable");
                assert_eq!(found, 1);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn summaries_skip_null_cells() {
        let mut table = table_with_losses(&[("a", 0), ("a", 0), ("b", 4)]);
        table.rows[0].parent_feedback = Some(0.5);
        table.rows[1].parent_feedback = None;
        table.rows[2].parent_feedback = Some(0.9);
        let scheme = CohortScheme::Threshold(ThresholdCohort {
            name: "stability".into(),
            cutoff: 3.0,
        });
        let assignment = scheme.assign(&table);
        let summary = summarize(
            &table,
            &assignment,
            &[CohortLabel::Stable, CohortLabel::Unstable],
            &["parent_feedback".to_string()],
        )
        .unwrap();
        assert_eq!(summary[0].observations, 1);
        assert_eq!(summary[0].mean, Some(0.5));
        assert_eq!(summary[1].median, Some(0.9));
    }

    #[test]
    fn median_of_even_sample_averages_middle_values() {
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }
}
