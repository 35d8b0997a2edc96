use serde::Serialize;

use crate::config::PipelineConfig;
use crate::models::{CausalEstimate, FeatureTable};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinancialProjection {
    pub estimate: String,
    pub probability_delta: f64,
    pub student_count: usize,
    pub revenue_per_student: f64,
    pub retained_students: f64,
    pub revenue_delta: f64,
}

/// Monetary loss across teacher-months with a known loss value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossSummary {
    pub observations: usize,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
    pub total: f64,
}

/// Revenue delta = probability delta × students × revenue per student.
pub fn project(
    name: &str,
    estimate: &CausalEstimate,
    student_count: usize,
    revenue_per_student: f64,
) -> FinancialProjection {
    let retained_students = estimate.absolute_probability_delta * student_count as f64;
    FinancialProjection {
        estimate: name.to_string(),
        probability_delta: estimate.absolute_probability_delta,
        student_count,
        revenue_per_student,
        retained_students,
        revenue_delta: retained_students * revenue_per_student,
    }
}

/// Configured override, else the mean course price of enrolled students.
pub fn revenue_per_student(table: &FeatureTable, config: &PipelineConfig) -> Option<f64> {
    config.revenue_per_student.or(table.mean_course_price)
}

pub fn summarize_losses(table: &FeatureTable) -> LossSummary {
    let values: Vec<f64> = table.rows.iter().filter_map(|r| r.monetary_loss).collect();
    let (mean, std_dev) = describe(&values);
    LossSummary {
        observations: values.len(),
        mean,
        std_dev,
        total: values.iter().sum(),
    }
}

const MONTHS_IN_YEAR: f64 = 12.0;

/// Who bears a loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LossParty {
    Teacher,
    School,
}

/// A party's mean loss per teacher-month scaled to a year and set against the
/// income it could have earned over the same groups.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossShare {
    pub party: LossParty,
    pub observations: usize,
    pub mean_loss: Option<f64>,
    pub std_loss: Option<f64>,
    /// Largest group count of a single teacher for `Teacher`, all groups for `School`.
    pub groups: usize,
    /// Lesson rate for `Teacher`, monthly course price for `School`.
    pub unit_price: Option<f64>,
    pub annual_income: Option<f64>,
    pub annual_loss: Option<f64>,
    pub loss_percent: Option<f64>,
}

fn describe(values: &[f64]) -> (Option<f64>, Option<f64>) {
    let n = values.len();
    let mean = (n > 0).then(|| values.iter().sum::<f64>() / n as f64);
    let std_dev = mean.filter(|_| n > 1).map(|m| {
        let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
        (ss / (n - 1) as f64).sqrt()
    });
    (mean, std_dev)
}

fn share(
    party: LossParty,
    values: Vec<f64>,
    groups: usize,
    unit_price: Option<f64>,
    income_per_group: impl Fn(f64) -> f64,
) -> LossShare {
    let (mean_loss, std_loss) = describe(&values);
    let annual_income = unit_price.map(|price| groups as f64 * income_per_group(price));
    let annual_loss = mean_loss.map(|m| m * groups as f64);
    let loss_percent = match (annual_loss, annual_income) {
        (Some(loss), Some(income)) if income > 0.0 => Some(loss * 100.0 / income),
        _ => None,
    };
    LossShare {
        party,
        observations: values.len(),
        mean_loss,
        std_loss,
        groups,
        unit_price,
        annual_income,
        annual_loss,
        loss_percent,
    }
}

/// Teacher side: income = busiest teacher's groups × lessons × mean lesson
/// rate × 12, loss = mean teacher loss × those groups. School side: income =
/// all groups × mean course price × 12, loss = mean school loss × all groups.
pub fn loss_shares(table: &FeatureTable, config: &PipelineConfig) -> Vec<LossShare> {
    let max_groups = table.teacher_groups.values().copied().max().unwrap_or(0);
    let all_groups: usize = table.teacher_groups.values().sum();
    let lessons = config.lessons_per_group;
    vec![
        share(
            LossParty::Teacher,
            table.rows.iter().filter_map(|r| r.teacher_loss).collect(),
            max_groups,
            table.mean_lesson_rate,
            |rate| lessons * rate * MONTHS_IN_YEAR,
        ),
        share(
            LossParty::School,
            table.rows.iter().filter_map(|r| r.monetary_loss).collect(),
            all_groups,
            table.mean_course_price,
            |price| price * MONTHS_IN_YEAR,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::feature_row;
    use crate::models::FitSummary;

    fn estimate(delta: f64) -> CausalEstimate {
        CausalEstimate {
            treatment_name: "targets_achieved".into(),
            outcome_name: "loss_normalized".into(),
            ate: 0.4,
            odds_ratio: 0.4f64.exp(),
            baseline_probability: 0.5,
            treated_probability: 0.5 + delta,
            absolute_probability_delta: delta,
            fit: FitSummary {
                observations: 100,
                iterations: 4,
                log_likelihood: -60.0,
                null_log_likelihood: -69.0,
                pseudo_r2: 0.13,
                treatment_std_err: 0.2,
                treatment_z: 2.0,
                treatment_p_value: 0.045,
            },
        }
    }

    #[test]
    fn projects_revenue_from_the_probability_delta() {
        let projection = project("kpi_to_retention", &estimate(0.05), 400, 120.0);
        assert!((projection.retained_students - 20.0).abs() < 1e-9);
        assert!((projection.revenue_delta - 2400.0).abs() < 1e-9);
    }

    #[test]
    fn override_wins_over_course_prices() {
        let table = FeatureTable {
            mean_course_price: Some(90.0),
            ..FeatureTable::default()
        };
        let mut config = PipelineConfig::default();
        assert_eq!(revenue_per_student(&table, &config), Some(90.0));
        config.revenue_per_student = Some(150.0);
        assert_eq!(revenue_per_student(&table, &config), Some(150.0));
    }

    #[test]
    fn loss_summary_uses_the_sample_deviation() {
        let rows = [Some(100.0), Some(300.0), None]
            .into_iter()
            .enumerate()
            .map(|(i, loss)| {
                let mut row = feature_row(&format!("t{i}"), 2023, 9);
                row.monetary_loss = loss;
                row
            })
            .collect();
        let table = FeatureTable {
            rows,
            ..FeatureTable::default()
        };
        let summary = summarize_losses(&table);
        assert_eq!(summary.observations, 2);
        assert_eq!(summary.mean, Some(200.0));
        assert_eq!(summary.total, 400.0);
        let sd = summary.std_dev.unwrap();
        assert!((sd - 20000f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn annual_loss_shares_for_teacher_and_school() {
        let rows = [(120.0, 300.0), (60.0, 100.0), (0.0, 0.0)]
            .into_iter()
            .enumerate()
            .map(|(i, (teacher, school))| {
                let mut row = feature_row("t-1", 2023, 9 + i as u32);
                row.teacher_loss = Some(teacher);
                row.monetary_loss = Some(school);
                row
            })
            .collect();
        let table = FeatureTable {
            rows,
            mean_course_price: Some(100.0),
            mean_lesson_rate: Some(25.0),
            teacher_groups: [("t-1".to_string(), 3), ("t-2".to_string(), 2)].into_iter().collect(),
            ..FeatureTable::default()
        };
        let shares = loss_shares(&table, &PipelineConfig::default());
        let (teacher, school) = (&shares[0], &shares[1]);

        assert_eq!(teacher.party, LossParty::Teacher);
        assert_eq!(teacher.observations, 3);
        assert_eq!(teacher.mean_loss, Some(60.0));
        assert_eq!(teacher.std_loss, Some(60.0));
        assert_eq!(teacher.groups, 3);
        // 3 groups × 40 lessons × 25 × 12
        assert_eq!(teacher.annual_income, Some(36_000.0));
        assert_eq!(teacher.annual_loss, Some(180.0));
        assert!((teacher.loss_percent.unwrap() - 0.5).abs() < 1e-12);

        assert_eq!(school.party, LossParty::School);
        assert!((school.mean_loss.unwrap() - 400.0 / 3.0).abs() < 1e-9);
        assert_eq!(school.groups, 5);
        // 100 × 5 groups × 12
        assert_eq!(school.annual_income, Some(6_000.0));
        assert!((school.annual_loss.unwrap() - 2000.0 / 3.0).abs() < 1e-9);
        assert!((school.loss_percent.unwrap() - 100.0 / 9.0).abs() < 1e-9);
    }

    #[test]
    fn loss_share_without_prices_has_no_percentage() {
        let table = FeatureTable {
            rows: vec![feature_row("t-1", 2023, 9)],
            ..FeatureTable::default()
        };
        let shares = loss_shares(&table, &PipelineConfig::default());
        assert!(shares.iter().all(|s| s.annual_income.is_none() && s.loss_percent.is_none()));
        assert_eq!(shares[0].groups, 0);
    }
}
