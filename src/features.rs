use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::config::{BonusPolicy, MissingKpiPolicy, PipelineConfig};
use crate::models::{
    CompensationRecord, CoursePrice, EventKind, FeatureTable, Kpi, Period, RawEventRecord,
    TeacherPeriodFeatures, TeacherSalary,
};

/// Inclusive date range the analysis covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationWindow {
    pub since: NaiveDate,
    pub until: NaiveDate,
}

impl ObservationWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.since && date <= self.until
    }

    pub fn contains_period(&self, period: &Period) -> bool {
        let first = Period::from_date(self.since);
        let last = Period::from_date(self.until);
        *period >= first && *period <= last
    }
}

/// Static lookup tables used for compensation and monetary enrichment.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub compensation: Vec<CompensationRecord>,
    pub prices: Vec<CoursePrice>,
    pub salaries: Vec<TeacherSalary>,
}

#[derive(Debug, Default)]
struct GroupAccumulator {
    kpi_sums: [f64; 5],
    kpi_counts: [usize; 5],
    students: BTreeSet<String>,
    departed: BTreeMap<String, Option<String>>,
}

impl GroupAccumulator {
    fn push(&mut self, event: &RawEventRecord) {
        self.students.insert(event.student_id.clone());
        if event.kind == EventKind::Departure {
            let entry = self.departed.entry(event.student_id.clone()).or_default();
            if entry.is_none() {
                *entry = event.course_id.clone();
            }
            return;
        }
        if let (Some(kpi), Some(value)) = (event.kind.kpi(), event.value) {
            self.kpi_sums[kpi.index()] += value;
            self.kpi_counts[kpi.index()] += 1;
        }
    }

    fn kpi_mean(&self, kpi: Kpi, policy: MissingKpiPolicy) -> Option<f64> {
        let count = self.kpi_counts[kpi.index()];
        if count == 0 {
            return match policy {
                MissingKpiPolicy::Exclude => None,
                MissingKpiPolicy::Zero => Some(0.0),
            };
        }
        Some(self.kpi_sums[kpi.index()] / count as f64)
    }
}

fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Scheme v1 pays a share of base pay for each KPI that meets its threshold.
pub fn bonus_v1(policy: &BonusPolicy, kpis: &[Option<f64>; 5], base_pay: f64) -> f64 {
    kpis.iter()
        .zip(policy.thresholds.iter().zip(policy.v1_weights.iter()))
        .filter(|(value, (threshold, _))| value.is_some_and(|v| v >= **threshold))
        .map(|(_, (_, weight))| base_pay * weight)
        .sum()
}

/// Scheme v2 pays only when every KPI meets its threshold.
pub fn bonus_v2(
    policy: &BonusPolicy,
    kpis: &[Option<f64>; 5],
    lesson_rate: f64,
    lessons: u32,
) -> f64 {
    let all_met = kpis
        .iter()
        .zip(policy.thresholds.iter())
        .all(|(value, threshold)| value.is_some_and(|v| v >= *threshold));
    if all_met {
        (lesson_rate * f64::from(lessons)).max(policy.v2_minimum)
    } else {
        0.0
    }
}

#[derive(Debug, Default)]
struct MonthCompensation {
    motivation: Option<f64>,
    target_ratio: Option<f64>,
}

fn month_compensation_stats(
    compensation: &[CompensationRecord],
    window: &ObservationWindow,
) -> HashMap<Period, MonthCompensation> {
    let mut by_month: BTreeMap<Period, Vec<&CompensationRecord>> = BTreeMap::new();
    for record in compensation.iter().filter(|r| window.contains_period(&r.month)) {
        by_month.entry(record.month).or_default().push(record);
    }

    by_month
        .into_iter()
        .map(|(month, records)| {
            let motivation = mean(
                records
                    .iter()
                    .filter(|r| r.total_compensation > 0.0)
                    .map(|r| r.bonus / r.total_compensation)
                    .filter(|share| *share > 0.0),
            )
            .unwrap_or(0.0);
            let target_ratio = mean(records.iter().map(|r| f64::from(r.targets_achieved)));
            (
                month,
                MonthCompensation {
                    motivation: Some(motivation),
                    target_ratio,
                },
            )
        })
        .collect()
}

/// Aggregates raw events into one row per (teacher, month).
pub fn build_feature_table(
    events: &[RawEventRecord],
    reference: &ReferenceData,
    window: &ObservationWindow,
    config: &PipelineConfig,
) -> FeatureTable {
    let mut groups: BTreeMap<(String, Period), GroupAccumulator> = BTreeMap::new();
    let mut enrollments: BTreeSet<(&str, &str)> = BTreeSet::new();
    let mut teacher_courses: BTreeSet<(&str, &str)> = BTreeSet::new();
    let mut students: BTreeSet<&str> = BTreeSet::new();
    let mut outside = 0usize;

    for event in events {
        if !window.contains(event.occurred_at) {
            outside += 1;
            continue;
        }
        students.insert(&event.student_id);
        if let Some(course) = &event.course_id {
            enrollments.insert((&event.student_id, course));
            teacher_courses.insert((&event.teacher_id, course));
        }
        groups
            .entry((event.teacher_id.clone(), Period::from_date(event.occurred_at)))
            .or_default()
            .push(event);
    }
    debug!(outside, "events outside the observation window skipped");

    let prices: HashMap<&str, f64> = reference
        .prices
        .iter()
        .map(|p| (p.course_id.as_str(), p.monthly_price))
        .collect();
    let salaries: HashMap<&str, f64> = reference
        .salaries
        .iter()
        .map(|s| (s.teacher_id.as_str(), s.monthly_salary))
        .collect();
    let compensation: HashMap<(&str, Period), &CompensationRecord> = reference
        .compensation
        .iter()
        .map(|c| ((c.teacher_id.as_str(), c.month), c))
        .collect();
    let month_stats = month_compensation_stats(&reference.compensation, window);

    // teacher -> (first period, last period, total lost)
    let mut tenure: BTreeMap<&str, (Period, Period, u32)> = BTreeMap::new();
    for ((teacher, period), group) in &groups {
        let lost = group.departed.len() as u32;
        tenure
            .entry(teacher.as_str())
            .and_modify(|(first, last, total)| {
                *first = (*first).min(*period);
                *last = (*last).max(*period);
                *total += lost;
            })
            .or_insert((*period, *period, lost));
    }

    let policy = config.missing_kpi;
    let mut rows = Vec::with_capacity(groups.len());
    for ((teacher, period), group) in &groups {
        let kpis: [Option<f64>; 5] = Kpi::ALL.map(|kpi| group.kpi_mean(kpi, policy));
        let total_students = group.students.len() as u32;
        let students_lost = group.departed.len() as u32;
        let loss_rate = if total_students == 0 {
            0.0
        } else {
            f64::from(students_lost) / f64::from(total_students)
        };
        let (first, last, total_lost) = tenure[teacher.as_str()];
        let months_worked = first.months_through(&last);
        let loss_normalized = f64::from(total_lost) / f64::from(months_worked);

        let salary_share = salaries
            .get(teacher.as_str())
            .map(|salary| salary / config.students_per_group);
        let teacher_loss = if students_lost == 0 {
            Some(0.0)
        } else {
            salary_share.map(|share| f64::from(students_lost) * share)
        };
        let monetary_loss = if students_lost == 0 {
            Some(0.0)
        } else {
            let departed_price = mean(
                group
                    .departed
                    .values()
                    .filter_map(|course| course.as_deref())
                    .filter_map(|course| prices.get(course).copied()),
            );
            match (departed_price, salary_share) {
                (Some(price), Some(share)) => Some(f64::from(students_lost) * (price - share)),
                _ => None,
            }
        };

        let comp = compensation.get(&(teacher.as_str(), *period)).copied();
        let month = month_stats.get(period);
        let motivation = comp
            .filter(|c| c.total_compensation > 0.0)
            .map(|c| c.bonus / c.total_compensation);

        let mut row = TeacherPeriodFeatures {
            teacher_id: teacher.clone(),
            period: *period,
            academic_year: period.academic_year(config.academic_year_start_month),
            parent_feedback: kpis[0],
            student_feedback: kpis[1],
            homework_control: kpis[2],
            at_risk_intervention: kpis[3],
            average_success: kpis[4],
            total_students,
            students_lost,
            loss_rate,
            months_worked,
            loss_normalized,
            monetary_loss,
            teacher_loss,
            bonus: comp.map(|c| c.bonus),
            total_compensation: comp.map(|c| c.total_compensation),
            motivation,
            mean_motivation: comp.and(month.and_then(|m| m.motivation)),
            targets_achieved: comp.map(|c| c.targets_achieved > 0),
            kpi_target_ratio: comp.and(month.and_then(|m| m.target_ratio)),
            bonus_v1: comp.map(|c| bonus_v1(&config.bonus, &kpis, c.base_pay)),
            bonus_v2: comp.map(|c| bonus_v2(&config.bonus, &kpis, c.lesson_rate, c.lesson_count)),
            bonus_applied: comp.map(|c| c.bonus > 0.0),
            importance_parent_feedback: None,
            importance_student_feedback: None,
            importance_homework_control: None,
            importance_at_risk_intervention: None,
            importance_average_success: None,
        };
        assign_kpi_importance(&mut row);
        rows.push(row);
    }

    let mean_course_price = mean(
        enrollments
            .iter()
            .filter_map(|(_, course)| prices.get(course).copied()),
    );
    info!(
        rows = rows.len(),
        teachers = tenure.len(),
        students = students.len(),
        "feature table built"
    );

    let mut teacher_groups: BTreeMap<String, usize> = BTreeMap::new();
    for (teacher, _) in &teacher_courses {
        *teacher_groups.entry(teacher.to_string()).or_default() += 1;
    }
    let mean_lesson_rate = mean(
        reference
            .compensation
            .iter()
            .filter(|c| window.contains_period(&c.month))
            .map(|c| c.lesson_rate),
    );

    FeatureTable {
        rows,
        student_count: students.len(),
        mean_course_price,
        teacher_groups,
        mean_lesson_rate,
    }
}

/// Splits the teacher's normalized loss across KPIs in proportion to each KPI's
/// share of the row's KPI total.
fn assign_kpi_importance(row: &mut TeacherPeriodFeatures) {
    let total: f64 = Kpi::ALL.iter().filter_map(|k| row.kpi(*k)).sum();
    if total <= 0.0 {
        return;
    }
    let share = 1.0 / total;
    let loss = row.loss_normalized;
    for kpi in Kpi::ALL {
        let value = row.kpi(kpi).map(|v| share * v * loss);
        *row.importance_mut(kpi) = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn event(
        teacher: &str,
        student: &str,
        kind: EventKind,
        value: Option<f64>,
        on: NaiveDate,
    ) -> RawEventRecord {
        RawEventRecord {
            teacher_id: teacher.into(),
            student_id: student.into(),
            course_id: Some("c-1".into()),
            kind,
            value,
            occurred_at: on,
        }
    }

    fn window() -> ObservationWindow {
        ObservationWindow {
            since: date(2023, 8, 1),
            until: date(2024, 7, 31),
        }
    }

    fn sample_events() -> Vec<RawEventRecord> {
        vec![
            event("t-1", "s-1", EventKind::ParentFeedback, Some(1.0), date(2023, 9, 4)),
            event("t-1", "s-2", EventKind::ParentFeedback, Some(0.5), date(2023, 9, 11)),
            event("t-1", "s-1", EventKind::HomeworkCheck, Some(0.9), date(2023, 9, 12)),
            event("t-1", "s-3", EventKind::Departure, None, date(2023, 9, 20)),
            event("t-1", "s-3", EventKind::Departure, None, date(2023, 9, 21)),
            event("t-1", "s-1", EventKind::ParentFeedback, Some(0.8), date(2023, 11, 6)),
            event("t-2", "s-9", EventKind::SuccessScore, Some(0.6), date(2023, 10, 2)),
            event("t-2", "s-9", EventKind::SuccessScore, Some(0.6), date(2022, 10, 2)),
        ]
    }

    #[test]
    fn one_row_per_teacher_month_with_means_and_distinct_losses() {
        let table = build_feature_table(
            &sample_events(),
            &ReferenceData::default(),
            &window(),
            &PipelineConfig::default(),
        );
        assert_eq!(table.len(), 3);
        assert_eq!(table.student_count, 4);

        let sep = &table.rows[0];
        assert_eq!(sep.teacher_id, "t-1");
        assert_eq!(sep.period.to_string(), "2023-09");
        assert_eq!(sep.parent_feedback, Some(0.75));
        assert_eq!(sep.homework_control, Some(0.9));
        assert_eq!(sep.total_students, 3);
        assert_eq!(sep.students_lost, 1);
        assert!((sep.loss_rate - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(sep.months_worked, 3);
        assert!((sep.loss_normalized - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(sep.academic_year, 2023);
    }

    #[test]
    fn months_without_kpi_events_stay_null_unless_zero_policy() {
        let events = sample_events();
        let config = PipelineConfig::default();
        let table = build_feature_table(&events, &ReferenceData::default(), &window(), &config);
        let nov = &table.rows[1];
        assert_eq!(nov.homework_control, None);
        assert_eq!(nov.average_success, None);
        assert_eq!(nov.importance_homework_control, None);

        let zero = PipelineConfig {
            missing_kpi: MissingKpiPolicy::Zero,
            ..PipelineConfig::default()
        };
        let table = build_feature_table(&events, &ReferenceData::default(), &window(), &zero);
        assert_eq!(table.rows[1].homework_control, Some(0.0));
    }

    #[test]
    fn monetary_loss_uses_price_minus_amortized_salary() {
        let reference = ReferenceData {
            compensation: vec![],
            prices: vec![CoursePrice {
                course_id: "c-1".into(),
                monthly_price: 100.0,
            }],
            salaries: vec![TeacherSalary {
                teacher_id: "t-1".into(),
                monthly_salary: 300.0,
            }],
        };
        let config = PipelineConfig::default();
        let table = build_feature_table(&sample_events(), &reference, &window(), &config);
        assert_eq!(table.rows[0].monetary_loss, Some(70.0));
        assert_eq!(table.rows[1].monetary_loss, Some(0.0));
        assert_eq!(table.rows[0].teacher_loss, Some(30.0));
        assert_eq!(table.rows[1].teacher_loss, Some(0.0));
        // t-2 has no salary, but lost nobody
        assert_eq!(table.rows[2].teacher_loss, Some(0.0));
        assert_eq!(table.mean_course_price, Some(100.0));
        assert_eq!(table.teacher_groups.get("t-1"), Some(&1));
        assert_eq!(table.teacher_groups.get("t-2"), Some(&1));
    }

    #[test]
    fn compensation_drives_bonus_flags() {
        let reference = ReferenceData {
            compensation: vec![
                CompensationRecord {
                    teacher_id: "t-1".into(),
                    month: Period::new(2023, 9).unwrap(),
                    base_pay: 1000.0,
                    bonus: 200.0,
                    total_compensation: 1200.0,
                    lesson_rate: 30.0,
                    lesson_count: 40,
                    targets_achieved: 1,
                },
                CompensationRecord {
                    teacher_id: "t-3".into(),
                    month: Period::new(2023, 9).unwrap(),
                    base_pay: 1000.0,
                    bonus: 0.0,
                    total_compensation: 1000.0,
                    lesson_rate: 30.0,
                    lesson_count: 40,
                    targets_achieved: 0,
                },
            ],
            ..ReferenceData::default()
        };
        let config = PipelineConfig::default();
        let table = build_feature_table(&sample_events(), &reference, &window(), &config);
        let sep = &table.rows[0];
        // parent feedback 0.75 misses, homework 0.9 meets
        assert!((sep.bonus_v1.unwrap() - 132.0).abs() < 1e-9);
        assert_eq!(sep.bonus_v2, Some(0.0));
        assert_eq!(sep.bonus_applied, Some(true));
        assert_eq!(sep.targets_achieved, Some(true));
        assert_eq!(sep.kpi_target_ratio, Some(0.5));
        assert!((sep.mean_motivation.unwrap() - 200.0 / 1200.0).abs() < 1e-12);
        assert_eq!(table.rows[1].bonus_v1, None);
    }

    #[test]
    fn v2_pays_the_floor_when_everything_is_met() {
        let policy = BonusPolicy::default();
        let all = [Some(0.95), Some(0.92), Some(0.91), Some(0.9), Some(0.8)];
        assert_eq!(bonus_v2(&policy, &all, 20.0, 30), 1000.0);
        assert_eq!(bonus_v2(&policy, &all, 50.0, 30), 1500.0);
        let missing = [Some(0.95), None, Some(0.91), Some(0.9), Some(0.8)];
        assert_eq!(bonus_v2(&policy, &missing, 50.0, 30), 0.0);
    }

    #[test]
    fn importance_shares_split_normalized_loss() {
        let reference = ReferenceData::default();
        let config = PipelineConfig::default();
        let table = build_feature_table(&sample_events(), &reference, &window(), &config);
        let sep = &table.rows[0];
        let total: f64 = [
            sep.importance_parent_feedback,
            sep.importance_homework_control,
        ]
        .iter()
        .flatten()
        .sum();
        assert!((total - sep.loss_normalized).abs() < 1e-12);
    }
}
