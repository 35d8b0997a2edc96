use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Calendar month a teacher row is aggregated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Year in which the academic year containing this month started.
    pub fn academic_year(&self, start_month: u32) -> i32 {
        if self.month >= start_month {
            self.year
        } else {
            self.year - 1
        }
    }

    fn ordinal(&self) -> i64 {
        i64::from(self.year) * 12 + i64::from(self.month) - 1
    }

    /// Inclusive number of months from `self` to `later`.
    pub fn months_through(&self, later: &Period) -> u32 {
        (later.ordinal() - self.ordinal() + 1).max(1) as u32
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (year, month) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("period `{s}` is not YYYY-MM"))?;
        let year: i32 = year.parse().map_err(|_| format!("bad year in `{s}`"))?;
        let month: u32 = month.parse().map_err(|_| format!("bad month in `{s}`"))?;
        Period::new(year, month).ok_or_else(|| format!("month out of range in `{s}`"))
    }
}

impl TryFrom<String> for Period {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ParentFeedback,
    StudentFeedback,
    HomeworkCheck,
    AtRiskIntervention,
    SuccessScore,
    Departure,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParentFeedback => "parent_feedback",
            Self::StudentFeedback => "student_feedback",
            Self::HomeworkCheck => "homework_check",
            Self::AtRiskIntervention => "at_risk_intervention",
            Self::SuccessScore => "success_score",
            Self::Departure => "departure",
        }
    }

    pub fn kpi(&self) -> Option<Kpi> {
        match self {
            Self::ParentFeedback => Some(Kpi::ParentFeedback),
            Self::StudentFeedback => Some(Kpi::StudentFeedback),
            Self::HomeworkCheck => Some(Kpi::HomeworkControl),
            Self::AtRiskIntervention => Some(Kpi::AtRiskIntervention),
            Self::SuccessScore => Some(Kpi::AverageSuccess),
            Self::Departure => None,
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "parent_feedback" => Ok(Self::ParentFeedback),
            "student_feedback" => Ok(Self::StudentFeedback),
            "homework_check" => Ok(Self::HomeworkCheck),
            "at_risk_intervention" => Ok(Self::AtRiskIntervention),
            "success_score" => Ok(Self::SuccessScore),
            "departure" => Ok(Self::Departure),
            other => Err(format!("unknown event kind `{other}`")),
        }
    }
}

/// One feedback, homework, intervention, success or departure event.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEventRecord {
    pub teacher_id: String,
    pub student_id: String,
    pub course_id: Option<String>,
    pub kind: EventKind,
    /// Per-event indicator in [0, 1]; absent for departures.
    pub value: Option<f64>,
    pub occurred_at: NaiveDate,
}

/// Teacher behavioral KPIs, in canonical column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kpi {
    ParentFeedback,
    StudentFeedback,
    HomeworkControl,
    AtRiskIntervention,
    AverageSuccess,
}

impl Kpi {
    pub const ALL: [Kpi; 5] = [
        Kpi::ParentFeedback,
        Kpi::StudentFeedback,
        Kpi::HomeworkControl,
        Kpi::AtRiskIntervention,
        Kpi::AverageSuccess,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            Self::ParentFeedback => "parent_feedback",
            Self::StudentFeedback => "student_feedback",
            Self::HomeworkControl => "homework_control",
            Self::AtRiskIntervention => "at_risk_intervention",
            Self::AverageSuccess => "average_success",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompensationRecord {
    pub teacher_id: String,
    pub month: Period,
    pub base_pay: f64,
    pub bonus: f64,
    pub total_compensation: f64,
    pub lesson_rate: f64,
    pub lesson_count: u32,
    pub targets_achieved: u8,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CoursePrice {
    pub course_id: String,
    pub monthly_price: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TeacherSalary {
    pub teacher_id: String,
    pub monthly_salary: f64,
}

/// One row per (teacher, month). Rates are in [0, 1], counts are non-negative.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeacherPeriodFeatures {
    pub teacher_id: String,
    pub period: Period,
    pub academic_year: i32,
    pub parent_feedback: Option<f64>,
    pub student_feedback: Option<f64>,
    pub homework_control: Option<f64>,
    pub at_risk_intervention: Option<f64>,
    pub average_success: Option<f64>,
    pub total_students: u32,
    pub students_lost: u32,
    pub loss_rate: f64,
    pub months_worked: u32,
    pub loss_normalized: f64,
    /// School-side loss: departed students' course revenue net of the salary
    /// share they carried.
    pub monetary_loss: Option<f64>,
    /// Teacher-side loss: the salary share the departed students carried.
    pub teacher_loss: Option<f64>,
    pub bonus: Option<f64>,
    pub total_compensation: Option<f64>,
    pub motivation: Option<f64>,
    pub mean_motivation: Option<f64>,
    pub targets_achieved: Option<bool>,
    pub kpi_target_ratio: Option<f64>,
    pub bonus_v1: Option<f64>,
    pub bonus_v2: Option<f64>,
    pub bonus_applied: Option<bool>,
    pub importance_parent_feedback: Option<f64>,
    pub importance_student_feedback: Option<f64>,
    pub importance_homework_control: Option<f64>,
    pub importance_at_risk_intervention: Option<f64>,
    pub importance_average_success: Option<f64>,
}

fn flag(value: Option<bool>) -> Option<f64> {
    value.map(|v| if v { 1.0 } else { 0.0 })
}

impl TeacherPeriodFeatures {
    pub const NUMERIC_COLUMNS: [&'static str; 27] = [
        "parent_feedback",
        "student_feedback",
        "homework_control",
        "at_risk_intervention",
        "average_success",
        "total_students",
        "students_lost",
        "loss_rate",
        "months_worked",
        "loss_normalized",
        "monetary_loss",
        "teacher_loss",
        "bonus",
        "total_compensation",
        "motivation",
        "mean_motivation",
        "targets_achieved",
        "kpi_target_ratio",
        "bonus_v1",
        "bonus_v2",
        "bonus_applied",
        "importance_parent_feedback",
        "importance_student_feedback",
        "importance_homework_control",
        "importance_at_risk_intervention",
        "importance_average_success",
        "academic_year",
    ];

    pub fn kpi(&self, kpi: Kpi) -> Option<f64> {
        match kpi {
            Kpi::ParentFeedback => self.parent_feedback,
            Kpi::StudentFeedback => self.student_feedback,
            Kpi::HomeworkControl => self.homework_control,
            Kpi::AtRiskIntervention => self.at_risk_intervention,
            Kpi::AverageSuccess => self.average_success,
        }
    }

    pub fn kpi_mut(&mut self, kpi: Kpi) -> &mut Option<f64> {
        match kpi {
            Kpi::ParentFeedback => &mut self.parent_feedback,
            Kpi::StudentFeedback => &mut self.student_feedback,
            Kpi::HomeworkControl => &mut self.homework_control,
            Kpi::AtRiskIntervention => &mut self.at_risk_intervention,
            Kpi::AverageSuccess => &mut self.average_success,
        }
    }

    pub fn importance_mut(&mut self, kpi: Kpi) -> &mut Option<f64> {
        match kpi {
            Kpi::ParentFeedback => &mut self.importance_parent_feedback,
            Kpi::StudentFeedback => &mut self.importance_student_feedback,
            Kpi::HomeworkControl => &mut self.importance_homework_control,
            Kpi::AtRiskIntervention => &mut self.importance_at_risk_intervention,
            Kpi::AverageSuccess => &mut self.importance_average_success,
        }
    }

    /// Numeric view of a named column. `None` means the column does not exist;
    /// `Some(None)` is a null cell.
    pub fn value(&self, column: &str) -> Option<Option<f64>> {
        let cell = match column {
            "parent_feedback" => self.parent_feedback,
            "student_feedback" => self.student_feedback,
            "homework_control" => self.homework_control,
            "at_risk_intervention" => self.at_risk_intervention,
            "average_success" => self.average_success,
            "total_students" => Some(f64::from(self.total_students)),
            "students_lost" => Some(f64::from(self.students_lost)),
            "loss_rate" => Some(self.loss_rate),
            "months_worked" => Some(f64::from(self.months_worked)),
            "loss_normalized" => Some(self.loss_normalized),
            "monetary_loss" => self.monetary_loss,
            "teacher_loss" => self.teacher_loss,
            "bonus" => self.bonus,
            "total_compensation" => self.total_compensation,
            "motivation" => self.motivation,
            "mean_motivation" => self.mean_motivation,
            "targets_achieved" => flag(self.targets_achieved),
            "kpi_target_ratio" => self.kpi_target_ratio,
            "bonus_v1" => self.bonus_v1,
            "bonus_v2" => self.bonus_v2,
            "bonus_applied" => flag(self.bonus_applied),
            "importance_parent_feedback" => self.importance_parent_feedback,
            "importance_student_feedback" => self.importance_student_feedback,
            "importance_homework_control" => self.importance_homework_control,
            "importance_at_risk_intervention" => self.importance_at_risk_intervention,
            "importance_average_success" => self.importance_average_success,
            "academic_year" => Some(f64::from(self.academic_year)),
            _ => return None,
        };
        Some(cell)
    }
}

/// The canonical feature table, sorted by (teacher_id, period).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    pub rows: Vec<TeacherPeriodFeatures>,
    /// Distinct students seen anywhere in the window.
    pub student_count: usize,
    /// Mean monthly price over the courses students were enrolled in.
    pub mean_course_price: Option<f64>,
    /// Distinct courses taught per teacher; each (teacher, course) pair is a group.
    pub teacher_groups: BTreeMap<String, usize>,
    /// Mean lesson rate over the window's compensation records.
    pub mean_lesson_rate: Option<f64>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Result<Vec<Option<f64>>> {
        if !TeacherPeriodFeatures::NUMERIC_COLUMNS.contains(&name) {
            return Err(PipelineError::schema(
                "feature table",
                format!("unknown column `{name}`"),
            ));
        }
        Ok(self
            .rows
            .iter()
            .map(|row| row.value(name).flatten())
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CohortLabel {
    Stable,
    Unstable,
    BestOfYear,
    BadOfYear,
    Neither,
}

impl fmt::Display for CohortLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stable => "Stable",
            Self::Unstable => "Unstable",
            Self::BestOfYear => "BestOfYear",
            Self::BadOfYear => "BadOfYear",
            Self::Neither => "Neither",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Higher,
    Lower,
    Equal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMethod {
    Exact,
    Asymptotic,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Computed(T),
    NotComputable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankTest {
    pub statistic: f64,
    pub p_value: f64,
    pub is_significant: bool,
    pub direction: Direction,
    pub method: TestMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignificanceResult {
    pub metric: String,
    pub scheme: String,
    pub cohort_a: CohortLabel,
    pub cohort_b: CohortLabel,
    pub n_a: usize,
    pub n_b: usize,
    pub test: Outcome<RankTest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortSummary {
    pub scheme: String,
    pub cohort: CohortLabel,
    pub metric: String,
    pub observations: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    pub observations: usize,
    pub iterations: usize,
    pub log_likelihood: f64,
    pub null_log_likelihood: f64,
    pub pseudo_r2: f64,
    pub treatment_std_err: f64,
    pub treatment_z: f64,
    pub treatment_p_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CausalEstimate {
    pub treatment_name: String,
    pub outcome_name: String,
    pub ate: f64,
    pub odds_ratio: f64,
    pub baseline_probability: f64,
    pub treated_probability: f64,
    pub absolute_probability_delta: f64,
    pub fit: FitSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Regression,
    Classification,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FitMetrics {
    Regression {
        r2: f64,
        mae: f64,
        rmse: f64,
    },
    Classification {
        accuracy: f64,
        precision: f64,
        recall: f64,
        f1: f64,
        roc_auc: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureImportance {
    pub feature: String,
    pub attribution: f64,
    pub impurity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub teacher_id: String,
    pub period: Period,
    pub actual: f64,
    pub predicted: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributionResult {
    pub model_target: String,
    pub kind: TargetKind,
    pub train_rows: usize,
    pub test_rows: usize,
    pub metrics: FitMetrics,
    /// Sorted by descending attribution; attributions sum to one.
    pub feature_importance: Vec<FeatureImportance>,
    pub predictions: Vec<Prediction>,
}
