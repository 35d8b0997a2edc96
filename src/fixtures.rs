use crate::models::{Period, TeacherPeriodFeatures};

/// A fully populated feature row with neutral values; tests override the
/// fields they care about.
pub fn feature_row(teacher: &str, year: i32, month: u32) -> TeacherPeriodFeatures {
    let period = Period::new(year, month).expect("valid month in fixture");
    TeacherPeriodFeatures {
        teacher_id: teacher.to_string(),
        period,
        academic_year: period.academic_year(8),
        parent_feedback: Some(0.8),
        student_feedback: Some(0.7),
        homework_control: Some(0.9),
        at_risk_intervention: Some(0.6),
        average_success: Some(0.75),
        total_students: 10,
        students_lost: 0,
        loss_rate: 0.0,
        months_worked: 1,
        loss_normalized: 0.0,
        monetary_loss: Some(0.0),
        teacher_loss: Some(0.0),
        bonus: Some(100.0),
        total_compensation: Some(1000.0),
        motivation: Some(0.1),
        mean_motivation: Some(0.1),
        targets_achieved: Some(false),
        kpi_target_ratio: Some(0.5),
        bonus_v1: Some(0.0),
        bonus_v2: Some(0.0),
        bonus_applied: Some(true),
        importance_parent_feedback: None,
        importance_student_feedback: None,
        importance_homework_control: None,
        importance_at_risk_intervention: None,
        importance_average_success: None,
    }
}
