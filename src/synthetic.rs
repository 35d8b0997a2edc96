//! Reproducible demo dataset used by `seed` and by the pipeline tests.

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{PipelineError, Result};
use crate::features::{ObservationWindow, ReferenceData};
use crate::models::{
    CompensationRecord, CoursePrice, EventKind, Period, RawEventRecord, TeacherSalary,
};

const COURSES: [(&str, f64); 4] =
    [("c-01", 80.0), ("c-02", 100.0), ("c-03", 120.0), ("c-04", 150.0)];
const KPI_EVENTS: [EventKind; 5] = [
    EventKind::ParentFeedback,
    EventKind::StudentFeedback,
    EventKind::HomeworkCheck,
    EventKind::AtRiskIntervention,
    EventKind::SuccessScore,
];

#[derive(Debug, Clone)]
pub struct SyntheticOptions {
    pub teachers: usize,
    pub students_per_teacher: usize,
    pub first_month: Period,
    pub months: u32,
    pub seed: u64,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            teachers: 30,
            students_per_teacher: 12,
            first_month: Period { year: 2023, month: 9 },
            months: 10,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticData {
    pub events: Vec<RawEventRecord>,
    pub reference: ReferenceData,
    pub window: ObservationWindow,
}

fn nth_month(first: Period, offset: u32) -> Period {
    let index = first.month - 1 + offset;
    Period {
        year: first.year + (index / 12) as i32,
        month: index % 12 + 1,
    }
}

fn date(period: Period, day: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(period.year, period.month, day)
        .ok_or_else(|| PipelineError::Config(format!("invalid date {period}-{day:02}")))
}

struct Student {
    id: String,
    course: usize,
}

/// Teachers get a latent quality in [0.5, 1.0); KPI scores scatter around it
/// and better teachers lose fewer students and hit their targets more often.
pub fn generate(options: &SyntheticOptions) -> Result<SyntheticData> {
    if options.months == 0 {
        return Err(PipelineError::Config("synthetic data needs at least one month".into()));
    }
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut events = Vec::new();
    let mut compensation = Vec::new();
    let mut salaries = Vec::new();

    for t in 0..options.teachers {
        let teacher = format!("t-{t:03}");
        let quality: f64 = rng.random_range(0.5..1.0);
        salaries.push(TeacherSalary {
            teacher_id: teacher.clone(),
            monthly_salary: rng.random_range(1000.0..1600.0_f64).round(),
        });

        let mut enrolled = 0usize;
        let mut roster: Vec<Student> = Vec::new();
        for _ in 0..options.students_per_teacher {
            roster.push(Student {
                id: format!("{teacher}-s{enrolled:03}"),
                course: rng.random_range(0..COURSES.len()),
            });
            enrolled += 1;
        }

        for offset in 0..options.months {
            let period = nth_month(options.first_month, offset);
            let mut staying = Vec::with_capacity(roster.len());
            for student in roster {
                let course = Some(COURSES[student.course].0.to_string());
                for kind in KPI_EVENTS {
                    // at-risk interventions are not logged every month
                    if kind == EventKind::AtRiskIntervention && !rng.random_bool(0.6) {
                        continue;
                    }
                    let value = (quality + rng.random_range(-0.15..0.15)).clamp(0.0, 1.0);
                    events.push(RawEventRecord {
                        teacher_id: teacher.clone(),
                        student_id: student.id.clone(),
                        course_id: course.clone(),
                        kind,
                        value: Some(value),
                        occurred_at: date(period, rng.random_range(1..=28))?,
                    });
                }
                if rng.random_bool(0.05 * (1.25 - quality)) {
                    events.push(RawEventRecord {
                        teacher_id: teacher.clone(),
                        student_id: student.id.clone(),
                        course_id: course,
                        kind: EventKind::Departure,
                        value: None,
                        occurred_at: date(period, 20)?,
                    });
                } else {
                    staying.push(student);
                }
            }
            while staying.len() < options.students_per_teacher {
                staying.push(Student {
                    id: format!("{teacher}-s{enrolled:03}"),
                    course: rng.random_range(0..COURSES.len()),
                });
                enrolled += 1;
            }
            roster = staying;

            let base_pay = 800.0;
            let lesson_count = (options.students_per_teacher * 4) as u32;
            let achieved = rng.random_bool((quality - 0.4).clamp(0.0, 1.0));
            let bonus = if achieved {
                rng.random_range(50.0..250.0_f64).round()
            } else {
                0.0
            };
            compensation.push(CompensationRecord {
                teacher_id: teacher.clone(),
                month: period,
                base_pay,
                bonus,
                total_compensation: base_pay + bonus,
                lesson_rate: 25.0,
                lesson_count,
                targets_achieved: u8::from(achieved),
            });
        }
    }

    let last = nth_month(options.first_month, options.months - 1);
    let until = date(nth_month(last, 1), 1)?
        .pred_opt()
        .ok_or_else(|| PipelineError::Config("window end out of range".into()))?;
    let window = ObservationWindow {
        since: date(options.first_month, 1)?,
        until,
    };

    Ok(SyntheticData {
        events,
        reference: ReferenceData {
            compensation,
            prices: COURSES
                .iter()
                .map(|(id, price)| CoursePrice {
                    course_id: id.to_string(),
                    monthly_price: *price,
                })
                .collect(),
            salaries,
        },
        window,
    })
}
