use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::models::{CompensationRecord, CoursePrice, EventKind, RawEventRecord, TeacherSalary};

/// Rows that survived validation plus the number that were dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<T> {
    pub records: Vec<T>,
    pub rejected: usize,
}

#[derive(Debug, Deserialize)]
pub struct EventRow {
    #[serde(default)]
    pub source_key: Option<String>,
    pub teacher_id: String,
    pub student_id: String,
    #[serde(default)]
    pub course_id: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub value: Option<f64>,
    pub occurred_at: String,
}

const EVENT_COLUMNS: [&str; 4] = ["teacher_id", "student_id", "kind", "occurred_at"];
const COMPENSATION_COLUMNS: [&str; 8] = [
    "teacher_id",
    "month",
    "base_pay",
    "bonus",
    "total_compensation",
    "lesson_rate",
    "lesson_count",
    "targets_achieved",
];
const PRICE_COLUMNS: [&str; 2] = ["course_id", "monthly_price"];
const SALARY_COLUMNS: [&str; 2] = ["teacher_id", "monthly_salary"];

fn read_rows<T, R>(source_name: &str, input: R, required: &[&str]) -> Result<Loaded<(usize, T)>>
where
    T: DeserializeOwned,
    R: Read,
{
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(input);
    let headers = reader.headers()?.clone();
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|column| !headers.iter().any(|h| h == *column))
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::schema(
            source_name,
            format!("missing columns: {}", missing.join(", ")),
        ));
    }

    let mut records = Vec::new();
    let mut rejected = 0usize;
    for (index, record) in reader.records().enumerate() {
        // header is line 1
        let line = index + 2;
        let parsed = record.and_then(|r| r.deserialize::<T>(Some(&headers)));
        match parsed {
            Ok(row) => records.push((line, row)),
            Err(err) => {
                warn!(source = source_name, line, error = %err, "dropping malformed row");
                rejected += 1;
            }
        }
    }

    Ok(Loaded { records, rejected })
}

pub fn validate_event(line: usize, row: EventRow) -> Result<RawEventRecord> {
    let quality = |reason: String| PipelineError::DataQuality { line, reason };

    if row.teacher_id.is_empty() || row.student_id.is_empty() {
        return Err(quality("teacher_id and student_id are required".into()));
    }
    let kind: EventKind = row.kind.parse().map_err(quality)?;
    let occurred_at = NaiveDate::parse_from_str(&row.occurred_at, "%Y-%m-%d")
        .map_err(|err| quality(format!("occurred_at `{}`: {err}", row.occurred_at)))?;

    let value = match (kind, row.value) {
        (EventKind::Departure, _) => None,
        (_, None) => return Err(quality(format!("{} event without a value", kind.as_str()))),
        (_, Some(v)) if !(0.0..=1.0).contains(&v) => {
            return Err(quality(format!("value {v} outside [0, 1]")))
        }
        (_, Some(v)) => Some(v),
    };

    Ok(RawEventRecord {
        teacher_id: row.teacher_id,
        student_id: row.student_id,
        course_id: row.course_id.filter(|c| !c.is_empty()),
        kind,
        value,
        occurred_at,
    })
}

/// A validated event with the key that makes re-imports idempotent.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedEvent {
    pub source_key: String,
    pub event: RawEventRecord,
}

/// Key for rows that do not carry one: identical events collapse to one key.
fn derived_key(event: &RawEventRecord) -> String {
    format!(
        "import-{}-{}-{}-{}-{}-{}",
        event.teacher_id,
        event.student_id,
        event.course_id.as_deref().unwrap_or_default(),
        event.kind.as_str(),
        event.occurred_at,
        event.value.map(|v| v.to_string()).unwrap_or_default()
    )
}

pub fn read_keyed_events<R: Read>(source_name: &str, input: R) -> Result<Loaded<KeyedEvent>> {
    let rows = read_rows::<EventRow, _>(source_name, input, &EVENT_COLUMNS)?;
    let mut rejected = rows.rejected;
    let mut records = Vec::with_capacity(rows.records.len());
    for (line, mut row) in rows.records {
        let key = row.source_key.take().filter(|k| !k.is_empty());
        match validate_event(line, row) {
            Ok(event) => records.push(KeyedEvent {
                source_key: key.unwrap_or_else(|| derived_key(&event)),
                event,
            }),
            Err(err) => {
                warn!(source = source_name, "{err}");
                rejected += 1;
            }
        }
    }
    info!(source = source_name, accepted = records.len(), rejected, "events loaded");
    Ok(Loaded { records, rejected })
}

pub fn read_events<R: Read>(source_name: &str, input: R) -> Result<Loaded<RawEventRecord>> {
    let keyed = read_keyed_events(source_name, input)?;
    Ok(Loaded {
        records: keyed.records.into_iter().map(|k| k.event).collect(),
        rejected: keyed.rejected,
    })
}

pub fn load_keyed_events(path: &Path) -> Result<Loaded<KeyedEvent>> {
    let file = std::fs::File::open(path)?;
    read_keyed_events(&path.display().to_string(), file)
}

pub fn load_events(path: &Path) -> Result<Loaded<RawEventRecord>> {
    let file = std::fs::File::open(path)?;
    read_events(&path.display().to_string(), file)
}

pub fn read_compensation<R: Read>(
    source_name: &str,
    input: R,
) -> Result<Loaded<CompensationRecord>> {
    let rows = read_rows::<CompensationRecord, _>(source_name, input, &COMPENSATION_COLUMNS)?;
    let mut rejected = rows.rejected;
    let mut records = Vec::with_capacity(rows.records.len());
    let mut seen = HashSet::new();
    for (line, row) in rows.records {
        let amounts = [row.base_pay, row.bonus, row.total_compensation, row.lesson_rate];
        if amounts.iter().any(|v| !v.is_finite() || *v < 0.0) || row.targets_achieved > 1 {
            warn!(source = source_name, line, "dropping compensation row with invalid amounts");
            rejected += 1;
            continue;
        }
        // first row wins for a (teacher, month)
        if !seen.insert((row.teacher_id.clone(), row.month)) {
            let err = PipelineError::DataQuality {
                line,
                reason: format!("duplicate compensation for {} in {}", row.teacher_id, row.month),
            };
            warn!(source = source_name, "{err}");
            rejected += 1;
            continue;
        }
        records.push(row);
    }
    Ok(Loaded { records, rejected })
}

pub fn load_compensation(path: &Path) -> Result<Loaded<CompensationRecord>> {
    let file = std::fs::File::open(path)?;
    read_compensation(&path.display().to_string(), file)
}

pub fn read_prices<R: Read>(source_name: &str, input: R) -> Result<Loaded<CoursePrice>> {
    let rows = read_rows::<CoursePrice, _>(source_name, input, &PRICE_COLUMNS)?;
    let mut rejected = rows.rejected;
    let mut records = Vec::new();
    for (line, row) in rows.records {
        if row.monthly_price.is_finite() && row.monthly_price >= 0.0 {
            records.push(row);
        } else {
            warn!(source = source_name, line, "dropping negative course price");
            rejected += 1;
        }
    }
    Ok(Loaded { records, rejected })
}

pub fn load_prices(path: &Path) -> Result<Loaded<CoursePrice>> {
    let file = std::fs::File::open(path)?;
    read_prices(&path.display().to_string(), file)
}

pub fn read_salaries<R: Read>(source_name: &str, input: R) -> Result<Loaded<TeacherSalary>> {
    let rows = read_rows::<TeacherSalary, _>(source_name, input, &SALARY_COLUMNS)?;
    let mut rejected = rows.rejected;
    let mut records = Vec::new();
    for (line, row) in rows.records {
        if row.monthly_salary.is_finite() && row.monthly_salary >= 0.0 {
            records.push(row);
        } else {
            warn!(source = source_name, line, "dropping negative salary");
            rejected += 1;
        }
    }
    Ok(Loaded { records, rejected })
}

pub fn load_salaries(path: &Path) -> Result<Loaded<TeacherSalary>> {
    let file = std::fs::File::open(path)?;
    read_salaries(&path.display().to_string(), file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_malformed_event_rows_and_keeps_the_rest() {
        let csv = "\
teacher_id,student_id,course_id,kind,value,occurred_at
t-1,s-1,c-1,parent_feedback,0.8,2023-09-04
t-1,s-2,c-1,homework_check,1.4,2023-09-05
t-1,s-3,,departure,,2023-09-20
t-2,s-4,c-2,teleport,0.5,2023-09-06
t-2,s-5,c-2,success_score,abc,2023-09-06
t-2,s-6,c-2,success_score,0.7,2023-02-30
";
        let loaded = read_events("events.csv", csv.as_bytes()).unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.rejected, 4);
        assert_eq!(loaded.records[1].kind, EventKind::Departure);
        assert_eq!(loaded.records[1].course_id, None);
    }

    #[test]
    fn rows_without_a_source_key_get_a_stable_one() {
        let csv = "\
source_key,teacher_id,student_id,course_id,kind,value,occurred_at
ev-1,t-1,s-1,c-1,parent_feedback,0.8,2023-09-04
,t-1,s-2,c-1,homework_check,0.5,2023-09-05
";
        let first = read_keyed_events("events.csv", csv.as_bytes()).unwrap();
        let second = read_keyed_events("events.csv", csv.as_bytes()).unwrap();
        assert_eq!(first.records[0].source_key, "ev-1");
        assert_eq!(
            first.records[1].source_key,
            "import-t-1-s-2-c-1-homework_check-2023-09-05-0.5"
        );
        assert_eq!(first, second);
    }

    #[test]
    fn events_differing_only_by_course_keep_distinct_keys() {
        let csv = "\
teacher_id,student_id,course_id,kind,value,occurred_at
t-1,s-1,c-1,departure,,2023-09-20
t-1,s-1,c-2,departure,,2023-09-20
";
        let loaded = read_keyed_events("events.csv", csv.as_bytes()).unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_ne!(loaded.records[0].source_key, loaded.records[1].source_key);
    }

    #[test]
    fn missing_required_column_is_fatal() {
        let csv = "teacher_id,kind,occurred_at\nt-1,departure,2023-09-01\n";
        let err = read_events("events.csv", csv.as_bytes()).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("student_id"));
    }

    #[test]
    fn reads_reference_tables() {
        let prices = "course_id,monthly_price\nc-1,120.0\nc-2,-5\n";
        let loaded = read_prices("prices.csv", prices.as_bytes()).unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.rejected, 1);

        let comp = "\
teacher_id,month,base_pay,bonus,total_compensation,lesson_rate,lesson_count,targets_achieved
t-1,2023-09,800,100,900,25,36,1
t-1,2023-13,800,100,900,25,36,1
";
        let loaded = read_compensation("compensation.csv", comp.as_bytes()).unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.rejected, 1);
        assert_eq!(loaded.records[0].month.to_string(), "2023-09");
    }

    #[test]
    fn duplicate_compensation_months_keep_the_first_row() {
        let comp = "\
teacher_id,month,base_pay,bonus,total_compensation,lesson_rate,lesson_count,targets_achieved
t-1,2023-09,800,100,900,25,36,1
t-1,2023-09,800,0,800,25,36,0
t-2,2023-09,800,0,800,25,36,0
";
        let loaded = read_compensation("compensation.csv", comp.as_bytes()).unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.rejected, 1);
        assert_eq!(loaded.records[0].bonus, 100.0);
        assert_eq!(loaded.records[1].teacher_id, "t-2");
    }
}
