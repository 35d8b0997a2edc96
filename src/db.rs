use std::path::Path;

use anyhow::Context;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::features::{ObservationWindow, ReferenceData};
use crate::ingest::{self, KeyedEvent};
use crate::models::{
    CompensationRecord, CoursePrice, EventKind, Period, RawEventRecord, TeacherSalary,
};
use crate::synthetic::{self, SyntheticOptions};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Inserts one event; returns false when its source key is already present.
async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    keyed: &KeyedEvent,
) -> anyhow::Result<bool> {
    let event = &keyed.event;
    let result = sqlx::query(
        r#"
        INSERT INTO churn_impact.teacher_events
        (id, source_key, teacher_id, student_id, course_id, kind, value, occurred_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&keyed.source_key)
    .bind(&event.teacher_id)
    .bind(&event.student_id)
    .bind(&event.course_id)
    .bind(event.kind.as_str())
    .bind(event.value)
    .bind(event.occurred_at)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn upsert_reference(
    tx: &mut Transaction<'_, Postgres>,
    reference: &ReferenceData,
) -> anyhow::Result<()> {
    for price in &reference.prices {
        sqlx::query(
            r#"
            INSERT INTO churn_impact.course_prices (course_id, monthly_price)
            VALUES ($1, $2)
            ON CONFLICT (course_id) DO UPDATE SET monthly_price = EXCLUDED.monthly_price
            "#,
        )
        .bind(&price.course_id)
        .bind(price.monthly_price)
        .execute(&mut **tx)
        .await?;
    }

    for salary in &reference.salaries {
        sqlx::query(
            r#"
            INSERT INTO churn_impact.teacher_salaries (teacher_id, monthly_salary)
            VALUES ($1, $2)
            ON CONFLICT (teacher_id) DO UPDATE SET monthly_salary = EXCLUDED.monthly_salary
            "#,
        )
        .bind(&salary.teacher_id)
        .bind(salary.monthly_salary)
        .execute(&mut **tx)
        .await?;
    }

    for record in &reference.compensation {
        sqlx::query(
            r#"
            INSERT INTO churn_impact.teacher_compensation
            (teacher_id, month, base_pay, bonus, total_compensation,
             lesson_rate, lesson_count, targets_achieved)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (teacher_id, month) DO UPDATE
            SET base_pay = EXCLUDED.base_pay,
                bonus = EXCLUDED.bonus,
                total_compensation = EXCLUDED.total_compensation,
                lesson_rate = EXCLUDED.lesson_rate,
                lesson_count = EXCLUDED.lesson_count,
                targets_achieved = EXCLUDED.targets_achieved
            "#,
        )
        .bind(&record.teacher_id)
        .bind(record.month.to_string())
        .bind(record.base_pay)
        .bind(record.bonus)
        .bind(record.total_compensation)
        .bind(record.lesson_rate)
        .bind(i32::try_from(record.lesson_count).context("lesson_count out of range")?)
        .bind(i16::from(record.targets_achieved))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Loads the synthetic demo dataset. Keys are derived from the seed, so
/// seeding twice with the same options inserts nothing new.
pub async fn seed(pool: &PgPool, options: &SyntheticOptions) -> anyhow::Result<usize> {
    let data = synthetic::generate(options)?;
    let mut tx = pool.begin().await?;
    let mut inserted = 0usize;
    for (index, event) in data.events.into_iter().enumerate() {
        let keyed = KeyedEvent {
            source_key: format!("seed-{}-{index:06}", options.seed),
            event,
        };
        if insert_event(&mut tx, &keyed).await? {
            inserted += 1;
        }
    }
    upsert_reference(&mut tx, &data.reference).await?;
    tx.commit().await?;
    Ok(inserted)
}

/// Imports an events CSV. Returns (inserted, rejected).
pub async fn import_csv(pool: &PgPool, csv_path: &Path) -> anyhow::Result<(usize, usize)> {
    let loaded = ingest::load_keyed_events(csv_path)
        .with_context(|| format!("failed to read {}", csv_path.display()))?;
    let mut tx = pool.begin().await?;
    let mut inserted = 0usize;
    for keyed in &loaded.records {
        if insert_event(&mut tx, keyed).await? {
            inserted += 1;
        }
    }
    tx.commit().await?;
    info!(
        inserted,
        duplicates = loaded.records.len() - inserted,
        rejected = loaded.rejected,
        "events imported"
    );
    Ok((inserted, loaded.rejected))
}

pub async fn fetch_events(
    pool: &PgPool,
    window: &ObservationWindow,
) -> anyhow::Result<Vec<RawEventRecord>> {
    let rows = sqlx::query(
        "SELECT teacher_id, student_id, course_id, kind, value, occurred_at \
         FROM churn_impact.teacher_events \
         WHERE occurred_at >= $1 AND occurred_at <= $2 \
         ORDER BY teacher_id, occurred_at, source_key",
    )
    .bind(window.since)
    .bind(window.until)
    .fetch_all(pool)
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let kind: String = row.get("kind");
        let kind: EventKind = match kind.parse() {
            Ok(kind) => kind,
            Err(reason) => {
                warn!(%reason, "skipping stored event");
                continue;
            }
        };
        events.push(RawEventRecord {
            teacher_id: row.get("teacher_id"),
            student_id: row.get("student_id"),
            course_id: row.get("course_id"),
            kind,
            value: row.get("value"),
            occurred_at: row.get("occurred_at"),
        });
    }
    info!(events = events.len(), "events fetched");
    Ok(events)
}

pub async fn fetch_reference(pool: &PgPool) -> anyhow::Result<ReferenceData> {
    let prices = sqlx::query(
        "SELECT course_id, monthly_price FROM churn_impact.course_prices ORDER BY course_id",
    )
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| CoursePrice {
            course_id: row.get("course_id"),
            monthly_price: row.get("monthly_price"),
        })
        .collect();

    let salaries = sqlx::query(
        "SELECT teacher_id, monthly_salary FROM churn_impact.teacher_salaries ORDER BY teacher_id",
    )
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|row| TeacherSalary {
        teacher_id: row.get("teacher_id"),
        monthly_salary: row.get("monthly_salary"),
    })
    .collect();

    let rows = sqlx::query(
        "SELECT teacher_id, month, base_pay, bonus, total_compensation, lesson_rate, \
         lesson_count, targets_achieved \
         FROM churn_impact.teacher_compensation ORDER BY teacher_id, month",
    )
    .fetch_all(pool)
    .await?;
    let mut compensation = Vec::with_capacity(rows.len());
    for row in rows {
        let month: String = row.get("month");
        let lesson_count: i32 = row.get("lesson_count");
        let targets_achieved: i16 = row.get("targets_achieved");
        compensation.push(CompensationRecord {
            teacher_id: row.get("teacher_id"),
            month: month
                .parse::<Period>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("stored compensation month `{month}`"))?,
            base_pay: row.get("base_pay"),
            bonus: row.get("bonus"),
            total_compensation: row.get("total_compensation"),
            lesson_rate: row.get("lesson_rate"),
            lesson_count: u32::try_from(lesson_count).context("negative lesson_count")?,
            targets_achieved: u8::try_from(targets_achieved).context("invalid targets_achieved")?,
        });
    }

    Ok(ReferenceData {
        compensation,
        prices,
        salaries,
    })
}
