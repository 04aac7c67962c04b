use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use std::str::FromStr;

use crate::models::detection::Detection;
use crate::models::frame::FrameJob;
use crate::models::job::{JobState, JobStatusRecord};

/// Rows per multi-row INSERT; keeps bind parameters well under Postgres' limit.
const DETECTION_BATCH: usize = 1_000;

/// Move the frame's status row to `processed`, creating it if needed.
///
/// Returns `false` when the row is already `processed`: another delivery of the
/// same frame committed first. A concurrent transaction on the same key blocks
/// on the unique index until the first one commits or rolls back.
pub async fn claim_processed(conn: &mut PgConnection, job: &FrameJob, attempt: i32) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO job_status (stream_id, sequence_number, job_id, state, attempt_count, processed_at, updated_at)
        VALUES ($1, $2, $3, 'processed', $4, NOW(), NOW())
        ON CONFLICT (stream_id, sequence_number) DO UPDATE
        SET state = 'processed',
            job_id = EXCLUDED.job_id,
            attempt_count = GREATEST(job_status.attempt_count, EXCLUDED.attempt_count),
            last_error = NULL,
            processed_at = NOW(),
            updated_at = NOW()
        WHERE job_status.state <> 'processed'
        RETURNING job_id
        "#,
    )
    .bind(&job.stream_id)
    .bind(job.sequence_number)
    .bind(&job.job_id)
    .bind(attempt)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.is_some())
}

/// Insert the frame's detections, indexed in model order.
pub async fn insert_detections(conn: &mut PgConnection, detections: &[Detection]) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;
    for (batch_no, batch) in detections.chunks(DETECTION_BATCH).enumerate() {
        let offset = batch_no * DETECTION_BATCH;
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO detections \
             (job_id, stream_id, sequence_number, detection_index, class_label, confidence, x_min, y_min, x_max, y_max) ",
        );
        builder.push_values(batch.iter().enumerate(), |mut b, (i, d)| {
            b.push_bind(&d.job_id)
                .push_bind(&d.stream_id)
                .push_bind(d.sequence_number)
                .push_bind((offset + i) as i32)
                .push_bind(&d.class_label)
                .push_bind(d.confidence)
                .push_bind(d.bounding_box.x_min)
                .push_bind(d.bounding_box.y_min)
                .push_bind(d.bounding_box.x_max)
                .push_bind(d.bounding_box.y_max);
        });
        inserted += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

/// Raise the stream's max processed sequence number; never lowers it.
pub async fn raise_stream_progress(conn: &mut PgConnection, stream_id: &str, sequence_number: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO stream_progress (stream_id, max_sequence_number, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (stream_id) DO UPDATE
        SET max_sequence_number = GREATEST(stream_progress.max_sequence_number, EXCLUDED.max_sequence_number),
            updated_at = NOW()
        "#,
    )
    .bind(stream_id)
    .bind(sequence_number)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Record a non-terminal or failed state. A `processed` row is never touched.
pub async fn record_attempt(
    pool: &PgPool,
    job: &FrameJob,
    state: JobState,
    attempt: i32,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO job_status (stream_id, sequence_number, job_id, state, attempt_count, last_error, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        ON CONFLICT (stream_id, sequence_number) DO UPDATE
        SET state = EXCLUDED.state,
            job_id = EXCLUDED.job_id,
            attempt_count = GREATEST(job_status.attempt_count, EXCLUDED.attempt_count),
            last_error = EXCLUDED.last_error,
            updated_at = NOW()
        WHERE job_status.state <> 'processed'
        "#,
    )
    .bind(&job.stream_id)
    .bind(job.sequence_number)
    .bind(&job.job_id)
    .bind(state.as_ref())
    .bind(attempt)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get the status row for a frame
pub async fn get_job_status(
    pool: &PgPool,
    stream_id: &str,
    sequence_number: i64,
) -> Result<Option<JobStatusRecord>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT job_id, stream_id, sequence_number, state, attempt_count, processed_at, last_error
        FROM job_status
        WHERE stream_id = $1 AND sequence_number = $2
        "#,
    )
    .bind(stream_id)
    .bind(sequence_number)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        let state: String = r.try_get("state")?;
        Ok(JobStatusRecord {
            job_id: r.try_get("job_id")?,
            stream_id: r.try_get("stream_id")?,
            sequence_number: r.try_get("sequence_number")?,
            state: JobState::from_str(&state).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            attempt_count: r.try_get("attempt_count")?,
            processed_at: r.try_get("processed_at")?,
            last_error: r.try_get("last_error")?,
        })
    })
    .transpose()
}

/// Count persisted detections for a frame
pub async fn count_detections(pool: &PgPool, stream_id: &str, sequence_number: i64) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS n
        FROM detections
        WHERE stream_id = $1 AND sequence_number = $2
        "#,
    )
    .bind(stream_id)
    .bind(sequence_number)
    .fetch_one(pool)
    .await?;

    row.try_get("n")
}

/// Highest processed sequence number recorded for a stream
pub async fn stream_max_sequence(pool: &PgPool, stream_id: &str) -> Result<Option<i64>, sqlx::Error> {
    let row = sqlx::query("SELECT max_sequence_number FROM stream_progress WHERE stream_id = $1")
        .bind(stream_id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| r.try_get("max_sequence_number")).transpose()
}
