use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::{
	Error, Result,
	db::Db,
	models::{
		JOB_COMPLETED, JOB_FAILED, JOB_PENDING, JOB_PROCESSING, ProcessingJob, TASK_MEMORY_RETRY,
	},
};

const JOB_COLUMNS: &str = "\
	id,
	task_type,
	source_ids,
	status,
	payload,
	attempts,
	error_message,
	available_at,
	created_at,
	started_at,
	completed_at";

pub async fn create_job(
	db: &Db,
	task_type: &str,
	source_ids: &[i64],
	status: &str,
	payload: &Value,
	now: OffsetDateTime,
) -> Result<i64> {
	let started_at = (status == JOB_PROCESSING).then_some(now);
	let id = sqlx::query_scalar::<_, i64>(
		"\
INSERT INTO processing_jobs (
	task_type,
	source_ids,
	status,
	payload,
	available_at,
	created_at,
	started_at
)
VALUES ($1,$2,$3,$4,$5,$5,$6)
RETURNING id",
	)
	.bind(task_type)
	.bind(source_ids)
	.bind(status)
	.bind(payload)
	.bind(now)
	.bind(started_at)
	.fetch_one(&db.pool)
	.await?;

	Ok(id)
}

pub async fn fetch_job(db: &Db, id: i64) -> Result<Option<ProcessingJob>> {
	let sql = format!("SELECT {JOB_COLUMNS} FROM processing_jobs WHERE id = $1");
	let job = sqlx::query_as::<_, ProcessingJob>(&sql).bind(id).fetch_optional(&db.pool).await?;

	Ok(job)
}

pub async fn update_progress(
	db: &Db,
	id: i64,
	source_ids: Option<&[i64]>,
	payload: &Value,
) -> Result<()> {
	let result = sqlx::query(
		"\
UPDATE processing_jobs
SET source_ids = COALESCE($2, source_ids),
	payload = $3
WHERE id = $1",
	)
	.bind(id)
	.bind(source_ids)
	.bind(payload)
	.execute(&db.pool)
	.await?;

	ensure_updated(result.rows_affected(), id)
}

/// Writes the terminal status for a job. `status` must be `completed` or `failed`.
pub async fn finish_job(
	db: &Db,
	id: i64,
	status: &str,
	payload: &Value,
	error_message: Option<&str>,
	now: OffsetDateTime,
) -> Result<()> {
	if status != JOB_COMPLETED && status != JOB_FAILED {
		return Err(Error::InvalidArgument(format!("Job status {status:?} is not terminal.")));
	}

	let result = sqlx::query(
		"\
UPDATE processing_jobs
SET status = $2,
	payload = $3,
	error_message = $4,
	completed_at = $5
WHERE id = $1",
	)
	.bind(id)
	.bind(status)
	.bind(payload)
	.bind(error_message)
	.bind(now)
	.execute(&db.pool)
	.await?;

	ensure_updated(result.rows_affected(), id)
}

/// Enqueues a `memory_retry` job unless one is already `pending` or `processing` for the memory.
/// Returns the id of the queued job, new or existing.
pub async fn enqueue_retry(
	db: &Db,
	memory_id: i64,
	error_message: &str,
	now: OffsetDateTime,
) -> Result<i64> {
	let payload = serde_json::json!({ "memory_id": memory_id, "error": error_message });
	let id = sqlx::query_scalar::<_, i64>(
		"\
WITH queued AS (
	SELECT id
	FROM processing_jobs
	WHERE task_type = $1
		AND source_ids = $2
		AND status IN ('pending', 'processing')
	ORDER BY id ASC
	LIMIT 1
),
inserted AS (
	INSERT INTO processing_jobs (
		task_type,
		source_ids,
		status,
		payload,
		error_message,
		available_at,
		created_at
	)
	SELECT $1,$2,$3,$4,$5,$6,$6
	WHERE NOT EXISTS (SELECT 1 FROM queued)
	RETURNING id
)
SELECT id FROM inserted
UNION ALL
SELECT id FROM queued",
	)
	.bind(TASK_MEMORY_RETRY)
	.bind(vec![memory_id])
	.bind(JOB_PENDING)
	.bind(&payload)
	.bind(error_message)
	.bind(now)
	.fetch_one(&db.pool)
	.await?;

	Ok(id)
}

/// Claims due retry jobs. A claimed row stays `processing` until `lease` expires, after which it
/// can be claimed again.
pub async fn claim_retry_jobs(
	db: &Db,
	limit: u32,
	lease: Duration,
	now: OffsetDateTime,
) -> Result<Vec<ProcessingJob>> {
	let mut tx = db.pool.begin().await?;
	let sql = format!(
		"\
SELECT {JOB_COLUMNS}
FROM processing_jobs
WHERE task_type = $1
	AND status IN ('pending', 'processing')
	AND available_at <= $2
ORDER BY available_at ASC
LIMIT $3
FOR UPDATE SKIP LOCKED"
	);
	let mut jobs = sqlx::query_as::<_, ProcessingJob>(&sql)
		.bind(TASK_MEMORY_RETRY)
		.bind(now)
		.bind(i64::from(limit))
		.fetch_all(&mut *tx)
		.await?;

	if !jobs.is_empty() {
		let lease_until = now + lease;
		let ids: Vec<i64> = jobs.iter().map(|job| job.id).collect();

		sqlx::query(
			"\
UPDATE processing_jobs
SET status = 'processing',
	started_at = $1,
	available_at = $2
WHERE id = ANY($3)",
		)
		.bind(now)
		.bind(lease_until)
		.bind(&ids)
		.execute(&mut *tx)
		.await?;

		for job in &mut jobs {
			job.status = JOB_PROCESSING.to_string();
			job.started_at = Some(now);
			job.available_at = lease_until;
		}
	}

	tx.commit().await?;

	Ok(jobs)
}

pub async fn complete_retry(db: &Db, id: i64, now: OffsetDateTime) -> Result<()> {
	let result = sqlx::query(
		"\
UPDATE processing_jobs
SET status = 'completed',
	attempts = attempts + 1,
	error_message = NULL,
	completed_at = $2
WHERE id = $1",
	)
	.bind(id)
	.bind(now)
	.execute(&db.pool)
	.await?;

	ensure_updated(result.rows_affected(), id)
}

/// Records a failed retry attempt. The job returns to `pending` at `available_at`, or becomes
/// `failed` when `terminal` is set.
pub async fn reschedule_retry(
	db: &Db,
	id: i64,
	error_message: &str,
	available_at: OffsetDateTime,
	terminal: bool,
	now: OffsetDateTime,
) -> Result<()> {
	let status = if terminal { JOB_FAILED } else { JOB_PENDING };
	let completed_at = terminal.then_some(now);
	let result = sqlx::query(
		"\
UPDATE processing_jobs
SET status = $2,
	attempts = attempts + 1,
	error_message = $3,
	available_at = $4,
	completed_at = $5
WHERE id = $1",
	)
	.bind(id)
	.bind(status)
	.bind(error_message)
	.bind(available_at)
	.bind(completed_at)
	.execute(&db.pool)
	.await?;

	ensure_updated(result.rows_affected(), id)
}

fn ensure_updated(rows_affected: u64, id: i64) -> Result<()> {
	if rows_affected == 0 {
		return Err(Error::NotFound(format!("Processing job {id} does not exist.")));
	}

	Ok(())
}
