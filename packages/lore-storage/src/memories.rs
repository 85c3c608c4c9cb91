use sqlx::{Executor, Postgres};
use time::{Duration, OffsetDateTime};

use crate::{
	Error, Result,
	db::Db,
	models::{MemoryRow, NewMemory, PROCESSING_MARKER_TYPE, ScoredMemoryRow},
};

const MEMORY_COLUMNS: &str = "\
	id,
	project_id,
	session_id,
	content,
	summary,
	content_embedding::text AS content_embedding,
	tag_embedding::text AS tag_embedding,
	smart_tags,
	memory_type,
	importance_score,
	processing_status,
	embedding_attempts,
	created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingColumn {
	Content,
	Tags,
}
impl EmbeddingColumn {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Content => "content_embedding",
			Self::Tags => "tag_embedding",
		}
	}
}

#[derive(Debug, Clone)]
pub struct SimilarityQuery<'a> {
	pub column: EmbeddingColumn,
	/// Query vector in pgvector text form.
	pub vector_text: &'a str,
	pub project_id: Option<i64>,
	pub session_id: Option<i64>,
	pub memory_type: Option<&'a str>,
	pub created_after: Option<OffsetDateTime>,
	pub exclude_failed: bool,
	pub threshold: f32,
	pub limit: u32,
}

pub async fn insert_memory(db: &Db, memory: &NewMemory) -> Result<i64> {
	let id = sqlx::query_scalar::<_, i64>(
		"\
INSERT INTO memories (
	project_id,
	session_id,
	content,
	summary,
	smart_tags,
	memory_type,
	importance_score,
	processing_status,
	created_at,
	updated_at
)
VALUES ($1,$2,$3,$4,$5,$6,$7,'pending',$8,$8)
RETURNING id",
	)
	.bind(memory.project_id)
	.bind(memory.session_id)
	.bind(memory.content.as_str())
	.bind(memory.summary.as_deref())
	.bind(&memory.smart_tags)
	.bind(memory.memory_type.as_str())
	.bind(memory.importance_score)
	.bind(memory.created_at)
	.fetch_one(&db.pool)
	.await?;

	Ok(id)
}

pub async fn fetch_memory(db: &Db, id: i64) -> Result<Option<MemoryRow>> {
	let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = $1");
	let row = sqlx::query_as::<_, MemoryRow>(&sql).bind(id).fetch_optional(&db.pool).await?;

	Ok(row)
}

/// Orders by similarity, then importance, then recency. Rows without the queried embedding never
/// match.
pub async fn search_by_embedding(
	db: &Db,
	query: &SimilarityQuery<'_>,
) -> Result<Vec<ScoredMemoryRow>> {
	if query.limit == 0 {
		return Err(Error::InvalidArgument("Similarity query limit must be positive.".to_string()));
	}

	let column = query.column.as_str();
	let sql = format!(
		"\
SELECT
	{MEMORY_COLUMNS},
	(1 - ({column} <=> $1::text::vector))::real AS similarity
FROM memories
WHERE {column} IS NOT NULL
	AND ($2::bigint IS NULL OR project_id = $2)
	AND ($3::bigint IS NULL OR session_id = $3)
	AND ($4::text IS NULL OR memory_type = $4)
	AND ($5::timestamptz IS NULL OR created_at >= $5)
	AND (NOT $6 OR processing_status NOT IN ('failed', 'failed_permanent'))
	AND (1 - ({column} <=> $1::text::vector)) >= $7
ORDER BY similarity DESC, importance_score DESC, created_at DESC
LIMIT $8"
	);
	let rows = sqlx::query_as::<_, ScoredMemoryRow>(&sql)
		.bind(query.vector_text)
		.bind(query.project_id)
		.bind(query.session_id)
		.bind(query.memory_type)
		.bind(query.created_after)
		.bind(query.exclude_failed)
		.bind(query.threshold)
		.bind(i64::from(query.limit))
		.fetch_all(&db.pool)
		.await?;

	Ok(rows)
}

/// Ready memories without a processing marker, most important and most recent first.
pub async fn fetch_unprocessed(db: &Db, limit: u32) -> Result<Vec<MemoryRow>> {
	let sql = format!(
		"\
SELECT {MEMORY_COLUMNS}
FROM memories m
WHERE m.processing_status = 'ready'
	AND m.content_embedding IS NOT NULL
	AND NOT EXISTS (
		SELECT 1
		FROM insights i
		WHERE i.insight_type = '{PROCESSING_MARKER_TYPE}'
			AND i.source_id = 'memory:' || m.id::text
	)
ORDER BY m.importance_score DESC, m.created_at DESC
LIMIT $1"
	);
	let rows = sqlx::query_as::<_, MemoryRow>(&sql)
		.bind(i64::from(limit))
		.fetch_all(&db.pool)
		.await?;

	Ok(rows)
}

/// Claims memories awaiting embeddings and moves them to `processing`.
///
/// Picks `pending` rows, `failed` rows below `max_attempts`, and `processing` rows whose claim is
/// older than `lease`.
pub async fn claim_for_embedding(
	db: &Db,
	limit: u32,
	max_attempts: u32,
	lease: Duration,
	now: OffsetDateTime,
) -> Result<Vec<MemoryRow>> {
	let mut tx = db.pool.begin().await?;
	let sql = format!(
		"\
SELECT {MEMORY_COLUMNS}
FROM memories
WHERE processing_status = 'pending'
	OR (processing_status = 'failed' AND embedding_attempts < $1)
	OR (processing_status = 'processing' AND updated_at <= $2)
ORDER BY created_at ASC
LIMIT $3
FOR UPDATE SKIP LOCKED"
	);
	let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
	let rows = sqlx::query_as::<_, MemoryRow>(&sql)
		.bind(max_attempts)
		.bind(now - lease)
		.bind(i64::from(limit))
		.fetch_all(&mut *tx)
		.await?;

	if !rows.is_empty() {
		let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();

		sqlx::query(
			"\
UPDATE memories
SET processing_status = 'processing',
	updated_at = $1
WHERE id = ANY($2)",
		)
		.bind(now)
		.bind(&ids)
		.execute(&mut *tx)
		.await?;
	}

	tx.commit().await?;

	Ok(rows)
}

/// Writes both embeddings and flips the row to `ready` in one statement.
pub async fn mark_embedded(
	db: &Db,
	id: i64,
	content_vector_text: &str,
	tag_vector_text: Option<&str>,
	now: OffsetDateTime,
) -> Result<()> {
	mark_embedded_exec(&db.pool, id, content_vector_text, tag_vector_text, now).await
}

pub async fn mark_embedding_failed(
	db: &Db,
	id: i64,
	error: &str,
	max_attempts: u32,
	now: OffsetDateTime,
) -> Result<()> {
	let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);

	sqlx::query(
		"\
UPDATE memories
SET embedding_attempts = embedding_attempts + 1,
	last_error = $2,
	processing_status = CASE
		WHEN embedding_attempts + 1 >= $3 THEN 'failed_permanent'
		ELSE 'failed'
	END,
	updated_at = $4
WHERE id = $1",
	)
	.bind(id)
	.bind(error)
	.bind(max_attempts)
	.bind(now)
	.execute(&db.pool)
	.await?;

	Ok(())
}

async fn mark_embedded_exec<'e, E>(
	executor: E,
	id: i64,
	content_vector_text: &str,
	tag_vector_text: Option<&str>,
	now: OffsetDateTime,
) -> Result<()>
where
	E: Executor<'e, Database = Postgres>,
{
	let result = sqlx::query(
		"\
UPDATE memories
SET content_embedding = $2::text::vector,
	tag_embedding = $3::text::vector,
	processing_status = 'ready',
	last_error = NULL,
	updated_at = $4
WHERE id = $1",
	)
	.bind(id)
	.bind(content_vector_text)
	.bind(tag_vector_text)
	.bind(now)
	.execute(executor)
	.await?;

	if result.rows_affected() == 0 {
		return Err(Error::NotFound(format!("Memory {id} does not exist.")));
	}

	Ok(())
}
