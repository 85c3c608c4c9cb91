use sqlx::PgExecutor;
use time::OffsetDateTime;

use crate::{
	Error, Result,
	db::Db,
	models::{NewInsight, PROCESSING_MARKER_TYPE, processing_marker_source_id},
};

pub async fn insert_insight<'e, E>(
	executor: E,
	insight: &NewInsight,
	now: OffsetDateTime,
) -> Result<i64>
where
	E: PgExecutor<'e>,
{
	if insight.insight_type == PROCESSING_MARKER_TYPE {
		return Err(Error::InvalidArgument(
			"Processing markers must be written with insert_processing_marker.".to_string(),
		));
	}

	let id = sqlx::query_scalar::<_, i64>(
		"\
INSERT INTO insights (
	project_id,
	insight_type,
	title,
	content,
	confidence,
	tags,
	source_memory_ids,
	cluster_key,
	created_at
)
VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
RETURNING id",
	)
	.bind(insight.project_id)
	.bind(insight.insight_type.as_str())
	.bind(insight.title.as_str())
	.bind(insight.content.as_str())
	.bind(insight.confidence)
	.bind(&insight.tags)
	.bind(&insight.source_memory_ids)
	.bind(insight.cluster_key.as_deref())
	.bind(now)
	.fetch_one(executor)
	.await?;

	Ok(id)
}

/// Inserts the processing marker for a memory unless one exists. Returns whether a row was
/// written.
pub async fn insert_processing_marker<'e, E>(
	executor: E,
	memory_id: i64,
	project_id: i64,
	now: OffsetDateTime,
) -> Result<bool>
where
	E: PgExecutor<'e>,
{
	let result = sqlx::query(
		"\
INSERT INTO insights (
	project_id,
	insight_type,
	title,
	content,
	confidence,
	source_memory_ids,
	source_id,
	created_at
)
VALUES ($1,$2,'Processed memory','',1.0,$3,$4,$5)
ON CONFLICT (source_id) WHERE insight_type = 'processing_marker' DO NOTHING",
	)
	.bind(project_id)
	.bind(PROCESSING_MARKER_TYPE)
	.bind(vec![memory_id])
	.bind(processing_marker_source_id(memory_id))
	.bind(now)
	.execute(executor)
	.await?;

	Ok(result.rows_affected() == 1)
}

/// Inserts `insights` and a processing marker for every `(memory_id, project_id)` in `sources` in
/// one transaction. Nothing is written when any insert fails.
pub async fn insert_insights_and_mark(
	db: &Db,
	insights: &[NewInsight],
	sources: &[(i64, i64)],
	now: OffsetDateTime,
) -> Result<Vec<i64>> {
	let mut tx = db.pool.begin().await?;
	let mut ids = Vec::with_capacity(insights.len());

	for insight in insights {
		ids.push(insert_insight(&mut *tx, insight, now).await?);
	}
	for &(memory_id, project_id) in sources {
		insert_processing_marker(&mut *tx, memory_id, project_id, now).await?;
	}

	tx.commit().await?;

	Ok(ids)
}

pub async fn has_processing_marker(db: &Db, memory_id: i64) -> Result<bool> {
	let exists = sqlx::query_scalar::<_, bool>(
		"\
SELECT EXISTS (
	SELECT 1
	FROM insights
	WHERE insight_type = $1 AND source_id = $2
)",
	)
	.bind(PROCESSING_MARKER_TYPE)
	.bind(processing_marker_source_id(memory_id))
	.fetch_one(&db.pool)
	.await?;

	Ok(exists)
}
