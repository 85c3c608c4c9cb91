use crate::{Result, db::Db, models::SearchAnalyticsRecord};

pub async fn insert_search_analytics(db: &Db, record: &SearchAnalyticsRecord) -> Result<()> {
	sqlx::query(
		"\
INSERT INTO search_analytics (
	query,
	search_mode,
	content_weight,
	tag_weight,
	result_count,
	avg_similarity,
	latency_ms,
	created_at
)
VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
	)
	.bind(record.query.as_str())
	.bind(record.search_mode.as_str())
	.bind(record.content_weight)
	.bind(record.tag_weight)
	.bind(record.result_count)
	.bind(record.avg_similarity)
	.bind(record.latency_ms)
	.bind(record.created_at)
	.execute(&db.pool)
	.await?;

	Ok(())
}
