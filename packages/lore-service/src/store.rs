//! Postgres implementations of the collaborator traits on [`Db`].

use serde_json::Value;
use time::{Duration, OffsetDateTime};

use lore_domain::Memory;
use lore_storage::{
	analytics,
	db::Db,
	insights, jobs,
	memories::{self, EmbeddingColumn, SimilarityQuery},
	models::{
		JOB_PROCESSING, MemoryRow, NewInsight, ProcessingJob, SearchAnalyticsRecord,
		TASK_BATCH_MEMORY_PROCESSING,
	},
};

use crate::{
	AnalyticsSink, BoxFuture, EmbeddingQueue, Error, InsightStore, MemoryIndex, Result,
	search::{EmbeddingSpace, MemoryFilter, ScoredMemory, SearchStats},
};

/// Converts a storage row into a domain memory, parsing both embedding columns.
pub fn memory_from_row(row: MemoryRow) -> Result<Memory> {
	let content_embedding =
		row.content_embedding.as_deref().map(crate::parse_pg_vector).transpose()?;
	let tag_embedding = row.tag_embedding.as_deref().map(crate::parse_pg_vector).transpose()?;

	Ok(Memory {
		id: row.id,
		project_id: row.project_id,
		session_id: row.session_id,
		content: row.content,
		summary: row.summary,
		content_embedding,
		tag_embedding,
		smart_tags: row.smart_tags,
		memory_type: row.memory_type.parse()?,
		importance_score: row.importance_score,
		processing_status: row.processing_status.parse()?,
		created_at: row.created_at,
	})
}

fn memories_from_rows(rows: Vec<MemoryRow>) -> Result<Vec<Memory>> {
	rows.into_iter().map(memory_from_row).collect()
}

impl MemoryIndex for Db {
	fn search_by_embedding<'a>(
		&'a self,
		space: EmbeddingSpace,
		vector: &'a [f32],
		filter: &'a MemoryFilter,
	) -> BoxFuture<'a, Result<Vec<ScoredMemory>>> {
		Box::pin(search_memories(self, space, vector, filter))
	}
}

impl AnalyticsSink for Db {
	fn record<'a>(&'a self, stats: &'a SearchStats) -> BoxFuture<'a, Result<()>> {
		Box::pin(record_search(self, stats))
	}
}

impl InsightStore for Db {
	fn fetch_unprocessed<'a>(&'a self, limit: u32) -> BoxFuture<'a, Result<Vec<Memory>>> {
		Box::pin(fetch_unprocessed(self, limit))
	}

	fn fetch_memory<'a>(&'a self, memory_id: i64) -> BoxFuture<'a, Result<Option<Memory>>> {
		Box::pin(fetch_memory(self, memory_id))
	}

	fn start_job<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, Result<i64>> {
		Box::pin(async move {
			jobs::create_job(
				self,
				TASK_BATCH_MEMORY_PROCESSING,
				&[],
				JOB_PROCESSING,
				payload,
				OffsetDateTime::now_utc(),
			)
			.await
			.map_err(Error::from)
		})
	}

	fn update_progress<'a>(
		&'a self,
		job_id: i64,
		source_ids: Option<&'a [i64]>,
		payload: &'a Value,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			jobs::update_progress(self, job_id, source_ids, payload).await.map_err(Error::from)
		})
	}

	fn finish_job<'a>(
		&'a self,
		job_id: i64,
		status: &'a str,
		payload: &'a Value,
		error_message: Option<&'a str>,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			jobs::finish_job(self, job_id, status, payload, error_message, OffsetDateTime::now_utc())
				.await
				.map_err(Error::from)
		})
	}

	fn fetch_job<'a>(&'a self, job_id: i64) -> BoxFuture<'a, Result<Option<ProcessingJob>>> {
		Box::pin(async move { jobs::fetch_job(self, job_id).await.map_err(Error::from) })
	}

	fn save_insights<'a>(
		&'a self,
		records: &'a [NewInsight],
		sources: &'a [Memory],
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let sources: Vec<(i64, i64)> =
				sources.iter().map(|memory| (memory.id, memory.project_id)).collect();

			insights::insert_insights_and_mark(self, records, &sources, OffsetDateTime::now_utc())
				.await
				.map(|_| ())
				.map_err(Error::from)
		})
	}

	fn has_processing_marker<'a>(&'a self, memory_id: i64) -> BoxFuture<'a, Result<bool>> {
		Box::pin(async move {
			insights::has_processing_marker(self, memory_id).await.map_err(Error::from)
		})
	}

	fn record_retry<'a>(&'a self, memory_id: i64, error: &'a str) -> BoxFuture<'a, Result<i64>> {
		Box::pin(async move {
			jobs::enqueue_retry(self, memory_id, error, OffsetDateTime::now_utc())
				.await
				.map_err(Error::from)
		})
	}

	fn claim_retries<'a>(
		&'a self,
		limit: u32,
		lease: Duration,
	) -> BoxFuture<'a, Result<Vec<ProcessingJob>>> {
		Box::pin(async move {
			jobs::claim_retry_jobs(self, limit, lease, OffsetDateTime::now_utc())
				.await
				.map_err(Error::from)
		})
	}

	fn complete_retry<'a>(&'a self, job_id: i64) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			jobs::complete_retry(self, job_id, OffsetDateTime::now_utc()).await.map_err(Error::from)
		})
	}

	fn reschedule_retry<'a>(
		&'a self,
		job_id: i64,
		error: &'a str,
		delay: Duration,
		terminal: bool,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let now = OffsetDateTime::now_utc();

			jobs::reschedule_retry(self, job_id, error, now + delay, terminal, now)
				.await
				.map_err(Error::from)
		})
	}
}

impl EmbeddingQueue for Db {
	fn claim_pending<'a>(
		&'a self,
		limit: u32,
		max_attempts: u32,
		lease: Duration,
	) -> BoxFuture<'a, Result<Vec<Memory>>> {
		Box::pin(claim_pending(self, limit, max_attempts, lease))
	}

	fn store_embeddings<'a>(
		&'a self,
		memory_id: i64,
		content: &'a [f32],
		tags: Option<&'a [f32]>,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(store_embeddings(self, memory_id, content, tags))
	}

	fn record_failure<'a>(
		&'a self,
		memory_id: i64,
		error: &'a str,
		max_attempts: u32,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			memories::mark_embedding_failed(
				self,
				memory_id,
				error,
				max_attempts,
				OffsetDateTime::now_utc(),
			)
			.await
			.map_err(Error::from)
		})
	}
}

async fn search_memories(
	db: &Db,
	space: EmbeddingSpace,
	vector: &[f32],
	filter: &MemoryFilter,
) -> Result<Vec<ScoredMemory>> {
	let vector_text = crate::vector_to_pg(vector);
	let column = match space {
		EmbeddingSpace::Content => EmbeddingColumn::Content,
		EmbeddingSpace::Tags => EmbeddingColumn::Tags,
	};
	let query = SimilarityQuery {
		column,
		vector_text: vector_text.as_str(),
		project_id: filter.project_id,
		session_id: filter.session_id,
		memory_type: filter.memory_type.map(|memory_type| memory_type.as_str()),
		created_after: filter.created_after,
		exclude_failed: filter.exclude_failed,
		threshold: filter.threshold,
		limit: filter.limit,
	};
	let rows = memories::search_by_embedding(db, &query).await?;
	let mut out = Vec::with_capacity(rows.len());

	for row in rows {
		out.push(ScoredMemory { memory: memory_from_row(row.memory)?, similarity: row.similarity });
	}

	Ok(out)
}

async fn record_search(db: &Db, stats: &SearchStats) -> Result<()> {
	let record = SearchAnalyticsRecord {
		query: stats.query.clone(),
		search_mode: stats.search_mode.as_str().to_string(),
		content_weight: stats.content_weight,
		tag_weight: stats.tag_weight,
		result_count: i32::try_from(stats.result_count).unwrap_or(i32::MAX),
		avg_similarity: stats.avg_similarity,
		latency_ms: i64::try_from(stats.latency_ms).unwrap_or(i64::MAX),
		created_at: stats.created_at,
	};

	analytics::insert_search_analytics(db, &record).await?;

	Ok(())
}

async fn fetch_unprocessed(db: &Db, limit: u32) -> Result<Vec<Memory>> {
	let rows = memories::fetch_unprocessed(db, limit).await?;

	memories_from_rows(rows)
}

async fn fetch_memory(db: &Db, memory_id: i64) -> Result<Option<Memory>> {
	let row = memories::fetch_memory(db, memory_id).await?;

	row.map(memory_from_row).transpose()
}

async fn claim_pending(
	db: &Db,
	limit: u32,
	max_attempts: u32,
	lease: Duration,
) -> Result<Vec<Memory>> {
	let rows =
		memories::claim_for_embedding(db, limit, max_attempts, lease, OffsetDateTime::now_utc())
			.await?;

	memories_from_rows(rows)
}

async fn store_embeddings(
	db: &Db,
	memory_id: i64,
	content: &[f32],
	tags: Option<&[f32]>,
) -> Result<()> {
	let content_text = crate::vector_to_pg(content);
	let tag_text = tags.map(crate::vector_to_pg);

	memories::mark_embedded(
		db,
		memory_id,
		&content_text,
		tag_text.as_deref(),
		OffsetDateTime::now_utc(),
	)
	.await?;

	Ok(())
}
