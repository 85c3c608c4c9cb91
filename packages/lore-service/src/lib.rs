pub mod indexing;
pub mod insights;
pub mod search;
pub mod store;

mod error;

pub use error::{Error, Result};
pub use indexing::{IndexReport, MemoryIndexer};
pub use insights::{
	AsyncInsightProcessor, InsightCandidate, JobView, ProcessorSettings, ProcessorState,
	RetryOutcome, RetryReport, RunOutcome, RunReport, SkippedRun,
};
pub use search::{
	ContentSearchStrategy, DiversityLimits, EmbeddingSpace, HybridSearchEngine, MemoryFilter,
	OverlapBoost, ResultCombiner, ScoredMemory, SearchMode, SearchOptions, SearchResponse,
	SearchResult, SearchScores, SearchStats, SearchWeights, StrategyOptions, TagSearchStrategy,
};

use std::{future::Future, pin::Pin, sync::Arc};

use serde_json::Value;
use time::Duration;

use lore_config::{EmbeddingProviderConfig, LlmProviderConfig};
use lore_domain::{Cluster, Memory};
use lore_providers::{embedding, insight};
use lore_storage::models::{NewInsight, ProcessingJob};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait EmbeddingProvider
where
	Self: Send + Sync,
{
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>>>;
}

/// Produces insight candidates for a single memory or a cluster of related memories.
pub trait InsightGenerator
where
	Self: Send + Sync,
{
	fn generate_for_memory<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		memory: &'a Memory,
	) -> BoxFuture<'a, Result<Vec<InsightCandidate>>>;

	fn generate_for_cluster<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		cluster: &'a Cluster,
	) -> BoxFuture<'a, Result<Vec<InsightCandidate>>>;
}

/// Vector similarity lookups over one embedding column.
pub trait MemoryIndex
where
	Self: Send + Sync,
{
	fn search_by_embedding<'a>(
		&'a self,
		space: EmbeddingSpace,
		vector: &'a [f32],
		filter: &'a MemoryFilter,
	) -> BoxFuture<'a, Result<Vec<ScoredMemory>>>;
}

pub trait AnalyticsSink
where
	Self: Send + Sync,
{
	fn record<'a>(&'a self, stats: &'a SearchStats) -> BoxFuture<'a, Result<()>>;
}

/// Persistence used by the insight pipeline: job rows, insight rows, processing markers and
/// retry jobs.
pub trait InsightStore
where
	Self: Send + Sync,
{
	/// Ready memories without a processing marker, by importance then recency.
	fn fetch_unprocessed<'a>(&'a self, limit: u32) -> BoxFuture<'a, Result<Vec<Memory>>>;

	fn fetch_memory<'a>(&'a self, memory_id: i64) -> BoxFuture<'a, Result<Option<Memory>>>;

	/// Creates a `batch_memory_processing` job in `processing` state.
	fn start_job<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, Result<i64>>;

	fn update_progress<'a>(
		&'a self,
		job_id: i64,
		source_ids: Option<&'a [i64]>,
		payload: &'a Value,
	) -> BoxFuture<'a, Result<()>>;

	fn finish_job<'a>(
		&'a self,
		job_id: i64,
		status: &'a str,
		payload: &'a Value,
		error_message: Option<&'a str>,
	) -> BoxFuture<'a, Result<()>>;

	fn fetch_job<'a>(&'a self, job_id: i64) -> BoxFuture<'a, Result<Option<ProcessingJob>>>;

	/// Saves `insights` and writes a processing marker for every memory in `sources`, all or
	/// nothing.
	fn save_insights<'a>(
		&'a self,
		insights: &'a [NewInsight],
		sources: &'a [Memory],
	) -> BoxFuture<'a, Result<()>>;

	fn has_processing_marker<'a>(&'a self, memory_id: i64) -> BoxFuture<'a, Result<bool>>;

	/// Enqueues a `memory_retry` job for a memory whose processing failed. An open retry for the
	/// same memory is reused.
	fn record_retry<'a>(&'a self, memory_id: i64, error: &'a str) -> BoxFuture<'a, Result<i64>>;

	fn claim_retries<'a>(
		&'a self,
		limit: u32,
		lease: Duration,
	) -> BoxFuture<'a, Result<Vec<ProcessingJob>>>;

	fn complete_retry<'a>(&'a self, job_id: i64) -> BoxFuture<'a, Result<()>>;

	fn reschedule_retry<'a>(
		&'a self,
		job_id: i64,
		error: &'a str,
		delay: Duration,
		terminal: bool,
	) -> BoxFuture<'a, Result<()>>;
}

/// Memories waiting for embeddings.
pub trait EmbeddingQueue
where
	Self: Send + Sync,
{
	fn claim_pending<'a>(
		&'a self,
		limit: u32,
		max_attempts: u32,
		lease: Duration,
	) -> BoxFuture<'a, Result<Vec<Memory>>>;

	fn store_embeddings<'a>(
		&'a self,
		memory_id: i64,
		content: &'a [f32],
		tags: Option<&'a [f32]>,
	) -> BoxFuture<'a, Result<()>>;

	fn record_failure<'a>(
		&'a self,
		memory_id: i64,
		error: &'a str,
		max_attempts: u32,
	) -> BoxFuture<'a, Result<()>>;
}

#[derive(Clone)]
pub struct Providers {
	pub embedding: Arc<dyn EmbeddingProvider>,
	pub insights: Arc<dyn InsightGenerator>,
}
impl Providers {
	pub fn new(embedding: Arc<dyn EmbeddingProvider>, insights: Arc<dyn InsightGenerator>) -> Self {
		Self { embedding, insights }
	}
}
impl Default for Providers {
	fn default() -> Self {
		let provider = Arc::new(DefaultProviders);

		Self { embedding: provider.clone(), insights: provider }
	}
}

struct DefaultProviders;
impl EmbeddingProvider for DefaultProviders {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, Result<Vec<Vec<f32>>>> {
		Box::pin(async move { embedding::embed(cfg, texts).await.map_err(Error::from) })
	}
}
impl InsightGenerator for DefaultProviders {
	fn generate_for_memory<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		memory: &'a Memory,
	) -> BoxFuture<'a, Result<Vec<InsightCandidate>>> {
		Box::pin(async move {
			let messages = insights::memory_messages(memory);
			let json = insight::complete_json(cfg, &messages).await?;

			insights::parse_candidates(json)
		})
	}

	fn generate_for_cluster<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		cluster: &'a Cluster,
	) -> BoxFuture<'a, Result<Vec<InsightCandidate>>> {
		Box::pin(async move {
			let messages = insights::cluster_messages(cluster);
			let json = insight::complete_json(cfg, &messages).await?;

			insights::parse_candidates(json)
		})
	}
}

pub(crate) fn vector_to_pg(vec: &[f32]) -> String {
	let mut out = String::with_capacity(vec.len() * 8);

	out.push('[');

	for (i, value) in vec.iter().enumerate() {
		if i > 0 {
			out.push(',');
		}

		out.push_str(&value.to_string());
	}

	out.push(']');

	out
}

pub(crate) fn parse_pg_vector(text: &str) -> Result<Vec<f32>> {
	let trimmed = text.trim();
	let without_brackets =
		trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')).ok_or_else(|| {
			Error::Storage { message: "Vector text is not bracketed.".to_string() }
		})?;

	if without_brackets.trim().is_empty() {
		return Ok(Vec::new());
	}

	let mut vec = Vec::new();

	for part in without_brackets.split(',') {
		let value: f32 = part.trim().parse().map_err(|_| Error::Storage {
			message: "Vector text contains a non-numeric value.".to_string(),
		})?;

		vec.push(value);
	}

	Ok(vec)
}
