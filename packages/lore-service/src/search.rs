mod combine;
mod strategy;

pub use combine::{DiversityLimits, OverlapBoost, ResultCombiner, SearchWeights, diversify_results};
pub use strategy::{
	ContentSearchStrategy, EmbeddingSpace, MemoryFilter, ScoredMemory, StrategyOptions,
	TagSearchStrategy,
};

use std::{sync::Arc, time::Instant};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use lore_config::{Config, EmbeddingProviderConfig};
use lore_domain::{Memory, MemoryType};

use crate::{AnalyticsSink, EmbeddingProvider, Error, MemoryIndex, Providers, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
	ContentOnly,
	TagsOnly,
	#[default]
	Hybrid,
	#[serde(other)]
	Unknown,
}
impl SearchMode {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::ContentOnly => "content_only",
			Self::TagsOnly => "tags_only",
			Self::Hybrid => "hybrid",
			Self::Unknown => "unknown",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchScores {
	pub content: Option<f32>,
	pub tags: Option<f32>,
	pub combined: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
	pub memory: Memory,
	/// Combined score in [0, 1].
	pub similarity: f32,
	pub scores: SearchScores,
	pub search_mode: SearchMode,
	pub appears_in_both: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
	pub mode: SearchMode,
	pub limit: Option<u32>,
	pub threshold: Option<f32>,
	pub project_id: Option<i64>,
	pub session_id: Option<i64>,
	pub memory_type: Option<MemoryType>,
	pub recent_only: bool,
	/// Failed memories are excluded unless this is set.
	pub include_failed: bool,
	pub weights: Option<SearchWeights>,
	pub boost_overlap: bool,
	pub diversity: Option<DiversityLimits>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
	pub search_mode: SearchMode,
	pub results: Vec<SearchResult>,
}

/// One analytics row per completed search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchStats {
	pub query: String,
	pub search_mode: SearchMode,
	pub content_weight: Option<f32>,
	pub tag_weight: Option<f32>,
	pub result_count: usize,
	pub avg_similarity: Option<f32>,
	pub latency_ms: u64,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
}

/// Query-level settings resolved against configuration defaults.
#[derive(Debug, Clone)]
struct SearchPlan {
	mode: SearchMode,
	limit: u32,
	combiner: ResultCombiner,
	boost: Option<OverlapBoost>,
	diversity: Option<DiversityLimits>,
	strategy: StrategyOptions,
}

pub struct HybridSearchEngine {
	search: lore_config::Search,
	embedding_cfg: EmbeddingProviderConfig,
	embedding: Arc<dyn EmbeddingProvider>,
	content: ContentSearchStrategy,
	tags: TagSearchStrategy,
	analytics: Arc<dyn AnalyticsSink>,
}
impl HybridSearchEngine {
	pub fn new(
		search: lore_config::Search,
		embedding_cfg: EmbeddingProviderConfig,
		embedding: Arc<dyn EmbeddingProvider>,
		index: Arc<dyn MemoryIndex>,
		analytics: Arc<dyn AnalyticsSink>,
	) -> Self {
		Self {
			search,
			embedding_cfg,
			embedding,
			content: ContentSearchStrategy::new(index.clone()),
			tags: TagSearchStrategy::new(index),
			analytics,
		}
	}

	pub fn from_config(
		cfg: &Config,
		providers: &Providers,
		index: Arc<dyn MemoryIndex>,
		analytics: Arc<dyn AnalyticsSink>,
	) -> Self {
		Self::new(
			cfg.search.clone(),
			cfg.providers.embedding.clone(),
			providers.embedding.clone(),
			index,
			analytics,
		)
	}

	/// Embeds `query` once and runs the requested mode.
	///
	/// Hybrid mode queries both strategies concurrently and treats a failed side as empty. A failed
	/// query embedding fails the whole call.
	pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
		let started = Instant::now();
		let plan = self.plan(query, options)?;
		let vector = self.embed_query(query).await?;
		let results = self.execute(plan.mode, &vector, &plan).await?;

		self.record(query, plan.mode, &plan, &results, started).await;

		Ok(SearchResponse { search_mode: plan.mode, results })
	}

	/// Tries hybrid, then content only, then tags only, and returns the first non-empty ranking.
	pub async fn search_with_fallback(
		&self,
		query: &str,
		options: &SearchOptions,
	) -> Result<SearchResponse> {
		let started = Instant::now();
		let plan = self.plan(query, options)?;
		let vector = self.embed_query(query).await?;
		let mut last_mode = SearchMode::Hybrid;

		for mode in [SearchMode::Hybrid, SearchMode::ContentOnly, SearchMode::TagsOnly] {
			last_mode = mode;

			match self.execute(mode, &vector, &plan).await {
				Ok(results) if !results.is_empty() => {
					self.record(query, mode, &plan, &results, started).await;

					return Ok(SearchResponse { search_mode: mode, results });
				},
				Ok(_) => {
					tracing::debug!(mode = mode.as_str(), "Search mode returned no results.");
				},
				Err(err) => {
					tracing::warn!(
						error = %err,
						mode = mode.as_str(),
						"Search mode failed. Trying the next mode."
					);
				},
			}
		}

		self.record(query, last_mode, &plan, &[], started).await;

		Ok(SearchResponse { search_mode: last_mode, results: Vec::new() })
	}

	fn plan(&self, query: &str, options: &SearchOptions) -> Result<SearchPlan> {
		if query.trim().is_empty() {
			return Err(Error::InvalidRequest { message: "query must not be empty.".to_string() });
		}
		if options.mode == SearchMode::Unknown {
			return Err(Error::InvalidRequest { message: "Unknown search mode.".to_string() });
		}

		let limit = options.limit.unwrap_or(self.search.default_limit);

		if limit == 0 || limit > self.search.max_limit {
			return Err(Error::InvalidRequest {
				message: format!("limit must be between 1 and {}.", self.search.max_limit),
			});
		}

		let threshold = options.threshold.unwrap_or(self.search.default_threshold);

		if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
			return Err(Error::InvalidRequest {
				message: "threshold must be in the range 0.0-1.0.".to_string(),
			});
		}

		let weights = options.weights.unwrap_or(SearchWeights {
			content: self.search.content_weight,
			tags: self.search.tag_weight,
		});
		let combiner = ResultCombiner::new(weights)?;
		let boost = options.boost_overlap.then_some(OverlapBoost {
			boost: self.search.overlap_boost,
			max_boost: self.search.max_boost,
		});
		let strategy = StrategyOptions {
			project_id: options.project_id,
			session_id: options.session_id,
			memory_type: options.memory_type,
			recent_only: options.recent_only,
			recent_window_days: self.search.recent_window_days,
			exclude_failed: !options.include_failed,
			threshold,
			limit,
		};

		Ok(SearchPlan {
			mode: options.mode,
			limit,
			combiner,
			boost,
			diversity: options.diversity,
			strategy,
		})
	}

	async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
		let texts = [query.trim().to_string()];
		let vectors = self.embedding.embed(&self.embedding_cfg, &texts).await?;
		let Some(vector) = vectors.into_iter().next() else {
			return Err(Error::Provider {
				message: "Embedding provider returned no vectors.".to_string(),
			});
		};

		if vector.len() != self.embedding_cfg.dimensions as usize {
			return Err(Error::Provider {
				message: "Embedding vector dimension mismatch.".to_string(),
			});
		}

		Ok(vector)
	}

	async fn execute(
		&self,
		mode: SearchMode,
		vector: &[f32],
		plan: &SearchPlan,
	) -> Result<Vec<SearchResult>> {
		let results = match mode {
			SearchMode::ContentOnly =>
				self.content.search_by_embedding(vector, &plan.strategy).await?,
			SearchMode::TagsOnly => self.tags.search_by_embedding(vector, &plan.strategy).await?,
			SearchMode::Hybrid => self.hybrid(vector, plan).await,
			SearchMode::Unknown => {
				return Err(Error::InvalidRequest { message: "Unknown search mode.".to_string() });
			},
		};
		let mut results = match plan.diversity.as_ref() {
			Some(limits) => diversify_results(results, limits),
			None => results,
		};

		results.truncate(plan.limit as usize);

		Ok(results)
	}

	async fn hybrid(&self, vector: &[f32], plan: &SearchPlan) -> Vec<SearchResult> {
		let fetch_limit = overfetch_limit(plan.limit, self.search.overfetch_factor);
		let fetch = plan.strategy.with_limit(fetch_limit);
		let (content, tags) = tokio::join!(
			self.content.search_by_embedding(vector, &fetch),
			self.tags.search_by_embedding(vector, &fetch),
		);
		let content = content.unwrap_or_else(|err| {
			tracing::warn!(error = %err, "Content search failed. Continuing with tag results.");

			Vec::new()
		});
		let tags = tags.unwrap_or_else(|err| {
			tracing::warn!(error = %err, "Tag search failed. Continuing with content results.");

			Vec::new()
		});

		match plan.boost {
			Some(boost) => plan.combiner.merge_with_boost(content, tags, boost),
			None => plan.combiner.combine(content, tags),
		}
	}

	async fn record(
		&self,
		query: &str,
		mode: SearchMode,
		plan: &SearchPlan,
		results: &[SearchResult],
		started: Instant,
	) {
		if !self.search.record_analytics {
			return;
		}

		let weights = (mode == SearchMode::Hybrid).then(|| plan.combiner.weights());
		let avg_similarity = (!results.is_empty()).then(|| {
			results.iter().map(|result| result.similarity).sum::<f32>() / results.len() as f32
		});
		let stats = SearchStats {
			query: query.to_string(),
			search_mode: mode,
			content_weight: weights.map(|weights| weights.content),
			tag_weight: weights.map(|weights| weights.tags),
			result_count: results.len(),
			avg_similarity,
			latency_ms: started.elapsed().as_millis() as u64,
			created_at: OffsetDateTime::now_utc(),
		};

		if let Err(err) = self.analytics.record(&stats).await {
			tracing::warn!(error = %err, "Failed to record search analytics.");
		}
	}
}

fn overfetch_limit(limit: u32, factor: f32) -> u32 {
	let scaled = (limit as f32 * factor.max(1.0)).ceil();

	(scaled as u32).max(limit)
}
