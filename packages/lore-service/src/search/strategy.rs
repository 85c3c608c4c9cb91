use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use lore_domain::{Memory, MemoryType};

use crate::{
	Error, MemoryIndex, Result,
	search::{SearchMode, SearchResult, SearchScores, combine},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingSpace {
	Content,
	Tags,
}
impl EmbeddingSpace {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Content => "content",
			Self::Tags => "tags",
		}
	}

	pub fn mode(self) -> SearchMode {
		match self {
			Self::Content => SearchMode::ContentOnly,
			Self::Tags => SearchMode::TagsOnly,
		}
	}
}

/// Predicates pushed down to the memory index.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryFilter {
	pub project_id: Option<i64>,
	pub session_id: Option<i64>,
	pub memory_type: Option<MemoryType>,
	pub created_after: Option<OffsetDateTime>,
	pub exclude_failed: bool,
	pub threshold: f32,
	pub limit: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMemory {
	pub memory: Memory,
	/// `1 - cosine distance` against the queried embedding column.
	pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOptions {
	pub project_id: Option<i64>,
	pub session_id: Option<i64>,
	pub memory_type: Option<MemoryType>,
	/// Restrict candidates to memories created within `recent_window_days`.
	pub recent_only: bool,
	pub recent_window_days: u32,
	pub exclude_failed: bool,
	pub threshold: f32,
	pub limit: u32,
}
impl StrategyOptions {
	pub fn new(threshold: f32, limit: u32) -> Self {
		Self {
			project_id: None,
			session_id: None,
			memory_type: None,
			recent_only: false,
			recent_window_days: 30,
			exclude_failed: true,
			threshold,
			limit,
		}
	}

	pub fn with_limit(&self, limit: u32) -> Self {
		Self { limit, ..self.clone() }
	}

	pub fn filter(&self, now: OffsetDateTime) -> MemoryFilter {
		let created_after = self
			.recent_only
			.then(|| now - Duration::days(i64::from(self.recent_window_days)));

		MemoryFilter {
			project_id: self.project_id,
			session_id: self.session_id,
			memory_type: self.memory_type,
			created_after,
			exclude_failed: self.exclude_failed,
			threshold: self.threshold,
			limit: self.limit,
		}
	}
}

/// Ranks memories by similarity of their content embedding to the query vector.
#[derive(Clone)]
pub struct ContentSearchStrategy {
	index: Arc<dyn MemoryIndex>,
}
impl ContentSearchStrategy {
	pub fn new(index: Arc<dyn MemoryIndex>) -> Self {
		Self { index }
	}

	pub async fn search_by_embedding(
		&self,
		vector: &[f32],
		options: &StrategyOptions,
	) -> Result<Vec<SearchResult>> {
		search_space(self.index.as_ref(), EmbeddingSpace::Content, vector, options).await
	}
}

/// Ranks memories by similarity of their tag embedding to the query vector.
#[derive(Clone)]
pub struct TagSearchStrategy {
	index: Arc<dyn MemoryIndex>,
}
impl TagSearchStrategy {
	pub fn new(index: Arc<dyn MemoryIndex>) -> Self {
		Self { index }
	}

	pub async fn search_by_embedding(
		&self,
		vector: &[f32],
		options: &StrategyOptions,
	) -> Result<Vec<SearchResult>> {
		search_space(self.index.as_ref(), EmbeddingSpace::Tags, vector, options).await
	}
}

impl SearchResult {
	pub(crate) fn single(space: EmbeddingSpace, memory: Memory, score: f32) -> Self {
		let scores = match space {
			EmbeddingSpace::Content =>
				SearchScores { content: Some(score), tags: None, combined: score },
			EmbeddingSpace::Tags =>
				SearchScores { content: None, tags: Some(score), combined: score },
		};

		Self { memory, similarity: score, scores, search_mode: space.mode(), appears_in_both: false }
	}
}

async fn search_space(
	index: &dyn MemoryIndex,
	space: EmbeddingSpace,
	vector: &[f32],
	options: &StrategyOptions,
) -> Result<Vec<SearchResult>> {
	if options.limit == 0 {
		return Err(Error::InvalidRequest { message: "limit must be greater than zero.".to_string() });
	}
	if vector.is_empty() {
		return Err(Error::InvalidRequest {
			message: "Query vector must not be empty.".to_string(),
		});
	}
	if !options.threshold.is_finite() || !(0.0..=1.0).contains(&options.threshold) {
		return Err(Error::InvalidRequest {
			message: "threshold must be in the range 0.0-1.0.".to_string(),
		});
	}

	let filter = options.filter(OffsetDateTime::now_utc());
	let rows = index.search_by_embedding(space, vector, &filter).await.map_err(|err| match err {
		Error::InvalidRequest { .. } => err,
		other => Error::Search { space: space.as_str(), message: other.to_string() },
	})?;
	let mut results: Vec<SearchResult> = rows
		.into_iter()
		.filter(|row| row.similarity.is_finite() && row.similarity >= options.threshold)
		.filter(|row| !(options.exclude_failed && row.memory.processing_status.is_failed()))
		.map(|row| SearchResult::single(space, row.memory, row.similarity.clamp(0.0, 1.0)))
		.collect();

	combine::sort_results(&mut results);
	results.truncate(options.limit as usize);

	Ok(results)
}
