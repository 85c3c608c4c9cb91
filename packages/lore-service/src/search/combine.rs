//! Merges content and tag rankings into one list.
//!
//! A memory found by only one strategy keeps that score unchanged. A memory found by both gets the
//! weighted sum of its two scores, optionally raised by an overlap boost.

use std::{
	cmp::Ordering,
	collections::{HashMap, hash_map::Entry},
};

use serde::{Deserialize, Serialize};

use lore_domain::{Memory, MemoryType};

use crate::{
	Error, Result,
	search::{SearchMode, SearchResult, SearchScores},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchWeights {
	pub content: f32,
	pub tags: f32,
}
impl SearchWeights {
	pub fn new(content: f32, tags: f32) -> Result<Self> {
		let weights = Self { content, tags };

		weights.validate()?;

		Ok(weights)
	}

	/// Both weights must be in [0, 1] and sum to 1.0 within 1e-3.
	pub fn validate(&self) -> Result<()> {
		lore_config::validate_weight_pair("search", self.content, self.tags)
			.map_err(|err| Error::InvalidRequest { message: err.to_string() })
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlapBoost {
	pub boost: f32,
	pub max_boost: f32,
}
impl OverlapBoost {
	/// Adds the boost, capped at `max_boost`. A score already above the cap is left as is.
	pub fn apply(&self, combined: f32) -> f32 {
		(combined + self.boost).min(self.max_boost.max(combined))
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiversityLimits {
	pub max_per_type: Option<usize>,
	pub max_per_project: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultCombiner {
	weights: SearchWeights,
}
impl ResultCombiner {
	pub fn new(weights: SearchWeights) -> Result<Self> {
		weights.validate()?;

		Ok(Self { weights })
	}

	pub fn weights(&self) -> SearchWeights {
		self.weights
	}

	pub fn combine(
		&self,
		content_results: Vec<SearchResult>,
		tag_results: Vec<SearchResult>,
	) -> Vec<SearchResult> {
		self.merge(content_results, tag_results, None)
	}

	/// Like [`Self::combine`], but memories present in both lists get `boost` added.
	pub fn merge_with_boost(
		&self,
		content_results: Vec<SearchResult>,
		tag_results: Vec<SearchResult>,
		boost: OverlapBoost,
	) -> Vec<SearchResult> {
		self.merge(content_results, tag_results, Some(boost))
	}

	fn merge(
		&self,
		content_results: Vec<SearchResult>,
		tag_results: Vec<SearchResult>,
		boost: Option<OverlapBoost>,
	) -> Vec<SearchResult> {
		let mut merged: HashMap<i64, PartialScores> =
			HashMap::with_capacity(content_results.len() + tag_results.len());

		for result in content_results {
			let score = result.scores.content.unwrap_or(result.similarity);

			keep_max(&mut PartialScores::slot(&mut merged, result.memory).content, score);
		}
		for result in tag_results {
			let score = result.scores.tags.unwrap_or(result.similarity);

			keep_max(&mut PartialScores::slot(&mut merged, result.memory).tags, score);
		}

		let mut out: Vec<SearchResult> =
			merged.into_values().filter_map(|partial| self.finish(partial, boost)).collect();

		sort_results(&mut out);

		out
	}

	fn finish(&self, partial: PartialScores, boost: Option<OverlapBoost>) -> Option<SearchResult> {
		let PartialScores { memory, content, tags } = partial;
		let (combined, appears_in_both) = match (content, tags) {
			(Some(content), Some(tags)) => {
				let weighted = self.weights.content * content + self.weights.tags * tags;

				(boost.map(|boost| boost.apply(weighted)).unwrap_or(weighted), true)
			},
			(Some(score), None) | (None, Some(score)) => (score, false),
			(None, None) => return None,
		};
		let combined = combined.clamp(0.0, 1.0);

		Some(SearchResult {
			memory,
			similarity: combined,
			scores: SearchScores { content, tags, combined },
			search_mode: SearchMode::Hybrid,
			appears_in_both,
		})
	}
}

struct PartialScores {
	memory: Memory,
	content: Option<f32>,
	tags: Option<f32>,
}
impl PartialScores {
	fn slot(merged: &mut HashMap<i64, Self>, memory: Memory) -> &mut Self {
		match merged.entry(memory.id) {
			Entry::Occupied(entry) => entry.into_mut(),
			Entry::Vacant(entry) => entry.insert(Self { memory, content: None, tags: None }),
		}
	}
}

fn keep_max(slot: &mut Option<f32>, score: f32) {
	*slot = Some(slot.map_or(score, |current| current.max(score)));
}

/// Greedy single pass that keeps ranking order and drops a result once its type or project bucket
/// is full.
pub fn diversify_results(
	results: Vec<SearchResult>,
	limits: &DiversityLimits,
) -> Vec<SearchResult> {
	let mut per_type: HashMap<MemoryType, usize> = HashMap::new();
	let mut per_project: HashMap<i64, usize> = HashMap::new();
	let mut out = Vec::with_capacity(results.len());

	for result in results {
		let type_count = per_type.get(&result.memory.memory_type).copied().unwrap_or(0);
		let project_count = per_project.get(&result.memory.project_id).copied().unwrap_or(0);

		if limits.max_per_type.is_some_and(|max| type_count >= max) {
			continue;
		}
		if limits.max_per_project.is_some_and(|max| project_count >= max) {
			continue;
		}

		*per_type.entry(result.memory.memory_type).or_default() += 1;
		*per_project.entry(result.memory.project_id).or_default() += 1;

		out.push(result);
	}

	out
}

/// Similarity desc, then importance desc, then recency desc. Ties fall back to id.
pub(crate) fn sort_results(results: &mut [SearchResult]) {
	results.sort_by(compare_results);
}

fn compare_results(lhs: &SearchResult, rhs: &SearchResult) -> Ordering {
	rhs.similarity
		.total_cmp(&lhs.similarity)
		.then_with(|| rhs.memory.importance_score.total_cmp(&lhs.memory.importance_score))
		.then_with(|| rhs.memory.created_at.cmp(&lhs.memory.created_at))
		.then_with(|| lhs.memory.id.cmp(&rhs.memory.id))
}
