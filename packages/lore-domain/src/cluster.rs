//! Greedy single-link grouping of same-type memories for batch insight generation.
//!
//! Memories are partitioned by [`MemoryType`] first, so a cluster never mixes types. Inside a
//! partition a candidate cluster grows from its seed: every unvisited memory is tested against
//! each member added so far until nothing else joins. Candidates smaller than the configured
//! minimum are dissolved and their members reported as unclustered.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use time::OffsetDateTime;

use crate::{
	memory::{Memory, MemoryType},
	similarity,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClusterError {
	#[error("Invalid clustering configuration: {0}")]
	InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeSpan {
	#[serde(with = "time::serde::rfc3339")]
	pub start: OffsetDateTime,
	#[serde(with = "time::serde::rfc3339")]
	pub end: OffsetDateTime,
	pub days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
	pub id: String,
	pub memory_type: MemoryType,
	pub members: Vec<Memory>,
	pub time_span: TimeSpan,
	pub common_tags: Vec<String>,
}
impl Cluster {
	fn from_members(id: String, memory_type: MemoryType, members: Vec<Memory>) -> Self {
		let time_span = time_span_of(&members);
		let common_tags = common_tags_of(&members);

		Self { id, memory_type, members, time_span, common_tags }
	}

	pub fn len(&self) -> usize {
		self.members.len()
	}

	pub fn is_empty(&self) -> bool {
		self.members.is_empty()
	}

	pub fn member_ids(&self) -> Vec<i64> {
		self.members.iter().map(|memory| memory.id).collect()
	}

	/// Project of the first member. Clusters are built from a single run's batch, which is
	/// fetched per deployment rather than per project, so members may span projects.
	pub fn project_id(&self) -> Option<i64> {
		self.members.first().map(|memory| memory.project_id)
	}
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusteringOutcome {
	pub clusters: Vec<Cluster>,
	pub unclustered: Vec<Memory>,
}
impl ClusteringOutcome {
	pub fn all_unclustered(memories: Vec<Memory>) -> Self {
		Self { clusters: Vec::new(), unclustered: memories }
	}

	/// Moves memories into the clusters described by `grouping`, which must have been computed
	/// over the same slice.
	pub fn from_grouping(memories: Vec<Memory>, grouping: IndexGrouping) -> Self {
		let mut slots: Vec<Option<Memory>> = memories.into_iter().map(Some).collect();
		let mut outcome = Self::default();

		for (ordinal, (memory_type, indices)) in grouping.groups.into_iter().enumerate() {
			let members: Vec<Memory> =
				indices.into_iter().filter_map(|idx| slots.get_mut(idx)?.take()).collect();
			let id = format!("{memory_type}-{}", ordinal + 1);

			outcome.clusters.push(Cluster::from_members(id, memory_type, members));
		}

		outcome.unclustered = grouping
			.unclustered
			.into_iter()
			.filter_map(|idx| slots.get_mut(idx)?.take())
			.collect();

		outcome
	}

	pub fn clustered_count(&self) -> usize {
		self.clusters.iter().map(Cluster::len).sum()
	}
}

/// Per-pair breakdown of the hybrid similarity decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairSimilarity {
	pub embedding: Option<f32>,
	pub tags: f32,
	pub time: f32,
	pub hybrid: f32,
	pub direct_match: bool,
	pub similar: bool,
}

/// Index-level result of grouping, before memories are moved into clusters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexGrouping {
	pub groups: Vec<(MemoryType, Vec<usize>)>,
	pub unclustered: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryClusterer {
	pub min_cluster_size: usize,
	pub direct_match_threshold: f32,
	pub hybrid_threshold: f32,
	pub embedding_weight: f32,
	pub tag_weight: f32,
	pub time_weight: f32,
	pub max_window_days: f32,
}
impl MemoryClusterer {
	pub fn new(cfg: &lore_config::Clustering) -> Self {
		Self {
			min_cluster_size: cfg.min_cluster_size as usize,
			direct_match_threshold: cfg.direct_match_threshold,
			hybrid_threshold: cfg.hybrid_threshold,
			embedding_weight: cfg.embedding_weight,
			tag_weight: cfg.tag_weight,
			time_weight: cfg.time_weight,
			max_window_days: cfg.max_window_days,
		}
	}

	pub fn validate(&self) -> Result<(), ClusterError> {
		if self.min_cluster_size < 2 {
			return Err(ClusterError::InvalidConfig(
				"min_cluster_size must be at least 2.".to_string(),
			));
		}

		for (label, value) in [
			("direct_match_threshold", self.direct_match_threshold),
			("hybrid_threshold", self.hybrid_threshold),
			("embedding_weight", self.embedding_weight),
			("tag_weight", self.tag_weight),
			("time_weight", self.time_weight),
		] {
			if !value.is_finite() || !(0.0..=1.0).contains(&value) {
				return Err(ClusterError::InvalidConfig(format!(
					"{label} must be a finite number in the range 0.0-1.0."
				)));
			}
		}

		if !self.max_window_days.is_finite() || self.max_window_days <= 0.0 {
			return Err(ClusterError::InvalidConfig(
				"max_window_days must be greater than zero.".to_string(),
			));
		}

		Ok(())
	}

	pub fn similarity(&self, lhs: &Memory, rhs: &Memory) -> PairSimilarity {
		let embedding = match (&lhs.content_embedding, &rhs.content_embedding) {
			(Some(lhs_vec), Some(rhs_vec)) => similarity::cosine_similarity(lhs_vec, rhs_vec),
			_ => None,
		};

		if let Some(score) = embedding
			&& score >= self.direct_match_threshold
		{
			return PairSimilarity {
				embedding,
				tags: 0.0,
				time: 0.0,
				hybrid: score,
				direct_match: true,
				similar: true,
			};
		}

		let tags = similarity::tag_jaccard(&lhs.smart_tags, &rhs.smart_tags);
		let time = similarity::time_proximity(lhs.created_at, rhs.created_at, self.max_window_days);
		let hybrid = self.embedding_weight * embedding.unwrap_or(0.0).max(0.0)
			+ self.tag_weight * tags
			+ self.time_weight * time;

		PairSimilarity {
			embedding,
			tags,
			time,
			hybrid,
			direct_match: false,
			similar: hybrid >= self.hybrid_threshold,
		}
	}

	pub fn are_similar(&self, lhs: &Memory, rhs: &Memory) -> bool {
		self.similarity(lhs, rhs).similar
	}

	pub fn group_indices(&self, memories: &[Memory]) -> Result<IndexGrouping, ClusterError> {
		self.validate()?;

		let mut partitions: BTreeMap<MemoryType, Vec<usize>> = BTreeMap::new();

		for (idx, memory) in memories.iter().enumerate() {
			partitions.entry(memory.memory_type).or_default().push(idx);
		}

		let mut grouping = IndexGrouping::default();

		for (memory_type, partition) in partitions {
			if partition.len() < self.min_cluster_size {
				grouping.unclustered.extend(partition);

				continue;
			}

			let mut visited = vec![false; partition.len()];

			for seed in 0..partition.len() {
				if visited[seed] {
					continue;
				}

				visited[seed] = true;

				let mut component = vec![seed];
				let mut cursor = 0;

				while cursor < component.len() {
					let member = &memories[partition[component[cursor]]];

					for candidate in 0..partition.len() {
						if visited[candidate] {
							continue;
						}
						if self.are_similar(member, &memories[partition[candidate]]) {
							visited[candidate] = true;
							component.push(candidate);
						}
					}

					cursor += 1;
				}

				let global: Vec<usize> = component.into_iter().map(|pos| partition[pos]).collect();

				if global.len() >= self.min_cluster_size {
					grouping.groups.push((memory_type, global));
				} else {
					grouping.unclustered.extend(global);
				}
			}
		}

		grouping.unclustered.sort_unstable();

		Ok(grouping)
	}

	pub fn cluster(&self, memories: Vec<Memory>) -> Result<ClusteringOutcome, ClusterError> {
		let grouping = self.group_indices(&memories)?;

		Ok(ClusteringOutcome::from_grouping(memories, grouping))
	}
}

fn time_span_of(members: &[Memory]) -> TimeSpan {
	let start = members
		.iter()
		.map(|memory| memory.created_at)
		.min()
		.unwrap_or(OffsetDateTime::UNIX_EPOCH);
	let end =
		members.iter().map(|memory| memory.created_at).max().unwrap_or(OffsetDateTime::UNIX_EPOCH);

	TimeSpan { start, end, days: (end - start).whole_days() }
}

fn common_tags_of(members: &[Memory]) -> Vec<String> {
	let Some((first, rest)) = members.split_first() else {
		return Vec::new();
	};
	let rest_sets: Vec<HashSet<String>> = rest
		.iter()
		.map(|memory| memory.smart_tags.iter().map(|tag| tag.trim().to_lowercase()).collect())
		.collect();
	let mut seen = HashSet::new();

	first
		.smart_tags
		.iter()
		.filter(|tag| {
			let key = tag.trim().to_lowercase();

			!key.is_empty()
				&& rest_sets.iter().all(|set| set.contains(&key))
				&& seen.insert(key)
		})
		.cloned()
		.collect()
}
