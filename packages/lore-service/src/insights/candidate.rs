use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lore_domain::{Cluster, Memory};
use lore_storage::models::PROCESSING_MARKER_TYPE;

use crate::{Error, Result};

const DEFAULT_INSIGHT_TYPE: &str = "general";
const SYSTEM_PROMPT: &str = "\
You extract durable insights from software project memories. \
Respond with a JSON object of the form \
{\"insights\": [{\"type\": string, \"title\": string, \"content\": string, \"confidence\": number, \"tags\": [string]}]}. \
Confidence is between 0 and 1. Return an empty insights list when nothing is worth keeping.";

/// An insight proposed by the generator, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightCandidate {
	#[serde(default, alias = "type")]
	pub insight_type: String,
	#[serde(default)]
	pub title: String,
	#[serde(default)]
	pub content: String,
	#[serde(default = "default_confidence")]
	pub confidence: f32,
	#[serde(default)]
	pub tags: Vec<String>,
}
impl InsightCandidate {
	/// Trims fields and returns `None` when the candidate cannot be stored.
	pub fn normalized(self) -> Option<Self> {
		let title = self.title.trim().to_string();
		let content = self.content.trim().to_string();

		if title.is_empty() || content.is_empty() {
			return None;
		}
		if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
			return None;
		}

		let insight_type = match self.insight_type.trim().to_lowercase() {
			raw if raw.is_empty() => DEFAULT_INSIGHT_TYPE.to_string(),
			raw if raw == PROCESSING_MARKER_TYPE => return None,
			raw => raw,
		};
		let mut seen = HashSet::new();
		let tags = self
			.tags
			.into_iter()
			.map(|tag| tag.trim().to_string())
			.filter(|tag| !tag.is_empty() && seen.insert(tag.to_lowercase()))
			.collect();

		Some(Self { insight_type, title, content, confidence: self.confidence, tags })
	}
}

/// Reads candidates from `{"insights": [...]}` or a bare array. Malformed items are skipped.
pub fn parse_candidates(json: Value) -> Result<Vec<InsightCandidate>> {
	let items = match json {
		Value::Array(items) => items,
		Value::Object(mut map) => match map.remove("insights") {
			Some(Value::Array(items)) => items,
			_ => {
				return Err(Error::Provider {
					message: "Insight response is missing an insights array.".to_string(),
				});
			},
		},
		_ => {
			return Err(Error::Provider {
				message: "Insight response must be a JSON object or array.".to_string(),
			});
		},
	};
	let mut candidates = Vec::with_capacity(items.len());

	for item in items {
		match serde_json::from_value::<InsightCandidate>(item) {
			Ok(candidate) => candidates.push(candidate),
			Err(err) => tracing::debug!(error = %err, "Skipping malformed insight candidate."),
		}
	}

	Ok(candidates)
}

/// Keeps at most `max` valid candidates, in generator order.
pub(crate) fn validate_candidates(
	candidates: Vec<InsightCandidate>,
	max: usize,
) -> Vec<InsightCandidate> {
	candidates.into_iter().filter_map(InsightCandidate::normalized).take(max).collect()
}

pub(crate) fn memory_messages(memory: &Memory) -> Vec<Value> {
	let input = serde_json::json!({
		"memory_type": memory.memory_type,
		"content": memory.content,
		"summary": memory.summary,
		"tags": memory.smart_tags,
		"importance": memory.importance_score,
	});

	vec![
		serde_json::json!({ "role": "system", "content": SYSTEM_PROMPT }),
		serde_json::json!({ "role": "user", "content": input.to_string() }),
	]
}

pub(crate) fn cluster_messages(cluster: &Cluster) -> Vec<Value> {
	let members: Vec<Value> = cluster
		.members
		.iter()
		.map(|memory| {
			serde_json::json!({
				"id": memory.id,
				"content": memory.content,
				"tags": memory.smart_tags,
			})
		})
		.collect();
	let input = serde_json::json!({
		"cluster_id": cluster.id,
		"memory_type": cluster.memory_type,
		"common_tags": cluster.common_tags,
		"time_span_days": cluster.time_span.days,
		"memories": members,
	});

	vec![
		serde_json::json!({
			"role": "system",
			"content": format!(
				"{SYSTEM_PROMPT} The memories below were grouped as related. Prefer insights that \
				 hold across several of them."
			),
		}),
		serde_json::json!({ "role": "user", "content": input.to_string() }),
	]
}

fn default_confidence() -> f32 {
	0.5
}
