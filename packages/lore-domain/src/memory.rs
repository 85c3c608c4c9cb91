use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
	Code,
	Decision,
	Rule,
	Note,
	Progress,
	Bug,
	Task,
	General,
}
impl MemoryType {
	pub const ALL: [Self; 8] = [
		Self::Code,
		Self::Decision,
		Self::Rule,
		Self::Note,
		Self::Progress,
		Self::Bug,
		Self::Task,
		Self::General,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Code => "code",
			Self::Decision => "decision",
			Self::Rule => "rule",
			Self::Note => "note",
			Self::Progress => "progress",
			Self::Bug => "bug",
			Self::Task => "task",
			Self::General => "general",
		}
	}
}
impl fmt::Display for MemoryType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for MemoryType {
	type Err = UnknownVariant;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|variant| variant.as_str().eq_ignore_ascii_case(raw.trim()))
			.ok_or_else(|| UnknownVariant { kind: "memory type", value: raw.to_string() })
	}
}

/// Lifecycle of a memory through the embedding pipeline.
///
/// `pending -> processing -> ready | failed -> failed_permanent`. A `ready` memory always carries a
/// content embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
	Pending,
	Processing,
	Ready,
	Failed,
	FailedPermanent,
}
impl ProcessingStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Processing => "processing",
			Self::Ready => "ready",
			Self::Failed => "failed",
			Self::FailedPermanent => "failed_permanent",
		}
	}

	pub fn is_failed(self) -> bool {
		matches!(self, Self::Failed | Self::FailedPermanent)
	}
}
impl fmt::Display for ProcessingStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for ProcessingStatus {
	type Err = UnknownVariant;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw.trim().to_ascii_lowercase().as_str() {
			"pending" => Ok(Self::Pending),
			"processing" => Ok(Self::Processing),
			"ready" => Ok(Self::Ready),
			"failed" => Ok(Self::Failed),
			"failed_permanent" => Ok(Self::FailedPermanent),
			_ => Err(UnknownVariant { kind: "processing status", value: raw.to_string() }),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown {kind}: {value:?}.")]
pub struct UnknownVariant {
	pub kind: &'static str,
	pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
	pub id: i64,
	pub project_id: i64,
	pub session_id: Option<i64>,
	pub content: String,
	pub summary: Option<String>,
	#[serde(skip)]
	pub content_embedding: Option<Vec<f32>>,
	#[serde(skip)]
	pub tag_embedding: Option<Vec<f32>>,
	pub smart_tags: Vec<String>,
	pub memory_type: MemoryType,
	pub importance_score: f32,
	pub processing_status: ProcessingStatus,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
}
impl Memory {
	/// Text embedded into the tag space. `None` when the memory has no tags.
	pub fn tag_text(&self) -> Option<String> {
		let tags: Vec<&str> =
			self.smart_tags.iter().map(|tag| tag.trim()).filter(|tag| !tag.is_empty()).collect();

		if tags.is_empty() {
			return None;
		}

		Some(tags.join(", "))
	}

	/// A `ready` memory must carry a content embedding.
	pub fn is_consistent(&self) -> bool {
		self.processing_status != ProcessingStatus::Ready || self.content_embedding.is_some()
	}
}
