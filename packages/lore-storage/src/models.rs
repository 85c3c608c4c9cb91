use serde_json::Value;
use time::OffsetDateTime;

pub const TASK_BATCH_MEMORY_PROCESSING: &str = "batch_memory_processing";
pub const TASK_MEMORY_RETRY: &str = "memory_retry";

pub const JOB_PENDING: &str = "pending";
pub const JOB_PROCESSING: &str = "processing";
pub const JOB_COMPLETED: &str = "completed";
pub const JOB_FAILED: &str = "failed";

pub const PROCESSING_MARKER_TYPE: &str = "processing_marker";

/// Memory row with embeddings rendered as pgvector text (`[0.1,0.2,...]`).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MemoryRow {
	pub id: i64,
	pub project_id: i64,
	pub session_id: Option<i64>,
	pub content: String,
	pub summary: Option<String>,
	pub content_embedding: Option<String>,
	pub tag_embedding: Option<String>,
	pub smart_tags: Vec<String>,
	pub memory_type: String,
	pub importance_score: f32,
	pub processing_status: String,
	pub embedding_attempts: i32,
	pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScoredMemoryRow {
	#[sqlx(flatten)]
	pub memory: MemoryRow,
	pub similarity: f32,
}

#[derive(Debug, Clone)]
pub struct NewMemory {
	pub project_id: i64,
	pub session_id: Option<i64>,
	pub content: String,
	pub summary: Option<String>,
	pub smart_tags: Vec<String>,
	pub memory_type: String,
	pub importance_score: f32,
	pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessingJob {
	pub id: i64,
	pub task_type: String,
	pub source_ids: Vec<i64>,
	pub status: String,
	pub payload: Value,
	pub attempts: i32,
	pub error_message: Option<String>,
	pub available_at: OffsetDateTime,
	pub created_at: OffsetDateTime,
	pub started_at: Option<OffsetDateTime>,
	pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewInsight {
	pub project_id: Option<i64>,
	pub insight_type: String,
	pub title: String,
	pub content: String,
	pub confidence: f32,
	pub tags: Vec<String>,
	pub source_memory_ids: Vec<i64>,
	pub cluster_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchAnalyticsRecord {
	pub query: String,
	pub search_mode: String,
	pub content_weight: Option<f32>,
	pub tag_weight: Option<f32>,
	pub result_count: i32,
	pub avg_similarity: Option<f32>,
	pub latency_ms: i64,
	pub created_at: OffsetDateTime,
}

pub fn processing_marker_source_id(memory_id: i64) -> String {
	format!("memory:{memory_id}")
}
