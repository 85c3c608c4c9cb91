use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub providers: Providers,
	pub search: Search,
	pub clustering: Clustering,
	pub insights: Insights,
	pub indexing: Indexing,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
	#[serde(default = "default_log_level")]
	pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
	pub postgres: Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
	pub llm_insight: LlmProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub temperature: f32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Search {
	pub default_limit: u32,
	pub max_limit: u32,
	pub default_threshold: f32,
	/// Multiplier applied to the requested limit when each strategy fetches candidates in hybrid
	/// mode.
	pub overfetch_factor: f32,
	pub recent_window_days: u32,
	pub content_weight: f32,
	pub tag_weight: f32,
	pub overlap_boost: f32,
	pub max_boost: f32,
	#[serde(default = "default_true")]
	pub record_analytics: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Clustering {
	#[serde(default = "default_true")]
	pub enabled: bool,
	pub min_cluster_size: u32,
	/// Cosine similarity at or above which two memories are grouped without consulting tags or
	/// time.
	pub direct_match_threshold: f32,
	pub hybrid_threshold: f32,
	pub embedding_weight: f32,
	pub tag_weight: f32,
	pub time_weight: f32,
	pub max_window_days: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Insights {
	pub max_memories_per_run: u32,
	pub batch_size: u32,
	pub max_insights_per_item: u32,
	pub interval_secs: u64,
	pub retry_batch_size: u32,
	pub max_retry_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Indexing {
	pub batch_size: u32,
	pub max_attempts: u32,
	pub poll_interval_ms: u64,
}

fn default_log_level() -> String {
	"info".to_string()
}

fn default_true() -> bool {
	true
}
