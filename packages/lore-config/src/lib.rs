mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Clustering, Config, EmbeddingProviderConfig, Indexing, Insights, LlmProviderConfig, Postgres,
	Providers, Search, Service, Storage,
};

use std::{fs, path::Path};

/// Hard cap on memories fetched by a single insight run.
pub const MAX_MEMORIES_PER_RUN: u32 = 1_000;

const WEIGHT_SUM_EPSILON: f32 = 1e-3;

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.storage.postgres.dsn.trim().is_empty() {
		return Err(Error::Validation {
			message: "storage.postgres.dsn must be non-empty.".to_string(),
		});
	}
	if cfg.storage.postgres.pool_max_conns == 0 {
		return Err(Error::Validation {
			message: "storage.postgres.pool_max_conns must be greater than zero.".to_string(),
		});
	}
	if cfg.providers.embedding.dimensions == 0 {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must be greater than zero.".to_string(),
		});
	}

	for (label, key) in [
		("embedding", &cfg.providers.embedding.api_key),
		("llm_insight", &cfg.providers.llm_insight.api_key),
	] {
		if key.trim().is_empty() {
			return Err(Error::Validation {
				message: format!("Provider {label} api_key must be non-empty."),
			});
		}
	}

	validate_search(&cfg.search)?;
	validate_clustering(&cfg.clustering)?;
	validate_insights(&cfg.insights)?;

	if cfg.indexing.batch_size == 0 {
		return Err(Error::Validation {
			message: "indexing.batch_size must be greater than zero.".to_string(),
		});
	}
	if cfg.indexing.max_attempts == 0 {
		return Err(Error::Validation {
			message: "indexing.max_attempts must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

/// Checks that a pair of blend weights are each in 0.0-1.0 and sum to 1.0.
pub fn validate_weight_pair(label: &str, lhs: f32, rhs: f32) -> Result<()> {
	validate_unit_range(label, lhs)?;
	validate_unit_range(label, rhs)?;

	if ((lhs + rhs) - 1.0).abs() > WEIGHT_SUM_EPSILON {
		return Err(Error::Validation { message: format!("{label} weights must sum to 1.0.") });
	}

	Ok(())
}

fn validate_search(search: &Search) -> Result<()> {
	validate_weight_pair("search", search.content_weight, search.tag_weight)?;
	validate_unit_range("search.default_threshold", search.default_threshold)?;
	validate_unit_range("search.overlap_boost", search.overlap_boost)?;

	if search.default_limit == 0 {
		return Err(Error::Validation {
			message: "search.default_limit must be greater than zero.".to_string(),
		});
	}
	if search.default_limit > search.max_limit {
		return Err(Error::Validation {
			message: "search.default_limit must not exceed search.max_limit.".to_string(),
		});
	}
	if !search.overfetch_factor.is_finite() || search.overfetch_factor < 1.0 {
		return Err(Error::Validation {
			message: "search.overfetch_factor must be a finite number of at least 1.0.".to_string(),
		});
	}
	if !search.max_boost.is_finite() || search.max_boost <= 0.0 || search.max_boost > 1.0 {
		return Err(Error::Validation {
			message: "search.max_boost must be in the range (0.0, 1.0].".to_string(),
		});
	}
	if search.recent_window_days == 0 {
		return Err(Error::Validation {
			message: "search.recent_window_days must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn validate_clustering(clustering: &Clustering) -> Result<()> {
	if clustering.min_cluster_size < 2 {
		return Err(Error::Validation {
			message: "clustering.min_cluster_size must be at least 2.".to_string(),
		});
	}

	validate_unit_range("clustering.direct_match_threshold", clustering.direct_match_threshold)?;
	validate_unit_range("clustering.hybrid_threshold", clustering.hybrid_threshold)?;
	validate_unit_range("clustering.embedding_weight", clustering.embedding_weight)?;
	validate_unit_range("clustering.tag_weight", clustering.tag_weight)?;
	validate_unit_range("clustering.time_weight", clustering.time_weight)?;

	let sum = clustering.embedding_weight + clustering.tag_weight + clustering.time_weight;

	if (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
		return Err(Error::Validation {
			message: "clustering weights must sum to 1.0.".to_string(),
		});
	}
	if !clustering.max_window_days.is_finite() || clustering.max_window_days <= 0.0 {
		return Err(Error::Validation {
			message: "clustering.max_window_days must be a finite number greater than zero."
				.to_string(),
		});
	}

	Ok(())
}

fn validate_insights(insights: &Insights) -> Result<()> {
	if insights.max_memories_per_run == 0 || insights.max_memories_per_run > MAX_MEMORIES_PER_RUN
	{
		return Err(Error::Validation {
			message: format!(
				"insights.max_memories_per_run must be in the range 1-{MAX_MEMORIES_PER_RUN}."
			),
		});
	}

	for (label, value) in [
		("insights.batch_size", insights.batch_size),
		("insights.max_insights_per_item", insights.max_insights_per_item),
		("insights.retry_batch_size", insights.retry_batch_size),
		("insights.max_retry_attempts", insights.max_retry_attempts),
	] {
		if value == 0 {
			return Err(Error::Validation { message: format!("{label} must be greater than zero.") });
		}
	}

	if insights.interval_secs == 0 {
		return Err(Error::Validation {
			message: "insights.interval_secs must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn validate_unit_range(label: &str, value: f32) -> Result<()> {
	if !value.is_finite() {
		return Err(Error::Validation { message: format!("{label} must be a finite number.") });
	}
	if !(0.0..=1.0).contains(&value) {
		return Err(Error::Validation {
			message: format!("{label} must be in the range 0.0-1.0."),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	if cfg.service.log_level.trim().is_empty() {
		cfg.service.log_level = "info".to_string();
	}
}
