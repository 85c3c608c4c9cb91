//! Embeds pending memories and moves them to `ready`.

use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use time::Duration;

use lore_config::{Config, EmbeddingProviderConfig};
use lore_domain::Memory;

use crate::{EmbeddingProvider, EmbeddingQueue, Error, Providers, Result, insights};

const CLAIM_LEASE: Duration = Duration::minutes(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
	pub claimed: usize,
	pub indexed: usize,
	pub failed: usize,
}

pub struct MemoryIndexer {
	indexing: lore_config::Indexing,
	embedding_cfg: EmbeddingProviderConfig,
	embedding: Arc<dyn EmbeddingProvider>,
	queue: Arc<dyn EmbeddingQueue>,
}
impl MemoryIndexer {
	pub fn new(
		indexing: lore_config::Indexing,
		embedding_cfg: EmbeddingProviderConfig,
		embedding: Arc<dyn EmbeddingProvider>,
		queue: Arc<dyn EmbeddingQueue>,
	) -> Self {
		Self { indexing, embedding_cfg, embedding, queue }
	}

	pub fn from_config(cfg: &Config, providers: &Providers, queue: Arc<dyn EmbeddingQueue>) -> Self {
		Self::new(
			cfg.indexing.clone(),
			cfg.providers.embedding.clone(),
			providers.embedding.clone(),
			queue,
		)
	}

	/// Claims one batch, embeds content and tag text, and stores both vectors with the `ready`
	/// transition. A memory without tags gets no tag embedding.
	///
	/// Provider failures mark every claimed memory failed. Storage failures while claiming are
	/// returned.
	pub async fn index_pending_once(&self) -> Result<IndexReport> {
		let memories = self
			.queue
			.claim_pending(self.indexing.batch_size.max(1), self.indexing.max_attempts, CLAIM_LEASE)
			.await?;
		let mut report = IndexReport { claimed: memories.len(), ..Default::default() };

		if memories.is_empty() {
			return Ok(report);
		}

		let contents: Vec<String> = memories.iter().map(|memory| memory.content.clone()).collect();
		let content_vectors = match self.embed_batch(&contents).await {
			Ok(vectors) => vectors,
			Err(err) => {
				report.failed = self.fail_all(&memories, &err).await;

				return Ok(report);
			},
		};
		let (tagged_positions, tag_texts): (Vec<usize>, Vec<String>) = memories
			.iter()
			.enumerate()
			.filter_map(|(pos, memory)| memory.tag_text().map(|text| (pos, text)))
			.unzip();
		let tag_vectors = if tag_texts.is_empty() {
			Vec::new()
		} else {
			match self.embed_batch(&tag_texts).await {
				Ok(vectors) => vectors,
				Err(err) => {
					report.failed = self.fail_all(&memories, &err).await;

					return Ok(report);
				},
			}
		};
		let mut tags_by_position: HashMap<usize, Vec<f32>> =
			tagged_positions.into_iter().zip(tag_vectors).collect();

		for (pos, (memory, content)) in memories.iter().zip(content_vectors).enumerate() {
			let tags = tags_by_position.remove(&pos);

			match self.queue.store_embeddings(memory.id, &content, tags.as_deref()).await {
				Ok(()) => report.indexed += 1,
				Err(err) => {
					self.fail(memory.id, &err).await;

					report.failed += 1;
				},
			}
		}

		tracing::info!(
			claimed = report.claimed,
			indexed = report.indexed,
			failed = report.failed,
			"Indexed pending memories."
		);

		Ok(report)
	}

	async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
		let vectors = self.embedding.embed(&self.embedding_cfg, texts).await?;

		if vectors.len() != texts.len() {
			return Err(Error::Provider {
				message: "Embedding provider returned mismatched vector count.".to_string(),
			});
		}
		if vectors.iter().any(|vector| vector.len() != self.embedding_cfg.dimensions as usize) {
			return Err(Error::Provider {
				message: "Embedding vector dimension mismatch.".to_string(),
			});
		}

		Ok(vectors)
	}

	async fn fail_all(&self, memories: &[Memory], err: &Error) -> usize {
		tracing::error!(error = %err, count = memories.len(), "Embedding batch failed.");

		for memory in memories {
			self.fail(memory.id, err).await;
		}

		memories.len()
	}

	async fn fail(&self, memory_id: i64, err: &Error) {
		let message = insights::sanitize_error(&err.to_string());

		if let Err(record_err) =
			self.queue.record_failure(memory_id, &message, self.indexing.max_attempts).await
		{
			tracing::error!(error = %record_err, memory_id, "Failed to record embedding failure.");
		}
	}
}
