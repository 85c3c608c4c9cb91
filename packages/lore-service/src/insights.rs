//! Batch insight mining over unprocessed memories.
//!
//! A run fetches ready memories without a processing marker, clusters them, asks the generator for
//! insights per cluster and then per remaining memory, and writes a marker for every memory that
//! yielded at least one insight. Only one run (or retry drain) executes at a time per processor.

mod candidate;
mod retry;

pub use candidate::{InsightCandidate, parse_candidates};
pub use retry::{RetryOutcome, RetryReport};

pub(crate) use candidate::{cluster_messages, memory_messages};

use std::{
	any::Any,
	borrow::Cow,
	panic::AssertUnwindSafe,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	time::Instant,
};

use futures::{FutureExt, future};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use lore_config::{Config, LlmProviderConfig};
use lore_domain::{Cluster, ClusteringOutcome, Memory, MemoryClusterer};
use lore_storage::models::{JOB_COMPLETED, JOB_FAILED, NewInsight, ProcessingJob};

use crate::{Error, InsightGenerator, InsightStore, Providers, Result};

const MAX_ERROR_CHARS: usize = 1_024;
const REDACTED: &str = "[REDACTED]";
const SECRET_KEYS: [&str; 5] = ["api_key", "apikey", "password", "secret", "token"];

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
	pub insights: lore_config::Insights,
	pub clustering: lore_config::Clustering,
	pub llm: LlmProviderConfig,
}
impl ProcessorSettings {
	pub fn from_config(cfg: &Config) -> Self {
		Self {
			insights: cfg.insights.clone(),
			clustering: cfg.clustering.clone(),
			llm: cfg.providers.llm_insight.clone(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorState {
	Idle,
	Processing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
	pub job_id: i64,
	pub status: String,
	pub processed: usize,
	pub errors: usize,
	pub insights: usize,
	pub clusters: usize,
	pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SkippedRun {
	pub skipped: bool,
}
impl SkippedRun {
	const ALREADY_RUNNING: Self = Self { skipped: true };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RunOutcome {
	Ran(RunReport),
	Skipped(SkippedRun),
}
impl RunOutcome {
	pub fn is_skipped(&self) -> bool {
		matches!(self, Self::Skipped(_))
	}

	pub fn report(&self) -> Option<&RunReport> {
		match self {
			Self::Ran(report) => Some(report),
			Self::Skipped(_) => None,
		}
	}
}

/// Persisted view of a processing job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
	pub id: i64,
	pub task_type: String,
	pub status: String,
	pub source_ids: Vec<i64>,
	pub payload: Value,
	pub attempts: i32,
	pub error_message: Option<String>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	#[serde(with = "time::serde::rfc3339::option")]
	pub started_at: Option<OffsetDateTime>,
	#[serde(with = "time::serde::rfc3339::option")]
	pub completed_at: Option<OffsetDateTime>,
}
impl From<ProcessingJob> for JobView {
	fn from(job: ProcessingJob) -> Self {
		Self {
			id: job.id,
			task_type: job.task_type,
			status: job.status,
			source_ids: job.source_ids,
			payload: job.payload,
			attempts: job.attempts,
			error_message: job.error_message,
			created_at: job.created_at,
			started_at: job.started_at,
			completed_at: job.completed_at,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
	total: usize,
	clusters: usize,
	clustered_memories: usize,
	processed: usize,
	errors: usize,
	insights: usize,
}
impl Progress {
	fn payload(&self) -> Value {
		serde_json::json!({
			"total": self.total,
			"clusters": self.clusters,
			"clustered_memories": self.clustered_memories,
			"processed": self.processed,
			"errors": self.errors,
			"insights": self.insights,
		})
	}
}

/// Clears the in-flight flag when a run ends, including on early return or panic.
struct RunGuard<'a> {
	flag: &'a AtomicBool,
}
impl<'a> RunGuard<'a> {
	fn acquire(flag: &'a AtomicBool) -> Option<Self> {
		flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.ok()
			.map(|_| Self { flag })
	}
}
impl Drop for RunGuard<'_> {
	fn drop(&mut self) {
		self.flag.store(false, Ordering::Release);
	}
}

pub struct AsyncInsightProcessor {
	settings: ProcessorSettings,
	store: Arc<dyn InsightStore>,
	generator: Arc<dyn InsightGenerator>,
	running: AtomicBool,
}
impl AsyncInsightProcessor {
	pub fn new(
		settings: ProcessorSettings,
		store: Arc<dyn InsightStore>,
		generator: Arc<dyn InsightGenerator>,
	) -> Self {
		Self { settings, store, generator, running: AtomicBool::new(false) }
	}

	pub fn from_config(cfg: &Config, providers: &Providers, store: Arc<dyn InsightStore>) -> Self {
		Self::new(ProcessorSettings::from_config(cfg), store, providers.insights.clone())
	}

	pub fn state(&self) -> ProcessorState {
		if self.running.load(Ordering::Acquire) {
			ProcessorState::Processing
		} else {
			ProcessorState::Idle
		}
	}

	pub async fn job_status(&self, job_id: i64) -> Result<JobView> {
		let job = self.store.fetch_job(job_id).await?.ok_or_else(|| Error::NotFound {
			message: format!("Processing job {job_id} does not exist."),
		})?;

		Ok(job.into())
	}

	/// Runs one insight pass. Returns [`RunOutcome::Skipped`] without touching storage when a run
	/// is already in flight.
	///
	/// Once the job row exists its final status is always written, also when processing fails or
	/// panics.
	pub async fn run(&self) -> Result<RunOutcome> {
		let Some(_guard) = RunGuard::acquire(&self.running) else {
			tracing::info!("Insight run skipped because another run is in progress.");

			return Ok(RunOutcome::Skipped(SkippedRun::ALREADY_RUNNING));
		};
		let started = Instant::now();
		let job_id = self.store.start_job(&Progress::default().payload()).await?;

		tracing::info!(job_id, "Insight run started.");

		let mut progress = Progress::default();
		let outcome = AssertUnwindSafe(self.process(job_id, &mut progress)).catch_unwind().await;
		let (status, error_message) = match outcome {
			Ok(Ok(())) => (JOB_COMPLETED, None),
			Ok(Err(err)) => {
				tracing::error!(error = %err, job_id, "Insight run failed.");

				(JOB_FAILED, Some(sanitize_error(&err.to_string())))
			},
			Err(panic) => {
				let message = format!("Insight run panicked: {}", panic_message(panic.as_ref()));

				tracing::error!(job_id, "{message}");

				(JOB_FAILED, Some(sanitize_error(&message)))
			},
		};
		let duration_ms = started.elapsed().as_millis() as u64;
		let mut payload = progress.payload();

		if let Value::Object(map) = &mut payload {
			map.insert("duration_ms".to_string(), Value::from(duration_ms));
		}

		self.store.finish_job(job_id, status, &payload, error_message.as_deref()).await?;

		tracing::info!(
			job_id,
			status,
			processed = progress.processed,
			errors = progress.errors,
			insights = progress.insights,
			duration_ms,
			"Insight run finished."
		);

		Ok(RunOutcome::Ran(RunReport {
			job_id,
			status: status.to_string(),
			processed: progress.processed,
			errors: progress.errors,
			insights: progress.insights,
			clusters: progress.clusters,
			duration_ms,
		}))
	}

	async fn process(&self, job_id: i64, progress: &mut Progress) -> Result<()> {
		let limit =
			self.settings.insights.max_memories_per_run.min(lore_config::MAX_MEMORIES_PER_RUN);
		let memories = self.store.fetch_unprocessed(limit).await?;
		let source_ids: Vec<i64> = memories.iter().map(|memory| memory.id).collect();
		let ClusteringOutcome { clusters, mut unclustered } = self.cluster(memories);

		progress.total = source_ids.len();
		progress.clusters = clusters.len();
		progress.clustered_memories = clusters.iter().map(Cluster::len).sum();

		self.store.update_progress(job_id, Some(&source_ids), &progress.payload()).await?;

		for cluster in clusters {
			match self.process_cluster(job_id, &cluster).await {
				Ok(saved) => {
					progress.processed += cluster.len();
					progress.insights += saved;
				},
				Err(err) => {
					tracing::warn!(
						error = %err,
						cluster_id = %cluster.id,
						"Cluster processing failed. Processing members individually."
					);

					unclustered.extend(cluster.members);
				},
			}
		}

		let batch_size = (self.settings.insights.batch_size as usize).max(1);

		for batch in unclustered.chunks(batch_size) {
			let outcomes =
				future::join_all(batch.iter().map(|memory| self.process_isolated(memory))).await;

			for (memory, outcome) in batch.iter().zip(outcomes) {
				match outcome {
					Ok(saved) => {
						progress.processed += 1;
						progress.insights += saved;
					},
					Err(err) => {
						progress.errors += 1;

						tracing::error!(
							error = %err,
							memory_id = memory.id,
							"Memory insight generation failed."
						);

						self.enqueue_retry(memory.id, &err).await;
					},
				}
			}

			self.store.update_progress(job_id, None, &progress.payload()).await?;
		}

		Ok(())
	}

	fn cluster(&self, memories: Vec<Memory>) -> ClusteringOutcome {
		if !self.settings.clustering.enabled || memories.is_empty() {
			return ClusteringOutcome::all_unclustered(memories);
		}

		let clusterer = MemoryClusterer::new(&self.settings.clustering);

		match clusterer.group_indices(&memories) {
			Ok(grouping) => ClusteringOutcome::from_grouping(memories, grouping),
			Err(err) => {
				tracing::warn!(
					error = %err,
					"Clustering failed. Treating all memories as unclustered."
				);

				ClusteringOutcome::all_unclustered(memories)
			},
		}
	}

	/// Returns the number of insights saved. Members are marked only when at least one was saved, in
	/// the same write as the insights, so a failure leaves nothing behind for the individual pass.
	async fn process_cluster(&self, job_id: i64, cluster: &Cluster) -> Result<usize> {
		let candidates = self.generator.generate_for_cluster(&self.settings.llm, cluster).await?;
		let valid = candidate::validate_candidates(candidates, self.max_insights_per_item());

		if valid.is_empty() {
			tracing::debug!(cluster_id = %cluster.id, "Cluster yielded no insights.");

			return Ok(0);
		}

		let source_ids = cluster.member_ids();
		let cluster_key = format!("job-{job_id}:{}", cluster.id);
		let records: Vec<NewInsight> = valid
			.iter()
			.map(|insight| {
				new_insight(insight, cluster.project_id(), &source_ids, Some(&cluster_key))
			})
			.collect();

		self.store.save_insights(&records, &cluster.members).await?;

		Ok(records.len())
	}

	async fn process_isolated(&self, memory: &Memory) -> Result<usize> {
		match AssertUnwindSafe(self.process_memory(memory)).catch_unwind().await {
			Ok(result) => result,
			Err(panic) => Err(Error::Internal {
				message: format!("Memory processing panicked: {}", panic_message(panic.as_ref())),
			}),
		}
	}

	/// Returns the number of insights saved. The memory is marked only when at least one was saved.
	async fn process_memory(&self, memory: &Memory) -> Result<usize> {
		let candidates = self.generator.generate_for_memory(&self.settings.llm, memory).await?;
		let valid = candidate::validate_candidates(candidates, self.max_insights_per_item());

		if valid.is_empty() {
			tracing::debug!(memory_id = memory.id, "Memory yielded no insights.");

			return Ok(0);
		}

		let records: Vec<NewInsight> = valid
			.iter()
			.map(|insight| new_insight(insight, Some(memory.project_id), &[memory.id], None))
			.collect();

		self.store.save_insights(&records, std::slice::from_ref(memory)).await?;

		Ok(records.len())
	}

	async fn enqueue_retry(&self, memory_id: i64, err: &Error) {
		let message = sanitize_error(&err.to_string());

		if let Err(retry_err) = self.store.record_retry(memory_id, &message).await {
			tracing::error!(error = %retry_err, memory_id, "Failed to enqueue memory retry.");
		}
	}

	fn max_insights_per_item(&self) -> usize {
		(self.settings.insights.max_insights_per_item as usize).max(1)
	}
}

/// Redacts the word after `Bearer` and the value of any `key=value` or `key:value` word whose key
/// names a secret. The result is cut to [`MAX_ERROR_CHARS`] characters.
pub(crate) fn sanitize_error(text: &str) -> String {
	let mut words = text.split_whitespace();
	let mut kept: Vec<Cow<'_, str>> = Vec::new();

	while let Some(word) = words.next() {
		if word.eq_ignore_ascii_case("bearer") {
			kept.push(Cow::Borrowed(word));

			if words.next().is_some() {
				kept.push(Cow::Borrowed(REDACTED));
			}

			continue;
		}

		kept.push(redact_assignment(word));
	}

	let mut sanitized = kept.join(" ");

	if let Some((cut, _)) = sanitized.char_indices().nth(MAX_ERROR_CHARS) {
		sanitized.truncate(cut);
	}

	sanitized
}

fn redact_assignment(word: &str) -> Cow<'_, str> {
	let Some(split) = word.find(['=', ':']) else {
		return Cow::Borrowed(word);
	};
	let key = word[..split].to_ascii_lowercase();

	if SECRET_KEYS.iter().any(|secret| key.contains(secret)) {
		Cow::Owned(format!("{}{REDACTED}", &word[..=split]))
	} else {
		Cow::Borrowed(word)
	}
}

fn new_insight(
	candidate: &InsightCandidate,
	project_id: Option<i64>,
	source_ids: &[i64],
	cluster_key: Option<&str>,
) -> NewInsight {
	NewInsight {
		project_id,
		insight_type: candidate.insight_type.clone(),
		title: candidate.title.clone(),
		content: candidate.content.clone(),
		confidence: candidate.confidence,
		tags: candidate.tags.clone(),
		source_memory_ids: source_ids.to_vec(),
		cluster_key: cluster_key.map(str::to_string),
	}
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
	if let Some(message) = panic.downcast_ref::<&str>() {
		return (*message).to_string();
	}
	if let Some(message) = panic.downcast_ref::<String>() {
		return message.clone();
	}

	"unknown panic payload".to_string()
}
