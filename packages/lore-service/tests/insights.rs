use std::{
	collections::{HashMap, HashSet},
	sync::{
		Arc, Mutex,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	},
	time::Duration as StdDuration,
};

use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};

use lore_config::{Clustering, Insights, LlmProviderConfig};
use lore_domain::{Cluster, Memory, MemoryType, ProcessingStatus};
use lore_service::{
	AsyncInsightProcessor, BoxFuture, Error, InsightCandidate, InsightGenerator, InsightStore,
	ProcessorSettings, ProcessorState, Result, RetryOutcome, RunOutcome,
};
use lore_storage::models::{
	JOB_COMPLETED, JOB_FAILED, JOB_PENDING, JOB_PROCESSING, NewInsight, ProcessingJob,
	TASK_BATCH_MEMORY_PROCESSING, TASK_MEMORY_RETRY,
};

#[derive(Debug, Clone, Copy)]
enum Behavior {
	Insights(usize),
	Empty,
	Fail,
	Panic,
}

struct ScriptedGenerator {
	memory_behavior: Mutex<HashMap<i64, Behavior>>,
	cluster_behavior: Mutex<Behavior>,
	delay: Option<StdDuration>,
	calls: Mutex<Vec<String>>,
	memory_calls: AtomicUsize,
}
impl ScriptedGenerator {
	fn new() -> Self {
		Self {
			memory_behavior: Mutex::new(HashMap::new()),
			cluster_behavior: Mutex::new(Behavior::Insights(2)),
			delay: None,
			calls: Mutex::new(Vec::new()),
			memory_calls: AtomicUsize::new(0),
		}
	}

	fn with_delay(delay: StdDuration) -> Self {
		Self { delay: Some(delay), ..Self::new() }
	}

	fn set(&self, memory_id: i64, behavior: Behavior) {
		self.memory_behavior.lock().expect("Behavior lock poisoned.").insert(memory_id, behavior);
	}

	fn set_cluster(&self, behavior: Behavior) {
		*self.cluster_behavior.lock().expect("Behavior lock poisoned.") = behavior;
	}

	fn calls(&self) -> Vec<String> {
		self.calls.lock().expect("Call lock poisoned.").clone()
	}

	fn memory_calls(&self) -> usize {
		self.memory_calls.load(Ordering::SeqCst)
	}

	fn respond(
		&self,
		behavior: Behavior,
		label: String,
	) -> BoxFuture<'_, Result<Vec<InsightCandidate>>> {
		let delay = self.delay;

		Box::pin(async move {
			if let Some(delay) = delay {
				tokio::time::sleep(delay).await;
			}

			match behavior {
				Behavior::Insights(count) => Ok(candidates(count, &label)),
				Behavior::Empty => Ok(Vec::new()),
				Behavior::Fail => {
					Err(Error::Provider { message: format!("generator failed for {label}") })
				},
				Behavior::Panic => panic!("generator exploded for {label}"),
			}
		})
	}
}
impl InsightGenerator for ScriptedGenerator {
	fn generate_for_memory<'a>(
		&'a self,
		_cfg: &'a LlmProviderConfig,
		memory: &'a Memory,
	) -> BoxFuture<'a, Result<Vec<InsightCandidate>>> {
		let label = format!("memory:{}", memory.id);
		let behavior = self
			.memory_behavior
			.lock()
			.expect("Behavior lock poisoned.")
			.get(&memory.id)
			.copied()
			.unwrap_or(Behavior::Insights(1));

		self.calls.lock().expect("Call lock poisoned.").push(label.clone());
		self.memory_calls.fetch_add(1, Ordering::SeqCst);

		self.respond(behavior, label)
	}

	fn generate_for_cluster<'a>(
		&'a self,
		_cfg: &'a LlmProviderConfig,
		cluster: &'a Cluster,
	) -> BoxFuture<'a, Result<Vec<InsightCandidate>>> {
		let label = format!("cluster:{}", cluster.id);
		let behavior = *self.cluster_behavior.lock().expect("Behavior lock poisoned.");

		self.calls.lock().expect("Call lock poisoned.").push(label.clone());

		self.respond(behavior, label)
	}
}

#[derive(Default)]
struct StoreState {
	memories: Vec<Memory>,
	marked: HashSet<i64>,
	jobs: HashMap<i64, ProcessingJob>,
	insights: Vec<NewInsight>,
	next_job_id: i64,
	progress_updates: usize,
}

#[derive(Default)]
struct FakeStore {
	state: Mutex<StoreState>,
	fail_fetch: AtomicBool,
	failing_saves: AtomicUsize,
}
impl FakeStore {
	fn with_memories(memories: Vec<Memory>) -> Self {
		let store = Self::default();

		store.lock().memories = memories;

		store
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
		self.state.lock().expect("Store lock poisoned.")
	}

	fn marked(&self) -> Vec<i64> {
		let mut marked: Vec<i64> = self.lock().marked.iter().copied().collect();

		marked.sort_unstable();

		marked
	}

	fn jobs_of(&self, task_type: &str) -> Vec<ProcessingJob> {
		let mut jobs: Vec<ProcessingJob> =
			self.lock().jobs.values().filter(|job| job.task_type == task_type).cloned().collect();

		jobs.sort_by_key(|job| job.id);

		jobs
	}

	fn insert_job(
		state: &mut StoreState,
		task_type: &str,
		source_ids: Vec<i64>,
		status: &str,
		payload: Value,
		error_message: Option<String>,
	) -> i64 {
		state.next_job_id += 1;

		let id = state.next_job_id;
		let now = OffsetDateTime::now_utc();

		state.jobs.insert(
			id,
			ProcessingJob {
				id,
				task_type: task_type.to_string(),
				source_ids,
				status: status.to_string(),
				payload,
				attempts: 0,
				error_message,
				available_at: now,
				created_at: now,
				started_at: (status == JOB_PROCESSING).then_some(now),
				completed_at: None,
			},
		);

		id
	}

	fn job_mut<'s>(state: &'s mut StoreState, job_id: i64) -> Result<&'s mut ProcessingJob> {
		state
			.jobs
			.get_mut(&job_id)
			.ok_or_else(|| Error::NotFound { message: format!("job {job_id}") })
	}
}
impl InsightStore for FakeStore {
	fn fetch_unprocessed<'a>(&'a self, limit: u32) -> BoxFuture<'a, Result<Vec<Memory>>> {
		let result = if self.fail_fetch.load(Ordering::SeqCst) {
			Err(Error::Storage { message: "connection refused".to_string() })
		} else {
			let state = self.lock();
			let mut rows: Vec<Memory> = state
				.memories
				.iter()
				.filter(|memory| !state.marked.contains(&memory.id))
				.cloned()
				.collect();

			rows.sort_by(|lhs, rhs| {
				rhs.importance_score
					.total_cmp(&lhs.importance_score)
					.then_with(|| rhs.created_at.cmp(&lhs.created_at))
			});
			rows.truncate(limit as usize);

			Ok(rows)
		};

		Box::pin(async move { result })
	}

	fn fetch_memory<'a>(&'a self, memory_id: i64) -> BoxFuture<'a, Result<Option<Memory>>> {
		let memory = self.lock().memories.iter().find(|memory| memory.id == memory_id).cloned();

		Box::pin(async move { Ok(memory) })
	}

	fn start_job<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, Result<i64>> {
		let id = Self::insert_job(
			&mut self.lock(),
			TASK_BATCH_MEMORY_PROCESSING,
			Vec::new(),
			JOB_PROCESSING,
			payload.clone(),
			None,
		);

		Box::pin(async move { Ok(id) })
	}

	fn update_progress<'a>(
		&'a self,
		job_id: i64,
		source_ids: Option<&'a [i64]>,
		payload: &'a Value,
	) -> BoxFuture<'a, Result<()>> {
		let mut state = self.lock();

		state.progress_updates += 1;

		let result = Self::job_mut(&mut state, job_id).map(|job| {
			if let Some(ids) = source_ids {
				job.source_ids = ids.to_vec();
			}

			job.payload = payload.clone();
		});

		Box::pin(async move { result })
	}

	fn finish_job<'a>(
		&'a self,
		job_id: i64,
		status: &'a str,
		payload: &'a Value,
		error_message: Option<&'a str>,
	) -> BoxFuture<'a, Result<()>> {
		let result = Self::job_mut(&mut self.lock(), job_id).map(|job| {
			job.status = status.to_string();
			job.payload = payload.clone();
			job.error_message = error_message.map(str::to_string);
			job.completed_at = Some(OffsetDateTime::now_utc());
		});

		Box::pin(async move { result })
	}

	fn fetch_job<'a>(&'a self, job_id: i64) -> BoxFuture<'a, Result<Option<ProcessingJob>>> {
		let job = self.lock().jobs.get(&job_id).cloned();

		Box::pin(async move { Ok(job) })
	}

	fn save_insights<'a>(
		&'a self,
		insights: &'a [NewInsight],
		sources: &'a [Memory],
	) -> BoxFuture<'a, Result<()>> {
		let failing = self
			.failing_saves
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
			.is_ok();
		let result = if failing {
			Err(Error::Storage { message: "insert aborted".to_string() })
		} else {
			let mut state = self.lock();

			state.insights.extend(insights.iter().cloned());
			state.marked.extend(sources.iter().map(|memory| memory.id));

			Ok(())
		};

		Box::pin(async move { result })
	}

	fn has_processing_marker<'a>(&'a self, memory_id: i64) -> BoxFuture<'a, Result<bool>> {
		let marked = self.lock().marked.contains(&memory_id);

		Box::pin(async move { Ok(marked) })
	}

	fn record_retry<'a>(&'a self, memory_id: i64, error: &'a str) -> BoxFuture<'a, Result<i64>> {
		let mut state = self.lock();
		let open = state
			.jobs
			.values()
			.filter(|job| {
				job.task_type == TASK_MEMORY_RETRY
					&& job.source_ids == [memory_id]
					&& (job.status == JOB_PENDING || job.status == JOB_PROCESSING)
			})
			.map(|job| job.id)
			.min();
		let id = open.unwrap_or_else(|| {
			Self::insert_job(
				&mut state,
				TASK_MEMORY_RETRY,
				vec![memory_id],
				JOB_PENDING,
				serde_json::json!({ "memory_id": memory_id }),
				Some(error.to_string()),
			)
		});

		Box::pin(async move { Ok(id) })
	}

	fn claim_retries<'a>(
		&'a self,
		limit: u32,
		_lease: Duration,
	) -> BoxFuture<'a, Result<Vec<ProcessingJob>>> {
		let mut state = self.lock();
		let mut claimed: Vec<ProcessingJob> = Vec::new();
		let mut ids: Vec<i64> = state
			.jobs
			.values()
			.filter(|job| job.task_type == TASK_MEMORY_RETRY && job.status == JOB_PENDING)
			.map(|job| job.id)
			.collect();

		ids.sort_unstable();
		ids.truncate(limit as usize);

		for id in ids {
			if let Some(job) = state.jobs.get_mut(&id) {
				job.status = JOB_PROCESSING.to_string();

				claimed.push(job.clone());
			}
		}

		Box::pin(async move { Ok(claimed) })
	}

	fn complete_retry<'a>(&'a self, job_id: i64) -> BoxFuture<'a, Result<()>> {
		let result = Self::job_mut(&mut self.lock(), job_id).map(|job| {
			job.status = JOB_COMPLETED.to_string();
			job.attempts += 1;
		});

		Box::pin(async move { result })
	}

	fn reschedule_retry<'a>(
		&'a self,
		job_id: i64,
		error: &'a str,
		delay: Duration,
		terminal: bool,
	) -> BoxFuture<'a, Result<()>> {
		let result = Self::job_mut(&mut self.lock(), job_id).map(|job| {
			job.status = if terminal { JOB_FAILED } else { JOB_PENDING }.to_string();
			job.attempts += 1;
			job.error_message = Some(error.to_string());
			job.available_at = OffsetDateTime::now_utc() + delay;
		});

		Box::pin(async move { result })
	}
}

fn settings(clustering_enabled: bool) -> ProcessorSettings {
	ProcessorSettings {
		insights: Insights {
			max_memories_per_run: 1_000,
			batch_size: 2,
			max_insights_per_item: 5,
			interval_secs: 300,
			retry_batch_size: 10,
			max_retry_attempts: 2,
		},
		clustering: Clustering {
			enabled: clustering_enabled,
			min_cluster_size: 3,
			direct_match_threshold: 0.65,
			hybrid_threshold: 0.5,
			embedding_weight: 0.5,
			tag_weight: 0.3,
			time_weight: 0.2,
			max_window_days: 30.0,
		},
		llm: LlmProviderConfig {
			provider_id: "test".to_string(),
			api_base: "http://127.0.0.1:1".to_string(),
			api_key: "test-key".to_string(),
			path: "/chat/completions".to_string(),
			model: "test-llm".to_string(),
			temperature: 0.1,
			timeout_ms: 1_000,
			default_headers: Map::new(),
		},
	}
}

fn candidates(count: usize, label: &str) -> Vec<InsightCandidate> {
	(0..count)
		.map(|i| InsightCandidate {
			insight_type: "pattern".to_string(),
			title: format!("{label} insight {i}"),
			content: format!("Observed pattern {i} in {label}."),
			confidence: 0.8,
			tags: Vec::new(),
		})
		.collect()
}

fn memory(id: i64, memory_type: MemoryType, embedding: Vec<f32>) -> Memory {
	Memory {
		id,
		project_id: 1,
		session_id: None,
		content: format!("memory {id}"),
		summary: None,
		content_embedding: Some(embedding),
		tag_embedding: None,
		smart_tags: Vec::new(),
		memory_type,
		importance_score: 0.5,
		processing_status: ProcessingStatus::Ready,
		created_at: OffsetDateTime::now_utc() - Duration::days(id),
	}
}

/// Memories of distinct types never cluster, so each is processed on its own.
fn single(id: i64) -> Memory {
	let memory_type = MemoryType::ALL[(id as usize) % MemoryType::ALL.len()];

	memory(id, memory_type, vec![1.0, 0.0, 0.0])
}

fn processor(store: Arc<FakeStore>, generator: Arc<ScriptedGenerator>) -> AsyncInsightProcessor {
	AsyncInsightProcessor::new(settings(true), store, generator)
}

fn ran(outcome: RunOutcome) -> lore_service::RunReport {
	match outcome {
		RunOutcome::Ran(report) => report,
		RunOutcome::Skipped(_) => panic!("Run was unexpectedly skipped."),
	}
}

#[tokio::test]
async fn zero_insight_memories_stay_eligible() {
	let store = Arc::new(FakeStore::with_memories(vec![single(1), single(2)]));
	let generator = Arc::new(ScriptedGenerator::new());

	generator.set(1, Behavior::Empty);

	let processor = processor(store.clone(), generator.clone());
	let report = ran(processor.run().await.expect("Run failed."));

	assert_eq!(report.status, JOB_COMPLETED);
	assert_eq!(report.processed, 2);
	assert_eq!(report.insights, 1);
	assert_eq!(store.marked(), vec![2]);

	let second = ran(processor.run().await.expect("Run failed."));

	assert_eq!(second.processed, 1);
	assert_eq!(generator.calls().iter().filter(|call| *call == "memory:1").count(), 2);
	assert_eq!(generator.calls().iter().filter(|call| *call == "memory:2").count(), 1);
}

#[tokio::test]
async fn item_failures_are_isolated_and_queued_for_retry() {
	let store = Arc::new(FakeStore::with_memories(vec![single(1), single(2), single(3), single(4)]));
	let generator = Arc::new(ScriptedGenerator::new());

	generator.set(2, Behavior::Fail);
	generator.set(3, Behavior::Panic);

	let processor = processor(store.clone(), generator);
	let report = ran(processor.run().await.expect("Run failed."));

	assert_eq!(report.status, JOB_COMPLETED);
	assert_eq!(report.processed, 2);
	assert_eq!(report.errors, 2);
	assert_eq!(store.marked(), vec![1, 4]);

	let retries = store.jobs_of(TASK_MEMORY_RETRY);
	let retried: Vec<i64> = retries.iter().map(|job| job.source_ids[0]).collect();

	assert_eq!(retried, vec![2, 3]);
	assert!(retries.iter().all(|job| job.status == JOB_PENDING && job.error_message.is_some()));
	assert_eq!(processor.state(), ProcessorState::Idle);
}

#[tokio::test]
async fn clusters_are_processed_before_singles() {
	let mut memories: Vec<Memory> =
		(1..=3).map(|id| memory(id, MemoryType::Decision, vec![0.0, 1.0, 0.0])).collect();

	memories.push(memory(4, MemoryType::Bug, vec![1.0, 0.0, 0.0]));

	let store = Arc::new(FakeStore::with_memories(memories));
	let generator = Arc::new(ScriptedGenerator::new());
	let processor = processor(store.clone(), generator.clone());
	let report = ran(processor.run().await.expect("Run failed."));

	assert_eq!(report.clusters, 1);
	assert_eq!(report.processed, 4);
	assert_eq!(report.insights, 3);
	assert_eq!(generator.calls(), vec!["cluster:decision-1".to_string(), "memory:4".to_string()]);
	assert_eq!(store.marked(), vec![1, 2, 3, 4]);

	let state = store.lock();
	let cluster_insights: Vec<&NewInsight> =
		state.insights.iter().filter(|insight| insight.cluster_key.is_some()).collect();

	assert_eq!(cluster_insights.len(), 2);
	assert!(cluster_insights.iter().all(|insight| insight.source_memory_ids.len() == 3));

	let job = state
		.jobs
		.values()
		.find(|job| job.task_type == TASK_BATCH_MEMORY_PROCESSING)
		.expect("Batch job should exist.");

	assert_eq!(job.payload["clusters"], 1);
	assert_eq!(job.payload["clustered_memories"], 3);
	assert_eq!(job.payload["total"], 4);
}

#[tokio::test]
async fn failed_cluster_members_fall_back_to_single_processing() {
	let memories: Vec<Memory> =
		(1..=3).map(|id| memory(id, MemoryType::Decision, vec![0.0, 1.0, 0.0])).collect();
	let store = Arc::new(FakeStore::with_memories(memories));
	let generator = Arc::new(ScriptedGenerator::new());

	generator.set_cluster(Behavior::Fail);

	let processor = processor(store.clone(), generator.clone());
	let report = ran(processor.run().await.expect("Run failed."));

	assert_eq!(report.processed, 3);
	assert_eq!(report.errors, 0);
	assert_eq!(generator.memory_calls(), 3);
	assert_eq!(store.marked(), vec![1, 2, 3]);
}

#[tokio::test]
async fn failed_cluster_write_leaves_nothing_behind() {
	let memories: Vec<Memory> =
		(1..=3).map(|id| memory(id, MemoryType::Decision, vec![0.0, 1.0, 0.0])).collect();
	let store = Arc::new(FakeStore::with_memories(memories));
	let generator = Arc::new(ScriptedGenerator::new());

	store.failing_saves.store(1, Ordering::SeqCst);

	let processor = processor(store.clone(), generator.clone());
	let report = ran(processor.run().await.expect("Run failed."));

	assert_eq!(report.processed, 3);
	assert_eq!(report.insights, 3);
	assert_eq!(generator.calls()[0], "cluster:decision-1");
	assert_eq!(generator.memory_calls(), 3);
	assert_eq!(store.marked(), vec![1, 2, 3]);

	let state = store.lock();

	assert_eq!(state.insights.len(), 3);
	assert!(state.insights.iter().all(|insight| insight.cluster_key.is_none()));
	assert!(state.insights.iter().all(|insight| insight.source_memory_ids.len() == 1));
}

#[tokio::test]
async fn cluster_without_insights_marks_nothing_but_counts_members() {
	let memories: Vec<Memory> =
		(1..=3).map(|id| memory(id, MemoryType::Decision, vec![0.0, 1.0, 0.0])).collect();
	let store = Arc::new(FakeStore::with_memories(memories));
	let generator = Arc::new(ScriptedGenerator::new());

	generator.set_cluster(Behavior::Empty);

	let processor = processor(store.clone(), generator.clone());
	let report = ran(processor.run().await.expect("Run failed."));

	assert_eq!(report.processed, 3);
	assert_eq!(report.insights, 0);
	assert_eq!(generator.memory_calls(), 0);
	assert!(store.marked().is_empty());
}

#[tokio::test]
async fn disabled_clustering_processes_everything_individually() {
	let memories: Vec<Memory> =
		(1..=3).map(|id| memory(id, MemoryType::Decision, vec![0.0, 1.0, 0.0])).collect();
	let store = Arc::new(FakeStore::with_memories(memories));
	let generator = Arc::new(ScriptedGenerator::new());
	let processor = AsyncInsightProcessor::new(settings(false), store.clone(), generator.clone());
	let report = ran(processor.run().await.expect("Run failed."));

	assert_eq!(report.clusters, 0);
	assert_eq!(generator.memory_calls(), 3);
}

#[tokio::test]
async fn job_is_finalized_with_counts() {
	let store = Arc::new(FakeStore::with_memories(vec![single(1), single(2), single(3)]));
	let generator = Arc::new(ScriptedGenerator::new());

	generator.set(3, Behavior::Fail);

	let processor = processor(store.clone(), generator);
	let report = ran(processor.run().await.expect("Run failed."));
	let job = processor.job_status(report.job_id).await.expect("Job should exist.");

	assert_eq!(job.status, JOB_COMPLETED);
	assert_eq!(job.source_ids, vec![1, 2, 3]);
	assert_eq!(job.payload["processed"], 2);
	assert_eq!(job.payload["errors"], 1);
	assert_eq!(job.payload["insights"], 2);
	assert!(job.payload.get("duration_ms").is_some());
	assert!(job.completed_at.is_some());
	assert!(store.lock().progress_updates >= 3);

	let missing = processor.job_status(999).await;

	assert!(matches!(missing, Err(Error::NotFound { .. })));
}

#[tokio::test]
async fn run_failure_is_recorded_and_releases_the_flag() {
	let store = Arc::new(FakeStore::with_memories(vec![single(1)]));
	let processor = processor(store.clone(), Arc::new(ScriptedGenerator::new()));

	store.fail_fetch.store(true, Ordering::SeqCst);

	let failed = ran(processor.run().await.expect("Run should report failure."));
	let job = processor.job_status(failed.job_id).await.expect("Job should exist.");

	assert_eq!(failed.status, JOB_FAILED);
	assert_eq!(job.status, JOB_FAILED);
	assert!(job.error_message.as_deref().is_some_and(|message| message.contains("refused")));
	assert_eq!(processor.state(), ProcessorState::Idle);

	store.fail_fetch.store(false, Ordering::SeqCst);

	let recovered = ran(processor.run().await.expect("Run failed."));

	assert_eq!(recovered.status, JOB_COMPLETED);
	assert_eq!(recovered.processed, 1);
}

#[tokio::test]
async fn concurrent_trigger_is_skipped() {
	let store = Arc::new(FakeStore::with_memories(vec![single(1)]));
	let generator = Arc::new(ScriptedGenerator::with_delay(StdDuration::from_millis(100)));
	let processor = processor(store.clone(), generator);
	let (first, (state, second)) = tokio::join!(processor.run(), async {
		tokio::time::sleep(StdDuration::from_millis(20)).await;

		(processor.state(), processor.run().await)
	});
	let second = second.expect("Second trigger failed.");

	assert!(!first.expect("First run failed.").is_skipped());
	assert_eq!(state, ProcessorState::Processing);
	assert!(second.is_skipped());
	assert_eq!(
		serde_json::to_value(&second).expect("Serialize failed."),
		serde_json::json!({ "skipped": true })
	);
	assert_eq!(store.jobs_of(TASK_BATCH_MEMORY_PROCESSING).len(), 1);
	assert_eq!(processor.state(), ProcessorState::Idle);
}

#[tokio::test]
async fn retries_succeed_once_the_generator_recovers() {
	let store = Arc::new(FakeStore::with_memories(vec![single(1), single(2)]));
	let generator = Arc::new(ScriptedGenerator::new());

	generator.set(2, Behavior::Fail);

	let processor = processor(store.clone(), generator.clone());

	ran(processor.run().await.expect("Run failed."));
	generator.set(2, Behavior::Insights(1));

	let outcome = processor.run_retries().await.expect("Retry drain failed.");
	let RetryOutcome::Ran(report) = outcome else {
		panic!("Retry drain was unexpectedly skipped.");
	};

	assert_eq!(report.claimed, 1);
	assert_eq!(report.completed, 1);
	assert_eq!(store.marked(), vec![1, 2]);
	assert_eq!(store.jobs_of(TASK_MEMORY_RETRY)[0].status, JOB_COMPLETED);
}

#[tokio::test]
async fn retries_give_up_after_max_attempts() {
	let store = Arc::new(FakeStore::with_memories(vec![single(1)]));
	let generator = Arc::new(ScriptedGenerator::new());

	generator.set(1, Behavior::Fail);

	let processor = processor(store.clone(), generator);

	ran(processor.run().await.expect("Run failed."));

	let RetryOutcome::Ran(first) = processor.run_retries().await.expect("Retry drain failed.")
	else {
		panic!("Retry drain was unexpectedly skipped.");
	};

	assert_eq!(first.rescheduled, 1);
	assert_eq!(store.jobs_of(TASK_MEMORY_RETRY)[0].status, JOB_PENDING);

	let RetryOutcome::Ran(second) = processor.run_retries().await.expect("Retry drain failed.")
	else {
		panic!("Retry drain was unexpectedly skipped.");
	};

	assert_eq!(second.failed, 1);

	let job = &store.jobs_of(TASK_MEMORY_RETRY)[0];

	assert_eq!(job.status, JOB_FAILED);
	assert_eq!(job.attempts, 2);
	assert!(store.marked().is_empty());
}

#[tokio::test]
async fn repeated_failures_keep_one_open_retry() {
	let store = Arc::new(FakeStore::with_memories(vec![single(1)]));
	let generator = Arc::new(ScriptedGenerator::new());

	generator.set(1, Behavior::Fail);

	let processor = processor(store.clone(), generator);

	ran(processor.run().await.expect("Run failed."));
	ran(processor.run().await.expect("Run failed."));

	let retries = store.jobs_of(TASK_MEMORY_RETRY);

	assert_eq!(retries.len(), 1);
	assert_eq!(retries[0].status, JOB_PENDING);
	assert_eq!(retries[0].source_ids, vec![1]);
}

#[tokio::test]
async fn retry_for_an_already_processed_memory_is_closed_without_generating() {
	let store = Arc::new(FakeStore::with_memories(vec![single(1)]));
	let generator = Arc::new(ScriptedGenerator::new());

	generator.set(1, Behavior::Fail);

	let processor = processor(store.clone(), generator.clone());

	ran(processor.run().await.expect("Run failed."));
	generator.set(1, Behavior::Insights(1));

	let recovered = ran(processor.run().await.expect("Run failed."));

	assert_eq!(recovered.insights, 1);
	assert_eq!(store.marked(), vec![1]);

	let calls_before_drain = generator.memory_calls();
	let RetryOutcome::Ran(report) = processor.run_retries().await.expect("Retry drain failed.")
	else {
		panic!("Retry drain was unexpectedly skipped.");
	};

	assert_eq!(report.claimed, 1);
	assert_eq!(report.completed, 1);
	assert_eq!(generator.memory_calls(), calls_before_drain);
	assert_eq!(store.lock().insights.len(), 1);
	assert_eq!(store.jobs_of(TASK_MEMORY_RETRY)[0].status, JOB_COMPLETED);
}
