use std::time::{Duration, Instant};

use color_eyre::Result;

use lore_service::{AsyncInsightProcessor, MemoryIndexer, RetryOutcome, RunOutcome};

pub struct WorkerState {
	pub indexer: MemoryIndexer,
	pub processor: AsyncInsightProcessor,
	pub insight_interval: Duration,
	pub poll_interval: Duration,
}

/// Polls forever. Pass failures are logged and the loop keeps going.
pub async fn run_worker(state: WorkerState) -> Result<()> {
	let mut last_insight_run: Option<Instant> = None;

	tracing::info!(
		insight_interval_secs = state.insight_interval.as_secs(),
		poll_interval_ms = state.poll_interval.as_millis() as u64,
		"Worker started."
	);

	loop {
		if let Err(err) = index_pending(&state).await {
			tracing::error!(error = %err, "Memory indexing failed.");
		}
		if last_insight_run.is_none_or(|at| at.elapsed() >= state.insight_interval) {
			if let Err(err) = run_insights(&state).await {
				tracing::error!(error = %err, "Insight run failed.");
			}

			last_insight_run = Some(Instant::now());
		}
		if let Err(err) = drain_retries(&state).await {
			tracing::error!(error = %err, "Memory retry drain failed.");
		}

		tokio::time::sleep(state.poll_interval).await;
	}
}

/// Runs each pass once and returns the first failure.
pub async fn run_once(state: &WorkerState) -> Result<()> {
	index_pending(state).await?;
	run_insights(state).await?;
	drain_retries(state).await?;

	Ok(())
}

async fn index_pending(state: &WorkerState) -> lore_service::Result<()> {
	let report = state.indexer.index_pending_once().await?;

	if report.claimed > 0 {
		tracing::debug!(
			claimed = report.claimed,
			indexed = report.indexed,
			failed = report.failed,
			"Indexing pass finished."
		);
	}

	Ok(())
}

async fn run_insights(state: &WorkerState) -> lore_service::Result<()> {
	match state.processor.run().await? {
		RunOutcome::Ran(report) => {
			tracing::info!(
				job_id = report.job_id,
				status = %report.status,
				processed = report.processed,
				errors = report.errors,
				insights = report.insights,
				clusters = report.clusters,
				"Insight pass finished."
			);
		},
		RunOutcome::Skipped(_) => tracing::debug!("Insight pass skipped."),
	}

	Ok(())
}

async fn drain_retries(state: &WorkerState) -> lore_service::Result<()> {
	if let RetryOutcome::Ran(report) = state.processor.run_retries().await?
		&& report.claimed > 0
	{
		tracing::info!(
			claimed = report.claimed,
			completed = report.completed,
			rescheduled = report.rescheduled,
			failed = report.failed,
			"Retry drain finished."
		);
	}

	Ok(())
}
