use serde::Serialize;
use time::Duration;

use lore_storage::models::ProcessingJob;

use crate::{
	Error, Result,
	insights::{AsyncInsightProcessor, RunGuard, SkippedRun, sanitize_error},
};

const BASE_BACKOFF_MS: i64 = 500;
const MAX_BACKOFF_MS: i64 = 30_000;
const RETRY_LEASE: Duration = Duration::minutes(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
	pub claimed: usize,
	pub completed: usize,
	pub rescheduled: usize,
	pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RetryOutcome {
	Ran(RetryReport),
	Skipped(SkippedRun),
}
impl RetryOutcome {
	pub fn is_skipped(&self) -> bool {
		matches!(self, Self::Skipped(_))
	}
}

impl AsyncInsightProcessor {
	/// Drains due `memory_retry` jobs. Shares the in-flight flag with [`Self::run`].
	///
	/// A retry whose memory already carries a processing marker completes without generating again.
	/// A failed retry is rescheduled with exponential backoff until `max_retry_attempts` is reached,
	/// after which the job is marked failed.
	pub async fn run_retries(&self) -> Result<RetryOutcome> {
		let Some(_guard) = RunGuard::acquire(&self.running) else {
			tracing::info!("Retry drain skipped because another run is in progress.");

			return Ok(RetryOutcome::Skipped(SkippedRun::ALREADY_RUNNING));
		};
		let limit = self.settings.insights.retry_batch_size.max(1);
		let max_attempts =
			i32::try_from(self.settings.insights.max_retry_attempts).unwrap_or(i32::MAX);
		let jobs = self.store.claim_retries(limit, RETRY_LEASE).await?;
		let mut report = RetryReport { claimed: jobs.len(), ..Default::default() };

		for job in jobs {
			let attempts = job.attempts.saturating_add(1);

			match self.retry_job(&job).await {
				Ok(()) => {
					self.store.complete_retry(job.id).await?;

					report.completed += 1;
				},
				Err(err) => {
					let terminal = attempts >= max_attempts || matches!(err, Error::NotFound { .. });
					let message = sanitize_error(&err.to_string());

					self.store
						.reschedule_retry(job.id, &message, backoff_for_attempt(attempts), terminal)
						.await?;

					if terminal {
						report.failed += 1;

						tracing::error!(
							error = %err,
							job_id = job.id,
							attempts,
							"Memory retry gave up."
						);
					} else {
						report.rescheduled += 1;

						tracing::warn!(error = %err, job_id = job.id, attempts, "Memory retry failed.");
					}
				},
			}
		}

		Ok(RetryOutcome::Ran(report))
	}

	async fn retry_job(&self, job: &ProcessingJob) -> Result<()> {
		let Some(&memory_id) = job.source_ids.first() else {
			return Err(Error::NotFound {
				message: format!("Retry job {} has no source memory.", job.id),
			});
		};

		if self.store.has_processing_marker(memory_id).await? {
			tracing::info!(job_id = job.id, memory_id, "Memory already processed. Retry closed.");

			return Ok(());
		}

		let memory = self.store.fetch_memory(memory_id).await?.ok_or_else(|| Error::NotFound {
			message: format!("Memory {memory_id} does not exist."),
		})?;
		let saved = self.process_isolated(&memory).await?;

		tracing::info!(job_id = job.id, memory_id, insights = saved, "Memory retry succeeded.");

		Ok(())
	}
}

pub(crate) fn backoff_for_attempt(attempt: i32) -> Duration {
	let attempts = attempt.max(1) as u32;
	let exp = attempts.saturating_sub(1).min(6);
	let base = BASE_BACKOFF_MS.saturating_mul(1 << exp);
	let capped = base.min(MAX_BACKOFF_MS);

	Duration::milliseconds(capped)
}
