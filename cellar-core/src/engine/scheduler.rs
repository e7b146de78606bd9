use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::context::RunContext;
use crate::engine::runner::JobRunner;
use crate::models::{JobResult, JobStatus, Target};

pub const DEFAULT_CONCURRENCY: usize = 3;

#[derive(Debug, Error)]
pub enum SchedulerError {
	#[error("no configured target matches {0}")]
	NothingSelected(Filter),
}

/// Which targets a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Filter {
	#[default]
	All,
	Identity(String),
	/// Every `owner/...` identity.
	Owner(String),
}

impl Filter {
	pub fn matches(&self, target: &Target) -> bool {
		match self {
			Filter::All => true,
			Filter::Identity(id) => target.identity == *id,
			Filter::Owner(owner) => target.owner() == Some(owner.as_str()),
		}
	}
}

impl fmt::Display for Filter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Filter::All => f.write_str("all targets"),
			Filter::Identity(id) => write!(f, "target {id}"),
			Filter::Owner(owner) => write!(f, "account {owner}"),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
	pub success: usize,
	pub produce_failed: usize,
	pub upload_failed: usize,
	pub cleanup_failed: usize,
	pub skipped: usize,
}

/// Everything one run did, keyed by target identity.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
	pub results: BTreeMap<String, JobResult>,
	/// Targets never started because the run was cancelled first.
	pub skipped: Vec<String>,
}

impl RunReport {
	/// No hard failures and nothing skipped.
	pub fn all_succeeded(&self) -> bool {
		self.skipped.is_empty() && self.results.values().all(|r| !r.status.is_hard_failure())
	}

	pub fn counts(&self) -> StatusCounts {
		let mut counts = StatusCounts { skipped: self.skipped.len(), ..Default::default() };
		for result in self.results.values() {
			match result.status {
				JobStatus::Success => counts.success += 1,
				JobStatus::ProduceFailed => counts.produce_failed += 1,
				JobStatus::UploadFailed => counts.upload_failed += 1,
				JobStatus::CleanupFailedNonfatal => counts.cleanup_failed += 1,
			}
		}
		counts
	}

	pub fn hard_failures(&self) -> impl Iterator<Item = &JobResult> {
		self.results.values().filter(|r| r.status.is_hard_failure())
	}
}

/// Fans targets out to a [`JobRunner`] with bounded concurrency.
pub struct Scheduler {
	runner: Arc<JobRunner>,
	concurrency: usize,
}

impl Scheduler {
	pub fn new(runner: Arc<JobRunner>, concurrency: usize) -> Self {
		Self { runner, concurrency: concurrency.max(1) }
	}

	pub fn concurrency(&self) -> usize {
		self.concurrency
	}

	/// Run every target `filter` selects, in order, at most `concurrency` at a
	/// time. One job failing never stops the others.
	pub async fn run(&self, ctx: &RunContext, targets: &[Target], filter: &Filter) -> Result<RunReport, SchedulerError> {
		let selected: Vec<&Target> = targets.iter().filter(|t| filter.matches(t)).collect();
		if selected.is_empty() {
			return Err(SchedulerError::NothingSelected(filter.clone()));
		}
		info!(targets = selected.len(), concurrency = self.concurrency, run_id = %ctx.run_id(), "starting run");

		let semaphore = Arc::new(Semaphore::new(self.concurrency));
		let mut handles = Vec::with_capacity(selected.len());
		let mut report = RunReport::default();

		for target in selected {
			let permit = tokio::select! {
				biased;
				_ = ctx.cancellation_token().cancelled() => None,
				permit = semaphore.clone().acquire_owned() => permit.ok(),
			};
			let Some(permit) = permit else {
				warn!(identity = %target.identity, "run cancelled, not starting");
				report.skipped.push(target.identity.clone());
				continue;
			};

			let runner = self.runner.clone();
			let job_ctx = ctx.clone();
			let job_target = target.clone();
			let started_at = ctx.now();
			handles.push((
				target.identity.clone(),
				started_at,
				tokio::spawn(async move {
					let result = runner.run(&job_ctx, &job_target).await;
					drop(permit);
					result
				}),
			));
		}

		for (identity, started_at, handle) in handles {
			let result = match handle.await {
				Ok(result) => result,
				Err(join_err) => {
					error!(%identity, error = %join_err, "job task died");
					JobResult {
						identity: identity.clone(),
						started_at,
						finished_at: ctx.now(),
						status: JobStatus::ProduceFailed,
						error_detail: Some(format!("job task failed: {join_err}")),
						remote_artifact_name: None,
						deleted: Vec::new(),
						size_bytes: None,
						digest: None,
					}
				}
			};
			report.results.insert(identity, result);
		}

		let counts = report.counts();
		info!(
			success = counts.success,
			produce_failed = counts.produce_failed,
			upload_failed = counts.upload_failed,
			cleanup_failed = counts.cleanup_failed,
			skipped = counts.skipped,
			"run finished"
		);
		Ok(report)
	}
}
