use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracing::{Instrument, error, info, info_span, warn};

use crate::context::RunContext;
use crate::engine::naming;
use crate::models::{Artifact, JobResult, JobStage, JobStatus, Target};
use crate::producer::{ProduceError, ProducerRegistry};
use crate::store::{RemoteStore, StoreError};

/// Runs one target through produce → upload → prune.
pub struct JobRunner {
	producers: Arc<ProducerRegistry>,
	store: Arc<dyn RemoteStore>,
}

/// What a prune pass managed before it stopped or finished.
#[derive(Debug, Default)]
struct Pruned {
	deleted: Vec<String>,
	error: Option<StoreError>,
}

/// Stage bookkeeping for one job. Logs every transition.
struct Progress {
	identity: String,
	started_at: DateTime<Utc>,
	stage: JobStage,
}

impl Progress {
	fn new(identity: &str, started_at: DateTime<Utc>) -> Self {
		Self { identity: identity.to_string(), started_at, stage: JobStage::Pending }
	}

	fn advance(&mut self, next: JobStage) {
		debug_assert!(self.stage.can_advance_to(next), "{} -> {next}", self.stage);
		info!(stage = %next, "stage");
		self.stage = next;
	}

	fn finish(mut self, ctx: &RunContext, status: JobStatus, error_detail: Option<String>) -> JobResult {
		self.advance(JobStage::Done(status));
		JobResult {
			identity: self.identity,
			started_at: self.started_at,
			finished_at: ctx.now(),
			status,
			error_detail,
			remote_artifact_name: None,
			deleted: Vec::new(),
			size_bytes: None,
			digest: None,
		}
	}
}

impl JobRunner {
	pub fn new(producers: Arc<ProducerRegistry>, store: Arc<dyn RemoteStore>) -> Self {
		Self { producers, store }
	}

	/// Never fails: every error ends up in the returned [`JobResult`].
	pub async fn run(&self, ctx: &RunContext, target: &Target) -> JobResult {
		let span = info_span!("job", identity = %target.identity, kind = %target.kind, run_id = %ctx.run_id());
		self.run_stages(ctx, target).instrument(span).await
	}

	async fn run_stages(&self, ctx: &RunContext, target: &Target) -> JobResult {
		let mut progress = Progress::new(&target.identity, ctx.now());
		progress.advance(JobStage::Producing);

		// dropping this removes the artifact and anything else the producer wrote
		let scratch = match scratch_dir(ctx, target) {
			Ok(dir) => dir,
			Err(err) => {
				error!(error = %err, "cannot create scratch directory");
				return progress.finish(ctx, JobStatus::ProduceFailed, Some(format!("scratch directory: {err}")));
			}
		};

		let artifact = match self.produce(ctx, target, scratch.path()).await {
			Ok(artifact) => artifact,
			Err(err) => {
				error!(error = %err, kind = err.kind(), "produce failed");
				return progress.finish(ctx, JobStatus::ProduceFailed, Some(err.to_string()));
			}
		};
		info!(bytes = artifact.size_bytes, digest = %artifact.digest, "artifact ready");

		let prefix = naming::resolve_prefix(target, Some(&artifact));
		let remote_name = naming::derive_remote_name(
			&prefix,
			target.format_suffix.as_deref(),
			ctx.now(),
			&artifact.extension,
		);
		let stem = naming::name_stem(&prefix, target.format_suffix.as_deref());

		progress.advance(JobStage::Uploading);
		let existing = match self.store.list(&target.destination_path).await {
			Ok(entries) => entries,
			Err(err) => {
				warn!(error = %err, "cannot list destination before upload");
				Vec::new()
			}
		};

		info!(remote = %remote_name, dir = %target.destination_path, "uploading");
		let uploaded = self
			.store
			.upload(&artifact.local_path, &target.destination_path, &remote_name)
			.await;
		drop(scratch);

		if let Err(err) = uploaded {
			error!(error = %err, kind = err.kind(), "upload failed");
			let mut detail = err.to_string();
			let mut deleted = Vec::new();
			if naming::has_prior_artifacts(&existing, &stem) {
				info!("pruning existing artifacts despite failed upload");
				let pruned = self.prune(target, &stem).await;
				deleted = pruned.deleted;
				if let Some(err) = pruned.error {
					warn!(error = %err, "cleanup after failed upload also failed");
					detail = format!("{detail}; cleanup: {err}");
				}
			}
			let mut result = progress.finish(ctx, JobStatus::UploadFailed, Some(detail));
			result.deleted = deleted;
			return result;
		}

		progress.advance(JobStage::Cleaning);
		let pruned = self.prune(target, &stem).await;
		let (status, detail) = match pruned.error {
			None => (JobStatus::Success, None),
			Some(err) => {
				warn!(error = %err, "cleanup failed, new artifact is in place");
				(JobStatus::CleanupFailedNonfatal, Some(format!("cleanup: {err}")))
			}
		};

		let mut result = progress.finish(ctx, status, detail);
		result.remote_artifact_name = Some(remote_name);
		result.deleted = pruned.deleted;
		result.size_bytes = Some(artifact.size_bytes);
		result.digest = Some(artifact.digest);
		result
	}

	async fn produce(&self, ctx: &RunContext, target: &Target, workdir: &Path) -> Result<Artifact, ProduceError> {
		let producer = self
			.producers
			.get(target.kind)
			.ok_or(ProduceError::NoProducer(target.kind))?;
		producer.produce(ctx, target, workdir).await
	}

	/// Delete whatever falls outside the retention window. Keeps going past a
	/// failed delete so one stuck entry does not pin the rest.
	async fn prune(&self, target: &Target, stem: &str) -> Pruned {
		let entries = match self.store.list(&target.destination_path).await {
			Ok(entries) => entries,
			Err(err) => return Pruned { deleted: Vec::new(), error: Some(err) },
		};

		let mut pruned = Pruned::default();
		for name in naming::select_stale(&entries, stem, target.retention()) {
			match self.store.delete(&target.destination_path, &name).await {
				Ok(()) => {
					info!(entry = %name, "deleted old backup");
					pruned.deleted.push(name);
				}
				Err(err) => {
					warn!(entry = %name, error = %err, "cannot delete old backup");
					pruned.error.get_or_insert(err);
				}
			}
		}
		pruned
	}
}

fn scratch_dir(ctx: &RunContext, target: &Target) -> std::io::Result<TempDir> {
	std::fs::create_dir_all(ctx.scratch_root())?;
	let label: String = target
		.identity
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
		.collect();
	tempfile::Builder::new()
		.prefix(&format!("{label}-{}-", ulid::Ulid::new()))
		.tempdir_in(ctx.scratch_root())
}
