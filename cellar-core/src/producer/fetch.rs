//! Pull a repository from a remote content hub.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{ProduceError, Producer, archive, artifact_path, finish_artifact};
use crate::context::RunContext;
use crate::engine::naming;
use crate::models::{Artifact, RepoType, Source, Target, TargetKind};

/// Read access to repositories on a content hub.
#[async_trait]
pub trait ContentSource: Send + Sync {
	/// File listing of `repo_id` when it exists as `repo_type`, `None` when it
	/// does not (or is not visible with this token).
	async fn resolve(
		&self,
		repo_id: &str,
		repo_type: RepoType,
		token: Option<&str>,
	) -> Result<Option<Vec<String>>, ProduceError>;

	/// Download one file of a resolved repository to `dest`. Returns bytes written.
	async fn download(
		&self,
		repo_id: &str,
		repo_type: RepoType,
		file: &str,
		token: Option<&str>,
		dest: &Path,
	) -> Result<u64, ProduceError>;
}

pub struct RemoteFetchProducer {
	source: Arc<dyn ContentSource>,
}

impl RemoteFetchProducer {
	pub fn new(source: Arc<dyn ContentSource>) -> Self {
		Self { source }
	}

	async fn locate(
		&self,
		repo_id: &str,
		type_hint: Option<RepoType>,
		token: Option<&str>,
	) -> Result<(RepoType, Vec<String>), ProduceError> {
		let candidates = match type_hint {
			Some(t) => vec![t],
			None => RepoType::PROBE_ORDER.to_vec(),
		};

		let mut last_transient = None;
		for repo_type in candidates {
			match self.source.resolve(repo_id, repo_type, token).await {
				Ok(Some(files)) => {
					debug!(%repo_type, files = files.len(), "repository resolved");
					return Ok((repo_type, files));
				}
				Ok(None) => debug!(%repo_type, "not a repository of this type"),
				Err(err) if err.is_retryable() => {
					warn!(%repo_type, error = %err, "probe failed");
					last_transient = Some(err);
				}
				Err(err) => return Err(err),
			}
		}

		Err(last_transient.unwrap_or_else(|| ProduceError::NotFound(repo_id.to_string())))
	}
}

/// Backup archives already stored in the repository, oldest name first.
pub fn prebuilt_archives(files: &[String]) -> Vec<&str> {
	let mut found: Vec<&str> = files
		.iter()
		.map(String::as_str)
		.filter(|f| naming::archive_extension(f).is_some())
		.collect();
	found.sort_unstable();
	found
}

#[async_trait]
impl Producer for RemoteFetchProducer {
	async fn produce(&self, _ctx: &RunContext, target: &Target, workdir: &Path) -> Result<Artifact, ProduceError> {
		let Source::RemoteFetch { repo_id, token, type_hint } = &target.source else {
			return Err(ProduceError::SourceMismatch {
				identity: target.identity.clone(),
				expected: TargetKind::RemoteFetch,
			});
		};
		let token = token.as_deref();
		let (repo_type, files) = self.locate(repo_id, *type_hint, token).await?;

		if let Some(latest) = prebuilt_archives(&files).last().copied() {
			let file_name = latest.rsplit('/').next().unwrap_or(latest);
			let Some(extension) = naming::archive_extension(file_name) else {
				return Err(ProduceError::NotFound(latest.to_string()));
			};
			let dest = workdir.join(file_name);
			info!(%repo_type, archive = latest, "downloading latest prebuilt archive");
			self.source.download(repo_id, repo_type, latest, token, &dest).await?;

			let ext = extension.trim_start_matches('.');
			return finish_artifact(dest, ext, naming::detect_prefix(file_name)).await;
		}

		let snapshot = workdir.join("snapshot");
		info!(%repo_type, files = files.len(), "downloading repository snapshot");
		for file in &files {
			let dest = snapshot_path(&snapshot, file)?;
			if let Some(parent) = dest.parent() {
				tokio::fs::create_dir_all(parent)
					.await
					.map_err(|e| ProduceError::Io(format!("{}: {e}", parent.display())))?;
			}
			self.source.download(repo_id, repo_type, file, token, &dest).await?;
		}
		tokio::fs::create_dir_all(&snapshot)
			.await
			.map_err(|e| ProduceError::Io(format!("{}: {e}", snapshot.display())))?;

		let out = artifact_path(workdir, target, "tar.gz");
		let root_name = target.short_name().to_string();
		let (src, dest) = (snapshot.clone(), out.clone());
		let packed = tokio::task::spawn_blocking(move || archive::pack_dir(&src, &root_name, &dest))
			.await
			.map_err(|e| ProduceError::Io(format!("task join error: {e}")))?
			.map_err(|e| ProduceError::Io(format!("packing snapshot: {e}")))?;
		debug!(files = packed.files_packed, skipped = packed.skipped_entries, "packed snapshot");

		finish_artifact(out, "tar.gz", None).await
	}
}

/// Where a repository file lands inside the snapshot directory. Rejects
/// names that would escape it.
fn snapshot_path(snapshot: &Path, file: &str) -> Result<PathBuf, ProduceError> {
	let mut path = snapshot.to_path_buf();
	for part in file.split('/') {
		match part {
			"" | "." => continue,
			".." => return Err(ProduceError::Io(format!("refusing path outside snapshot: {file}"))),
			p => path.push(p),
		}
	}
	Ok(path)
}
