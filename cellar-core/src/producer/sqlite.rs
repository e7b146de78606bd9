use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use super::{ProduceError, Producer, artifact_path, copier};
use crate::context::RunContext;
use crate::models::{Artifact, Source, Target, TargetKind};

/// Copies a SQLite database file as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteProducer;

#[async_trait]
impl Producer for SqliteProducer {
	async fn produce(&self, _ctx: &RunContext, target: &Target, workdir: &Path) -> Result<Artifact, ProduceError> {
		let Source::File { path } = &target.source else {
			return Err(ProduceError::SourceMismatch {
				identity: target.identity.clone(),
				expected: TargetKind::Sqlite,
			});
		};
		if !path.is_file() {
			return Err(ProduceError::NotFound(path.display().to_string()));
		}

		let out = artifact_path(workdir, target, "db");
		info!(source = %path.display(), "copying sqlite database");

		let (src, dest) = (path.clone(), out.clone());
		let copied = tokio::task::spawn_blocking(move || copier::copy_and_hash(&src, &dest))
			.await
			.map_err(|e| ProduceError::Io(format!("task join error: {e}")))??;

		Ok(Artifact {
			local_path: out,
			extension: "db".to_string(),
			detected_prefix: None,
			size_bytes: copied.bytes_copied,
			digest: copied.digest,
		})
	}
}
