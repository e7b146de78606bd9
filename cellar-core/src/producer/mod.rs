//! Producers turn a target into one local artifact file.
//!
//! Every variant writes only into the per-job scratch directory it is handed
//! and reports failures through [`ProduceError`].

pub mod archive;
pub mod copier;
pub mod custom;
pub mod database;
pub mod exec;
pub mod fetch;
pub mod hub;
pub mod sqlite;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::RunContext;
use crate::models::{Artifact, Target, TargetKind};

pub use custom::CustomCommandProducer;
pub use database::{MongoProducer, MysqlProducer, PostgresProducer};
pub use exec::{CommandOutput, CommandRunner, SystemRunner};
pub use fetch::{ContentSource, RemoteFetchProducer};
pub use hub::HubClient;
pub use sqlite::SqliteProducer;

use copier::CopyError;

/// How much of a failed tool's stderr ends up in the error.
pub const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum ProduceError {
	#[error("source not found: {0}")]
	NotFound(String),

	#[error("`{0}` is not installed or not on PATH")]
	ToolMissing(String),

	#[error("{tool} failed ({status}): {stderr}")]
	DumpFailed {
		tool: String,
		status: String,
		stderr: String,
	},

	#[error("transient failure: {0}")]
	Transient(String),

	#[error("I/O error: {0}")]
	Io(String),

	#[error("target {identity} is not a {expected} source")]
	SourceMismatch {
		identity: String,
		expected: TargetKind,
	},

	#[error("no producer registered for {0}")]
	NoProducer(TargetKind),
}

impl ProduceError {
	/// Only network hiccups are worth another attempt.
	pub fn is_retryable(&self) -> bool {
		matches!(self, ProduceError::Transient(_))
	}

	pub fn kind(&self) -> &'static str {
		match self {
			ProduceError::NotFound(_) => "not_found",
			ProduceError::ToolMissing(_) => "tool_missing",
			ProduceError::DumpFailed { .. } => "dump_failed",
			ProduceError::Transient(_) => "transient",
			ProduceError::Io(_) => "io_error",
			ProduceError::SourceMismatch { .. } | ProduceError::NoProducer(_) => "internal",
		}
	}
}

impl From<CopyError> for ProduceError {
	fn from(err: CopyError) -> Self {
		match err {
			CopyError::SourceNotFound(path) => ProduceError::NotFound(path),
			other => ProduceError::Io(other.to_string()),
		}
	}
}

/// Materializes the artifact for one target.
#[async_trait]
pub trait Producer: Send + Sync {
	async fn produce(&self, ctx: &RunContext, target: &Target, workdir: &Path) -> Result<Artifact, ProduceError>;
}

/// Lookup table of producers, one per [`TargetKind`].
///
/// Built once at startup, read-only afterwards.
#[derive(Default)]
pub struct ProducerRegistry {
	producers: HashMap<TargetKind, Arc<dyn Producer>>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("a producer for {0} is already registered")]
	Duplicate(TargetKind),

	#[error("no producer registered for {0}")]
	Missing(TargetKind),
}

impl ProducerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// All six built-in producers wired to the given capabilities.
	pub fn standard(runner: Arc<dyn CommandRunner>, content: Arc<dyn ContentSource>) -> Self {
		let mut producers: HashMap<TargetKind, Arc<dyn Producer>> = HashMap::new();
		producers.insert(TargetKind::RemoteFetch, Arc::new(RemoteFetchProducer::new(content)));
		producers.insert(TargetKind::Mysql, Arc::new(MysqlProducer::new(runner.clone())));
		producers.insert(TargetKind::Postgresql, Arc::new(PostgresProducer::new(runner.clone())));
		producers.insert(TargetKind::Mongodb, Arc::new(MongoProducer::new(runner.clone())));
		producers.insert(TargetKind::Sqlite, Arc::new(SqliteProducer));
		producers.insert(TargetKind::CustomCommand, Arc::new(CustomCommandProducer::new(runner)));
		Self { producers }
	}

	pub fn register(&mut self, kind: TargetKind, producer: Arc<dyn Producer>) -> Result<(), RegistryError> {
		if self.producers.contains_key(&kind) {
			return Err(RegistryError::Duplicate(kind));
		}
		self.producers.insert(kind, producer);
		Ok(())
	}

	pub fn get(&self, kind: TargetKind) -> Option<&Arc<dyn Producer>> {
		self.producers.get(&kind)
	}

	/// Fails on the first kind in `kinds` without a producer.
	pub fn ensure_covers(&self, kinds: impl IntoIterator<Item = TargetKind>) -> Result<(), RegistryError> {
		for kind in kinds {
			if !self.producers.contains_key(&kind) {
				return Err(RegistryError::Missing(kind));
			}
		}
		Ok(())
	}

	pub fn len(&self) -> usize {
		self.producers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.producers.is_empty()
	}
}

/// Run `program` and turn spawn failures and non-zero exits into
/// [`ProduceError`]s.
pub(crate) async fn run_tool(
	runner: &dyn CommandRunner,
	program: &str,
	args: &[String],
	env: &[(String, String)],
) -> Result<CommandOutput, ProduceError> {
	let output = runner.run(program, args, env).await.map_err(|err| match err.kind() {
		io::ErrorKind::NotFound => ProduceError::ToolMissing(program.to_string()),
		io::ErrorKind::TimedOut => ProduceError::DumpFailed {
			tool: program.to_string(),
			status: "timed out".to_string(),
			stderr: err.to_string(),
		},
		_ => ProduceError::Io(format!("{program}: {err}")),
	})?;

	if !output.success() {
		let status = match output.exit_code {
			Some(code) => format!("exit code {code}"),
			None => "killed by signal".to_string(),
		};
		return Err(ProduceError::DumpFailed {
			tool: program.to_string(),
			status,
			stderr: exec::tail_lossy(&output.stderr, STDERR_TAIL_BYTES),
		});
	}

	Ok(output)
}

/// Size and digest the file a producer left behind.
pub(crate) async fn finish_artifact(
	local_path: PathBuf,
	extension: &str,
	detected_prefix: Option<String>,
) -> Result<Artifact, ProduceError> {
	let path = local_path.clone();
	let digest = tokio::task::spawn_blocking(move || copier::digest_file(&path))
		.await
		.map_err(|e| ProduceError::Io(format!("task join error: {e}")))??;

	Ok(Artifact {
		local_path,
		extension: extension.to_string(),
		detected_prefix,
		size_bytes: digest.size_bytes,
		digest: digest.digest,
	})
}

/// Scratch file name for a target's artifact.
pub(crate) fn artifact_path(workdir: &Path, target: &Target, extension: &str) -> PathBuf {
	let stem: String = target
		.short_name()
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
		.collect();
	workdir.join(format!("{stem}.{extension}"))
}
