#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cellar_core::context::{FixedClock, RunContext};
use cellar_core::models::{Artifact, RepoType, Source, Target, TargetKind};
use cellar_core::producer::{CommandOutput, CommandRunner, ContentSource, ProduceError, Producer};
use chrono::{DateTime, TimeZone, Utc};

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
	Utc.with_ymd_and_hms(y, m, d, 3, 0, 0).unwrap()
}

pub fn ctx(scratch: &Path, clock: Arc<FixedClock>) -> RunContext {
	RunContext::new(scratch).with_clock(clock)
}

pub fn sqlite_target(identity: &str, dir: &str, keep: u32) -> Target {
	Target {
		identity: identity.into(),
		kind: TargetKind::Sqlite,
		source: Source::File { path: format!("/var/lib/{identity}.db").into() },
		destination_path: dir.into(),
		retention_count: NonZeroU32::new(keep).unwrap(),
		expected_name_prefix: None,
		format_suffix: None,
	}
}

pub fn hub_target(identity: &str, dir: &str, keep: u32) -> Target {
	Target {
		identity: identity.into(),
		kind: TargetKind::RemoteFetch,
		source: Source::RemoteFetch { repo_id: identity.into(), token: None, type_hint: None },
		destination_path: dir.into(),
		retention_count: NonZeroU32::new(keep).unwrap(),
		expected_name_prefix: None,
		format_suffix: None,
	}
}

/// Writes a small `.db` file after an optional per-identity delay. Fails for
/// identities listed in `failing`.
#[derive(Default)]
pub struct StubProducer {
	pub delays: HashMap<String, Duration>,
	pub failing: Vec<String>,
	pub calls: AtomicUsize,
}

impl StubProducer {
	pub fn failing(identity: &str) -> Self {
		Self { failing: vec![identity.to_string()], ..Default::default() }
	}

	pub fn with_delay(mut self, identity: &str, delay: Duration) -> Self {
		self.delays.insert(identity.to_string(), delay);
		self
	}
}

#[async_trait]
impl Producer for StubProducer {
	async fn produce(&self, _ctx: &RunContext, target: &Target, workdir: &Path) -> Result<Artifact, ProduceError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		if let Some(delay) = self.delays.get(&target.identity) {
			tokio::time::sleep(*delay).await;
		}
		if self.failing.contains(&target.identity) {
			return Err(ProduceError::DumpFailed {
				tool: "sqlite3".into(),
				status: "exit code 1".into(),
				stderr: "database is locked".into(),
			});
		}
		let path = workdir.join("out.db");
		tokio::fs::write(&path, target.identity.as_bytes())
			.await
			.map_err(|e| ProduceError::Io(e.to_string()))?;
		Ok(Artifact {
			local_path: path,
			extension: "db".into(),
			detected_prefix: None,
			size_bytes: target.identity.len() as u64,
			digest: "stub".into(),
		})
	}
}

/// Every repository is a dataset with the given files.
#[derive(Default)]
pub struct StaticHub {
	pub files: HashMap<String, Vec<(String, String)>>,
}

impl StaticHub {
	pub fn with_dataset(mut self, repo_id: &str, files: &[(&str, &str)]) -> Self {
		let files = files.iter().map(|(n, c)| (n.to_string(), c.to_string())).collect();
		self.files.insert(repo_id.to_string(), files);
		self
	}
}

#[async_trait]
impl ContentSource for StaticHub {
	async fn resolve(
		&self,
		repo_id: &str,
		repo_type: RepoType,
		_token: Option<&str>,
	) -> Result<Option<Vec<String>>, ProduceError> {
		if repo_type != RepoType::Dataset {
			return Ok(None);
		}
		Ok(self
			.files
			.get(repo_id)
			.map(|files| files.iter().map(|(name, _)| name.clone()).collect()))
	}

	async fn download(
		&self,
		repo_id: &str,
		_repo_type: RepoType,
		file: &str,
		_token: Option<&str>,
		dest: &Path,
	) -> Result<u64, ProduceError> {
		let contents = self
			.files
			.get(repo_id)
			.and_then(|files| files.iter().find(|(name, _)| name == file))
			.map(|(_, c)| c.clone())
			.ok_or_else(|| ProduceError::NotFound(file.to_string()))?;
		tokio::fs::write(dest, &contents)
			.await
			.map_err(|e| ProduceError::Io(e.to_string()))?;
		Ok(contents.len() as u64)
	}
}

/// Pretends no dump tool is installed.
pub struct NoTools;

#[async_trait]
impl CommandRunner for NoTools {
	async fn run(&self, program: &str, _args: &[String], _env: &[(String, String)]) -> io::Result<CommandOutput> {
		Err(io::Error::new(io::ErrorKind::NotFound, format!("{program}: not found")))
	}
}

pub fn scratch_is_empty(scratch: &Path) -> bool {
	match std::fs::read_dir(scratch) {
		Ok(mut entries) => entries.next().is_none(),
		Err(err) => err.kind() == io::ErrorKind::NotFound,
	}
}
