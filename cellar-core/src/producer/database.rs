//! Dump-utility producers: `mysqldump`, `pg_dump`, `mongodump`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{CommandRunner, ProduceError, Producer, archive, artifact_path, finish_artifact, run_tool};
use crate::context::RunContext;
use crate::models::{Artifact, DbConnection, Source, Target, TargetKind};

pub const MYSQL_DEFAULT_PORT: u16 = 3306;
pub const POSTGRES_DEFAULT_PORT: u16 = 5432;
pub const MONGO_DEFAULT_PORT: u16 = 27017;
pub const POSTGRES_DEFAULT_SSL_MODE: &str = "prefer";

fn connection<'a>(target: &'a Target, expected: TargetKind) -> Result<&'a DbConnection, ProduceError> {
	match &target.source {
		Source::Database(conn) => Ok(conn),
		_ => Err(ProduceError::SourceMismatch { identity: target.identity.clone(), expected }),
	}
}

/// Passwords are often pasted into config files with their quotes.
fn strip_quotes(value: &str) -> &str {
	value.trim().trim_matches(|c| c == '"' || c == '\'')
}

pub fn mysqldump_args(conn: &DbConnection, out: &Path) -> Vec<String> {
	let mut args = Vec::new();
	if let Some(user) = &conn.user {
		args.push(format!("--user={user}"));
	}
	if let Some(host) = &conn.host {
		args.push(format!("--host={host}"));
	}
	args.push(format!("--port={}", conn.port.unwrap_or(MYSQL_DEFAULT_PORT)));
	args.extend(["--single-transaction", "--quick", "--lock-tables=false"].map(String::from));
	args.push(format!("--result-file={}", out.display()));
	args.push(conn.db_name.clone());
	args
}

/// The password goes through the environment so it never shows up in `ps`.
pub fn mysqldump_env(conn: &DbConnection) -> Vec<(String, String)> {
	conn.password
		.as_deref()
		.map(|p| vec![("MYSQL_PWD".to_string(), strip_quotes(p).to_string())])
		.unwrap_or_default()
}

pub fn pg_dump_args(conn: &DbConnection, out: &Path) -> Vec<String> {
	let mut args = Vec::new();
	if let Some(user) = &conn.user {
		args.push(format!("--username={user}"));
	}
	if let Some(host) = &conn.host {
		args.push(format!("--host={host}"));
	}
	args.push(format!("--port={}", conn.port.unwrap_or(POSTGRES_DEFAULT_PORT)));
	args.extend(["--format=custom", "--no-password", "--no-owner", "--no-acl"].map(String::from));
	args.push(format!("--file={}", out.display()));
	args.push(conn.db_name.clone());
	args
}

pub fn pg_dump_env(conn: &DbConnection) -> Vec<(String, String)> {
	let mut env = Vec::new();
	if let Some(password) = conn.password.as_deref() {
		env.push(("PGPASSWORD".to_string(), strip_quotes(password).to_string()));
	}
	let ssl_mode = conn.ssl_mode.as_deref().unwrap_or(POSTGRES_DEFAULT_SSL_MODE);
	env.push(("PGSSLMODE".to_string(), ssl_mode.to_string()));
	env
}

/// `credentials` is the `--config` file holding the password, written by
/// [`write_mongodump_config`]; without it no authentication flags are passed.
pub fn mongodump_args(conn: &DbConnection, out_dir: &Path, credentials: Option<&Path>) -> Vec<String> {
	let mut args = vec![format!("--db={}", conn.db_name), format!("--out={}", out_dir.display())];
	if let (Some(user), Some(config)) = (&conn.user, credentials) {
		args.push(format!("--username={user}"));
		args.push(format!("--config={}", config.display()));
		args.push("--authenticationDatabase=admin".to_string());
	}
	if let Some(host) = &conn.host {
		args.push(format!("--host={host}"));
	}
	args.push(format!("--port={}", conn.port.unwrap_or(MONGO_DEFAULT_PORT)));
	args
}

/// YAML body of a mongodump `--config` file carrying only the password.
pub fn mongodump_config(password: &str) -> String {
	let escaped = strip_quotes(password).replace('\\', "\\\\").replace('"', "\\\"");
	format!("password: \"{escaped}\"\n")
}

/// The password goes into a private file in the scratch directory so it never
/// shows up in `ps`. Only written when both user and password are set.
fn write_mongodump_config(conn: &DbConnection, workdir: &Path) -> Result<Option<PathBuf>, ProduceError> {
	let (Some(_), Some(password)) = (&conn.user, &conn.password) else {
		return Ok(None);
	};
	let path = workdir.join("mongodump.yaml");
	let io_err = |e: std::io::Error| ProduceError::Io(format!("{}: {e}", path.display()));

	let mut options = std::fs::OpenOptions::new();
	options.write(true).create_new(true);
	#[cfg(unix)]
	std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);
	let mut file = options.open(&path).map_err(io_err)?;
	file.write_all(mongodump_config(password).as_bytes()).map_err(io_err)?;
	Ok(Some(path))
}

fn ensure_written(path: &Path, tool: &str) -> Result<(), ProduceError> {
	if path.is_file() {
		Ok(())
	} else {
		Err(ProduceError::DumpFailed {
			tool: tool.to_string(),
			status: "exit code 0".to_string(),
			stderr: format!("no output at {}", path.display()),
		})
	}
}

pub struct MysqlProducer {
	runner: Arc<dyn CommandRunner>,
}

impl MysqlProducer {
	pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
		Self { runner }
	}
}

#[async_trait]
impl Producer for MysqlProducer {
	async fn produce(&self, _ctx: &RunContext, target: &Target, workdir: &Path) -> Result<Artifact, ProduceError> {
		let conn = connection(target, TargetKind::Mysql)?;
		let out = artifact_path(workdir, target, "sql");

		info!(db = %conn.db_name, "dumping mysql database");
		run_tool(self.runner.as_ref(), "mysqldump", &mysqldump_args(conn, &out), &mysqldump_env(conn)).await?;
		ensure_written(&out, "mysqldump")?;

		finish_artifact(out, "sql", None).await
	}
}

pub struct PostgresProducer {
	runner: Arc<dyn CommandRunner>,
}

impl PostgresProducer {
	pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
		Self { runner }
	}
}

#[async_trait]
impl Producer for PostgresProducer {
	async fn produce(&self, _ctx: &RunContext, target: &Target, workdir: &Path) -> Result<Artifact, ProduceError> {
		let conn = connection(target, TargetKind::Postgresql)?;
		let out = artifact_path(workdir, target, "dump");

		info!(db = %conn.db_name, "dumping postgresql database");
		run_tool(self.runner.as_ref(), "pg_dump", &pg_dump_args(conn, &out), &pg_dump_env(conn)).await?;
		ensure_written(&out, "pg_dump")?;

		finish_artifact(out, "dump", None).await
	}
}

pub struct MongoProducer {
	runner: Arc<dyn CommandRunner>,
}

impl MongoProducer {
	pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
		Self { runner }
	}
}

#[async_trait]
impl Producer for MongoProducer {
	async fn produce(&self, _ctx: &RunContext, target: &Target, workdir: &Path) -> Result<Artifact, ProduceError> {
		let conn = connection(target, TargetKind::Mongodb)?;
		let dump_dir = workdir.join("mongodump");

		info!(db = %conn.db_name, "dumping mongodb database");
		let credentials = write_mongodump_config(conn, workdir)?;
		let args = mongodump_args(conn, &dump_dir, credentials.as_deref());
		run_tool(self.runner.as_ref(), "mongodump", &args, &[]).await?;
		if !dump_dir.is_dir() {
			return Err(ProduceError::DumpFailed {
				tool: "mongodump".to_string(),
				status: "exit code 0".to_string(),
				stderr: format!("no dump directory at {}", dump_dir.display()),
			});
		}

		let out = artifact_path(workdir, target, "tar.gz");
		let root_name = conn.db_name.clone();
		let (src, dest) = (dump_dir.clone(), out.clone());
		let packed = tokio::task::spawn_blocking(move || archive::pack_dir(&src, &root_name, &dest))
			.await
			.map_err(|e| ProduceError::Io(format!("task join error: {e}")))?
			.map_err(|e| ProduceError::Io(format!("packing {}: {e}", dump_dir.display())))?;
		debug!(files = packed.files_packed, skipped = packed.skipped_entries, "packed mongodb dump");

		finish_artifact(out, "tar.gz", None).await
	}
}

#[cfg(test)]
mod tests {
	use std::num::NonZeroU32;

	use super::*;
	use crate::producer::testing::{FakeRunner, Script};

	fn conn() -> DbConnection {
		DbConnection {
			db_name: "shop".into(),
			user: Some("app".into()),
			password: Some("\"s3cret\"".into()),
			host: Some("db.internal".into()),
			port: None,
			ssl_mode: None,
		}
	}

	fn target(kind: TargetKind) -> Target {
		Target {
			identity: "shop".into(),
			kind,
			source: Source::Database(conn()),
			destination_path: "/backups/db/".into(),
			retention_count: NonZeroU32::new(2).unwrap(),
			expected_name_prefix: None,
			format_suffix: None,
		}
	}

	#[test]
	fn mysqldump_uses_consistent_snapshot_flags() {
		let args = mysqldump_args(&conn(), Path::new("/scratch/shop.sql"));
		assert_eq!(
			args,
			vec![
				"--user=app",
				"--host=db.internal",
				"--port=3306",
				"--single-transaction",
				"--quick",
				"--lock-tables=false",
				"--result-file=/scratch/shop.sql",
				"shop",
			]
		);
		assert_eq!(mysqldump_env(&conn()), vec![("MYSQL_PWD".to_string(), "s3cret".to_string())]);
	}

	#[test]
	fn pg_dump_env_strips_quotes_and_defaults_ssl_mode() {
		let env = pg_dump_env(&conn());
		assert_eq!(
			env,
			vec![
				("PGPASSWORD".to_string(), "s3cret".to_string()),
				("PGSSLMODE".to_string(), "prefer".to_string()),
			]
		);

		let mut c = conn();
		c.ssl_mode = Some("require".into());
		c.port = Some(6543);
		assert!(pg_dump_env(&c).contains(&("PGSSLMODE".to_string(), "require".to_string())));
		assert!(pg_dump_args(&c, Path::new("/x.dump")).contains(&"--port=6543".to_string()));
	}

	#[test]
	fn mongodump_only_authenticates_with_credentials_file() {
		let c = conn();
		let args = mongodump_args(&c, Path::new("/out"), Some(Path::new("/scratch/mongodump.yaml")));
		assert!(args.contains(&"--username=app".to_string()));
		assert!(args.contains(&"--config=/scratch/mongodump.yaml".to_string()));
		assert!(args.contains(&"--authenticationDatabase=admin".to_string()));
		assert!(args.contains(&"--port=27017".to_string()));
		assert!(!args.iter().any(|a| a.contains("s3cret")));

		let args = mongodump_args(&c, Path::new("/out"), None);
		assert!(!args.iter().any(|a| a.starts_with("--username") || a.starts_with("--config")));
	}

	#[test]
	fn mongodump_config_escapes_the_password() {
		assert_eq!(mongodump_config("\"s3cret\""), "password: \"s3cret\"\n");
		assert_eq!(mongodump_config(r#"a"b\c"#), "password: \"a\\\"b\\\\c\"\n");
	}

	#[tokio::test]
	async fn mongo_password_stays_off_the_command_line() {
		let tmp = tempfile::tempdir().unwrap();
		let runner = FakeRunner::new(Script::Write("bson"));
		let producer = MongoProducer::new(runner.clone());

		producer
			.produce(&RunContext::new(tmp.path()), &target(TargetKind::Mongodb), tmp.path())
			.await
			.unwrap();

		let call = runner.single_call();
		assert!(!call.args.iter().any(|a| a.contains("s3cret")), "{:?}", call.args);
		let config = tmp.path().join("mongodump.yaml");
		assert!(call.args.contains(&format!("--config={}", config.display())));
		assert_eq!(std::fs::read_to_string(&config).unwrap(), "password: \"s3cret\"\n");
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			assert_eq!(std::fs::metadata(&config).unwrap().permissions().mode() & 0o777, 0o600);
		}
	}

	#[tokio::test]
	async fn missing_tool_is_reported_as_such() {
		let tmp = tempfile::tempdir().unwrap();
		let runner = FakeRunner::new(Script::Missing);
		let producer = MysqlProducer::new(runner.clone());

		let err = producer
			.produce(&RunContext::new(tmp.path()), &target(TargetKind::Mysql), tmp.path())
			.await
			.unwrap_err();

		assert!(matches!(err, ProduceError::ToolMissing(ref t) if t == "mysqldump"));
	}

	#[tokio::test]
	async fn failed_dump_carries_stderr() {
		let tmp = tempfile::tempdir().unwrap();
		let runner = FakeRunner::new(Script::Exit { code: 1, stderr: "FATAL: password authentication failed" });
		let producer = PostgresProducer::new(runner.clone());

		let err = producer
			.produce(&RunContext::new(tmp.path()), &target(TargetKind::Postgresql), tmp.path())
			.await
			.unwrap_err();

		match err {
			ProduceError::DumpFailed { tool, stderr, .. } => {
				assert_eq!(tool, "pg_dump");
				assert!(stderr.contains("password authentication failed"));
			}
			other => panic!("unexpected error: {other:?}"),
		}
		let call = runner.single_call();
		assert_eq!(call.program, "pg_dump");
	}

	#[tokio::test]
	async fn successful_dump_is_digested() {
		let tmp = tempfile::tempdir().unwrap();
		let runner = FakeRunner::new(Script::Write("CREATE TABLE t;"));
		let producer = MysqlProducer::new(runner);

		let artifact = producer
			.produce(&RunContext::new(tmp.path()), &target(TargetKind::Mysql), tmp.path())
			.await
			.unwrap();

		assert_eq!(artifact.extension, "sql");
		assert_eq!(artifact.size_bytes, 15);
		assert_eq!(artifact.local_path, tmp.path().join("shop.sql"));
		assert!(artifact.detected_prefix.is_none());
	}

	#[tokio::test]
	async fn mongo_dump_directory_is_packed() {
		let tmp = tempfile::tempdir().unwrap();
		let runner = FakeRunner::new(Script::Write("bson"));
		let producer = MongoProducer::new(runner);

		let artifact = producer
			.produce(&RunContext::new(tmp.path()), &target(TargetKind::Mongodb), tmp.path())
			.await
			.unwrap();

		assert_eq!(artifact.extension, "tar.gz");
		assert!(artifact.local_path.is_file());
		assert!(artifact.size_bytes > 0);
	}

	#[tokio::test]
	async fn wrong_source_shape_is_rejected() {
		let tmp = tempfile::tempdir().unwrap();
		let mut t = target(TargetKind::Mysql);
		t.source = Source::File { path: "/x.db".into() };
		let producer = MysqlProducer::new(FakeRunner::new(Script::Missing));

		let err = producer.produce(&RunContext::new(tmp.path()), &t, tmp.path()).await.unwrap_err();
		assert!(matches!(err, ProduceError::SourceMismatch { .. }));
	}
}
