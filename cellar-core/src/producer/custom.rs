use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{CommandRunner, ProduceError, Producer, artifact_path, finish_artifact, run_tool};
use crate::context::RunContext;
use crate::models::{Artifact, DbConnection, Source, Target, TargetKind};

pub const DEFAULT_EXTENSION: &str = "backup";

/// Single-quotes `value` for `sh` unless it is made only of characters the
/// shell passes through untouched. Empty values become `''`.
pub fn shell_quote(value: &str) -> String {
	let plain = |c: char| c.is_ascii_alphanumeric() || "_-./:@%+=,".contains(c);
	if !value.is_empty() && value.chars().all(plain) {
		return value.to_string();
	}
	format!("'{}'", value.replace('\'', r"'\''"))
}

/// Fill `{backup_file}`, `{db_name}`, `{db_user}`, `{db_password}`,
/// `{db_host}` and `{db_port}`, each shell-quoted as one word. Absent values
/// become `''`; any other braces are left alone.
pub fn render_template(template: &str, backup_file: &Path, conn: &DbConnection) -> String {
	let port = conn.port.map(|p| p.to_string()).unwrap_or_else(|| "''".to_string());
	let vars: [(&str, String); 6] = [
		("{backup_file}", shell_quote(&backup_file.to_string_lossy())),
		("{db_name}", shell_quote(&conn.db_name)),
		("{db_user}", shell_quote(conn.user.as_deref().unwrap_or_default())),
		("{db_password}", shell_quote(conn.password.as_deref().unwrap_or_default())),
		("{db_host}", shell_quote(conn.host.as_deref().unwrap_or_default())),
		("{db_port}", port),
	];

	let mut rendered = String::with_capacity(template.len());
	let mut rest = template;
	'scan: while let Some(open) = rest.find('{') {
		rendered.push_str(&rest[..open]);
		let tail = &rest[open..];
		for (placeholder, value) in &vars {
			if tail.starts_with(placeholder) {
				rendered.push_str(value);
				rest = &tail[placeholder.len()..];
				continue 'scan;
			}
		}
		rendered.push('{');
		rest = &tail[1..];
	}
	rendered.push_str(rest);
	rendered
}

/// Runs a user-supplied shell command that writes the artifact itself.
pub struct CustomCommandProducer {
	runner: Arc<dyn CommandRunner>,
}

impl CustomCommandProducer {
	pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
		Self { runner }
	}
}

#[async_trait]
impl Producer for CustomCommandProducer {
	async fn produce(&self, _ctx: &RunContext, target: &Target, workdir: &Path) -> Result<Artifact, ProduceError> {
		let Source::Command { template, connection, extension } = &target.source else {
			return Err(ProduceError::SourceMismatch {
				identity: target.identity.clone(),
				expected: TargetKind::CustomCommand,
			});
		};
		let extension = if extension.is_empty() { DEFAULT_EXTENSION } else { extension.as_str() };
		let out = artifact_path(workdir, target, extension);
		let command = render_template(template, &out, connection);

		info!(db = %connection.db_name, "running custom backup command");
		run_tool(self.runner.as_ref(), "sh", &["-c".to_string(), command], &[]).await?;

		if !out.is_file() {
			return Err(ProduceError::DumpFailed {
				tool: "custom command".to_string(),
				status: "exit code 0".to_string(),
				stderr: format!("command did not write {}", out.display()),
			});
		}

		finish_artifact(out, extension, None).await
	}
}
