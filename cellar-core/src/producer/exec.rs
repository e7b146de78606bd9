use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

/// What a finished subprocess left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
	/// `None` when the process was killed by a signal.
	pub exit_code: Option<i32>,
	pub stdout: Vec<u8>,
	pub stderr: Vec<u8>,
}

impl CommandOutput {
	pub fn success(&self) -> bool {
		self.exit_code == Some(0)
	}
}

/// Runs external programs. Producers only ever go through this, so tests can
/// pretend a tool is missing or failing without touching real binaries.
#[async_trait]
pub trait CommandRunner: Send + Sync {
	async fn run(&self, program: &str, args: &[String], env: &[(String, String)]) -> io::Result<CommandOutput>;
}

/// Spawns real processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
	timeout: Option<Duration>,
}

impl SystemRunner {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_timeout(timeout: Duration) -> Self {
		Self { timeout: Some(timeout) }
	}
}

#[async_trait]
impl CommandRunner for SystemRunner {
	async fn run(&self, program: &str, args: &[String], env: &[(String, String)]) -> io::Result<CommandOutput> {
		let mut cmd = tokio::process::Command::new(program);
		cmd.args(args)
			.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);

		let output = match self.timeout {
			Some(limit) => tokio::time::timeout(limit, cmd.output())
				.await
				.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("{program} timed out after {limit:?}")))??,
			None => cmd.output().await?,
		};

		Ok(CommandOutput {
			exit_code: output.status.code(),
			stdout: output.stdout,
			stderr: output.stderr,
		})
	}
}

/// Last `max` bytes of `bytes`, lossily decoded and trimmed.
pub fn tail_lossy(bytes: &[u8], max: usize) -> String {
	let start = bytes.len().saturating_sub(max);
	String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}
