use std::path::PathBuf;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "CELLAR_LOG";

/// Where `cellar.log` goes when `--log-dir` is not given.
pub fn default_log_dir() -> Option<PathBuf> {
	dirs::data_local_dir().map(|d| d.join("cellar"))
}

/// stderr plus a plain-text file layer. The file layer is skipped when the
/// directory cannot be created.
pub fn init(log_dir: Option<PathBuf>) {
	let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

	let file_layer = log_dir
		.or_else(default_log_dir)
		.filter(|dir| std::fs::create_dir_all(dir).is_ok())
		.map(|dir| {
			let file_appender = tracing_appender::rolling::never(dir, "cellar.log");
			fmt::layer().with_writer(file_appender).with_ansi(false)
		});

	tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer().with_writer(std::io::stderr).with_target(false))
		.with(file_layer)
		.init();
}
