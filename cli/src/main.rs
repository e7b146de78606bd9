mod logging;
mod summary;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cellar_core::config::Config;
use cellar_core::context::RunContext;
use cellar_core::engine::{Filter, JobRunner, Scheduler};
use cellar_core::producer::{CommandRunner, HubClient, ProducerRegistry, SystemRunner};
use cellar_core::store::{self, MemoryStore, RemoteStore};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

const CONFIG_FILE: &str = "cellar.toml";

/// Exit status when configuration or startup fails before any job runs.
const EXIT_CONFIG: u8 = 2;

/// Back up hub repositories and databases to a remote store, keeping the
/// newest N artifacts of each.
#[derive(Parser, Debug)]
#[command(name = "cellar", version)]
struct Cli {
	/// Directory for cellar.log (defaults to the platform data dir)
	#[arg(long, global = true)]
	log_dir: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Produce, upload and prune every selected target.
	Run(RunArgs),
	/// Load and validate the configuration, then list its targets.
	Check {
		#[arg(long, short)]
		config: Option<PathBuf>,
	},
	/// List the datasets an account owns on the hub.
	Discover {
		#[arg(long)]
		token: String,
		#[arg(long)]
		account: String,
		#[arg(long)]
		endpoint: Option<String>,
	},
}

#[derive(Args, Debug)]
struct RunArgs {
	#[arg(long, short)]
	config: Option<PathBuf>,

	/// Only this target identity
	#[arg(long, conflicts_with = "account")]
	target: Option<String>,

	/// Only targets owned by this account (`account/...`)
	#[arg(long)]
	account: Option<String>,

	/// Override [global] parallel
	#[arg(long)]
	parallel: Option<usize>,

	/// Print the run report as JSON on stdout
	#[arg(long)]
	json: bool,

	/// Produce artifacts but upload to an in-memory store
	#[arg(long)]
	dry_run: bool,
}

impl RunArgs {
	fn filter(&self) -> Filter {
		match (&self.target, &self.account) {
			(Some(id), _) => Filter::Identity(id.clone()),
			(None, Some(owner)) => Filter::Owner(owner.clone()),
			(None, None) => Filter::All,
		}
	}
}

/// `--config`, else `./cellar.toml`, else the per-user config dir.
fn resolve_config(explicit: Option<PathBuf>) -> PathBuf {
	if let Some(path) = explicit {
		return path;
	}
	let local = PathBuf::from(CONFIG_FILE);
	if local.is_file() {
		return local;
	}
	dirs::config_dir()
		.map(|d| d.join("cellar").join(CONFIG_FILE))
		.filter(|p| p.is_file())
		.unwrap_or(local)
}

fn load_config(path: &Path) -> Result<Config> {
	Config::load(path).with_context(|| format!("loading {}", path.display()))
}

async fn run(args: RunArgs) -> Result<ExitCode> {
	let config_path = resolve_config(args.config.clone());
	let config = load_config(&config_path)?;
	let settings = &config.settings;

	let commands: Arc<dyn CommandRunner> = Arc::new(match settings.dump_timeout {
		Some(limit) => SystemRunner::with_timeout(limit),
		None => SystemRunner::new(),
	});
	let hub = Arc::new(HubClient::new(settings.hub_endpoint.as_str(), settings.timeout).context("building hub client")?);
	let registry = ProducerRegistry::standard(commands, hub);
	registry.ensure_covers(config.kinds())?;

	let store: Arc<dyn RemoteStore> = if args.dry_run {
		warn!("dry run: artifacts are produced but not uploaded");
		Arc::new(MemoryStore::new())
	} else {
		store::open(&settings.store, settings.timeout).context("opening remote store")?
	};

	let runner = Arc::new(JobRunner::new(Arc::new(registry), store));
	let scheduler = Scheduler::new(runner, args.parallel.unwrap_or(settings.parallel));

	let scratch = settings
		.scratch_dir
		.clone()
		.unwrap_or_else(|| std::env::temp_dir().join("cellar"));
	let ctx = RunContext::new(scratch);
	info!(config = %config_path.display(), run_id = %ctx.run_id(), "cellar run");

	let cancel = ctx.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			warn!("interrupted: finishing running jobs, skipping the rest");
			cancel.cancel();
		}
	});

	let report = scheduler.run(&ctx, &config.targets, &args.filter()).await?;

	if args.json {
		let doc = serde_json::json!({
			"run_id": ctx.run_id().to_string(),
			"results": &report.results,
			"skipped": &report.skipped,
		});
		println!("{}", serde_json::to_string_pretty(&doc)?);
	} else {
		summary::print_report(&report);
	}

	Ok(if report.all_succeeded() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn check(config: Option<PathBuf>) -> Result<ExitCode> {
	let path = resolve_config(config);
	let config = load_config(&path)?;
	summary::print_targets(&config);
	Ok(ExitCode::SUCCESS)
}

async fn discover(token: String, account: String, endpoint: Option<String>) -> Result<ExitCode> {
	let endpoint = endpoint.unwrap_or_else(|| cellar_core::producer::hub::DEFAULT_ENDPOINT.to_string());
	let hub = HubClient::new(endpoint, Duration::from_secs(30)).context("building hub client")?;
	let datasets = hub
		.list_datasets(&account, Some(&token))
		.await
		.with_context(|| format!("listing datasets of {account}"))?;

	if datasets.is_empty() {
		println!("{account} has no datasets");
		return Ok(ExitCode::SUCCESS);
	}
	println!("[accounts.{account}]");
	println!("datasets = [");
	for id in &datasets {
		println!("  \"{id}\",");
	}
	println!("]");
	Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	logging::init(cli.log_dir);

	let outcome = match cli.command {
		Command::Run(args) => run(args).await,
		Command::Check { config } => check(config),
		Command::Discover { token, account, endpoint } => discover(token, account, endpoint).await,
	};

	match outcome {
		Ok(code) => code,
		Err(err) => {
			eprintln!("{} {err:#}", console::style("error:").red().bold());
			ExitCode::from(EXIT_CONFIG)
		}
	}
}
