//! TOML configuration: one `[global]` table, optional `[accounts.*]` that
//! expand into remote-fetch targets, and `[targets."kind:identity"]`.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::models::{DbConnection, RepoType, Source, Target, TargetKind};
use crate::producer::custom::DEFAULT_EXTENSION;
use crate::producer::hub::DEFAULT_ENDPOINT;
use crate::store::normalize_dir;

pub const DEFAULT_MAX_BACKUPS: u32 = 2;
pub const DEFAULT_PARALLEL: usize = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("cannot read {path}: {source}")]
	Unreadable {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("malformed config: {0}")]
	Malformed(String),

	#[error("[{section}] is missing required field `{field}`")]
	MissingRequiredField { section: String, field: &'static str },
}

impl ConfigError {
	pub fn kind(&self) -> &'static str {
		match self {
			ConfigError::Unreadable { .. } => "unreadable",
			ConfigError::Malformed(_) => "malformed",
			ConfigError::MissingRequiredField { .. } => "missing_required_field",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSettings {
	WebDav {
		url: String,
		username: Option<String>,
		password: Option<String>,
	},
	Local {
		root: PathBuf,
	},
}

/// Run-wide settings from `[global]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
	pub store: StoreSettings,
	pub base_path: String,
	pub max_backups: NonZeroU32,
	pub parallel: usize,
	/// Connect and idle-read limit for the store and the hub.
	pub timeout: Duration,
	/// Wall-clock limit for one dump tool run; unlimited when unset.
	pub dump_timeout: Option<Duration>,
	pub scratch_dir: Option<PathBuf>,
	pub hub_endpoint: String,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub settings: Settings,
	/// In file order, attached databases right after their parent.
	pub targets: Vec<Target>,
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum StoreKind {
	#[default]
	Webdav,
	Local,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalSection {
	#[serde(default)]
	store: StoreKind,
	url: Option<String>,
	username: Option<String>,
	password: Option<String>,
	root: Option<PathBuf>,
	base_path: Option<String>,
	max_backups: Option<u32>,
	parallel: Option<usize>,
	timeout_secs: Option<u64>,
	dump_timeout_secs: Option<u64>,
	scratch_dir: Option<PathBuf>,
	hub_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AccountSection {
	hf_token: Option<String>,
	datasets: Option<Vec<String>>,
	backup_path: Option<String>,
	max_backups: Option<u32>,
	hf_type: Option<RepoType>,
	format_suffix: Option<String>,
}

/// One `[targets."kind:identity"]` table. The attached `database` table uses
/// the same shape plus `db_type` / `db_backup_path`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetSection {
	repo_id: Option<String>,
	hf_token: Option<String>,
	hf_type: Option<RepoType>,

	db_type: Option<String>,
	db_name: Option<String>,
	db_user: Option<String>,
	db_password: Option<String>,
	db_host: Option<String>,
	db_port: Option<u16>,
	ssl_mode: Option<String>,
	db_file: Option<PathBuf>,

	command: Option<String>,
	extension: Option<String>,

	backup_path: Option<String>,
	db_backup_path: Option<String>,
	max_backups: Option<u32>,
	expected_name_prefix: Option<String>,
	format_suffix: Option<String>,

	database: Option<Box<TargetSection>>,
}

impl Config {
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
			path: path.to_path_buf(),
			source,
		})?;
		Self::parse(&text)
	}

	pub fn parse(text: &str) -> Result<Self, ConfigError> {
		let doc: toml::Table = text.parse().map_err(|e: toml::de::Error| ConfigError::Malformed(e.to_string()))?;

		let global = doc
			.get("global")
			.ok_or(ConfigError::MissingRequiredField { section: "global".into(), field: "global" })?;
		let global: GlobalSection = deserialize("global", global.clone())?;
		let settings = settings(global)?;

		let mut targets = Vec::new();
		for (key, value) in &doc {
			match key.as_str() {
				"global" => {}
				"accounts" => {
					let accounts = as_table(key, value)?;
					for (name, section) in accounts {
						let section: AccountSection = deserialize(&format!("accounts.{name}"), section.clone())?;
						expand_account(&settings, name, section, &mut targets)?;
					}
				}
				"targets" => {
					let sections = as_table(key, value)?;
					for (label, section) in sections {
						let section: TargetSection = deserialize(&format!("targets.\"{label}\""), section.clone())?;
						expand_target(&settings, label, section, &mut targets)?;
					}
				}
				other => return Err(ConfigError::Malformed(format!("unknown top-level table [{other}]"))),
			}
		}

		let mut seen = HashSet::new();
		for target in &targets {
			if !seen.insert(target.identity.as_str()) {
				return Err(ConfigError::Malformed(format!("duplicate target identity {}", target.identity)));
			}
		}

		Ok(Self { settings, targets })
	}

	pub fn kinds(&self) -> impl Iterator<Item = TargetKind> + '_ {
		self.targets.iter().map(|t| t.kind)
	}
}

fn as_table<'a>(key: &str, value: &'a toml::Value) -> Result<&'a toml::Table, ConfigError> {
	value
		.as_table()
		.ok_or_else(|| ConfigError::Malformed(format!("[{key}] must be a table")))
}

fn deserialize<T: for<'de> Deserialize<'de>>(section: &str, value: toml::Value) -> Result<T, ConfigError> {
	value
		.try_into()
		.map_err(|e: toml::de::Error| ConfigError::Malformed(format!("[{section}]: {}", e.message())))
}

fn retention(section: &str, value: u32) -> Result<NonZeroU32, ConfigError> {
	NonZeroU32::new(value).ok_or_else(|| ConfigError::Malformed(format!("[{section}] max_backups must be at least 1")))
}

fn settings(global: GlobalSection) -> Result<Settings, ConfigError> {
	let store = match global.store {
		StoreKind::Webdav => StoreSettings::WebDav {
			url: global
				.url
				.ok_or(ConfigError::MissingRequiredField { section: "global".into(), field: "url" })?,
			username: global.username,
			password: global.password,
		},
		StoreKind::Local => StoreSettings::Local {
			root: global
				.root
				.ok_or(ConfigError::MissingRequiredField { section: "global".into(), field: "root" })?,
		},
	};

	let parallel = global.parallel.unwrap_or(DEFAULT_PARALLEL);
	if parallel == 0 {
		return Err(ConfigError::Malformed("[global] parallel must be at least 1".into()));
	}

	Ok(Settings {
		store,
		base_path: normalize_dir(global.base_path.as_deref().unwrap_or("/")),
		max_backups: retention("global", global.max_backups.unwrap_or(DEFAULT_MAX_BACKUPS))?,
		parallel,
		timeout: Duration::from_secs(global.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
		dump_timeout: global.dump_timeout_secs.map(Duration::from_secs),
		scratch_dir: global.scratch_dir,
		hub_endpoint: global.hub_endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
	})
}

fn expand_account(
	settings: &Settings,
	name: &str,
	section: AccountSection,
	targets: &mut Vec<Target>,
) -> Result<(), ConfigError> {
	let label = format!("accounts.{name}");
	let token = section
		.hf_token
		.ok_or_else(|| ConfigError::MissingRequiredField { section: label.clone(), field: "hf_token" })?;
	let datasets = section
		.datasets
		.ok_or_else(|| ConfigError::MissingRequiredField { section: label.clone(), field: "datasets" })?;
	let destination = match section.backup_path {
		Some(p) => normalize_dir(&p),
		None => normalize_dir(&format!("{}{name}", settings.base_path)),
	};
	let keep = match section.max_backups {
		Some(n) => retention(&label, n)?,
		None => settings.max_backups,
	};

	for dataset in datasets {
		let dataset = dataset.trim();
		if dataset.is_empty() {
			continue;
		}
		let repo_id = if dataset.contains('/') { dataset.to_string() } else { format!("{name}/{dataset}") };
		targets.push(Target {
			identity: repo_id.clone(),
			kind: TargetKind::RemoteFetch,
			source: Source::RemoteFetch {
				repo_id,
				token: Some(token.clone()),
				type_hint: section.hf_type,
			},
			destination_path: destination.clone(),
			retention_count: keep,
			expected_name_prefix: None,
			format_suffix: section.format_suffix.clone(),
		});
	}
	Ok(())
}

fn expand_target(
	settings: &Settings,
	label: &str,
	mut section: TargetSection,
	targets: &mut Vec<Target>,
) -> Result<(), ConfigError> {
	let (kind, identity) = label
		.split_once(':')
		.ok_or_else(|| ConfigError::Malformed(format!("target label `{label}` is not `kind:identity`")))?;
	let kind: TargetKind = kind
		.parse()
		.map_err(|_| ConfigError::Malformed(format!("unknown target kind `{kind}` in `{label}`")))?;
	if identity.is_empty() {
		return Err(ConfigError::Malformed(format!("target label `{label}` has an empty identity")));
	}
	let section_name = format!("targets.\"{label}\"");
	if section.db_type.is_some() || section.db_backup_path.is_some() {
		return Err(ConfigError::Malformed(format!(
			"[{section_name}] db_type and db_backup_path belong in an attached database table"
		)));
	}

	let destination = match section.backup_path.take() {
		Some(p) => normalize_dir(&p),
		None => default_destination(settings, kind, identity),
	};
	let keep = match section.max_backups {
		Some(n) => retention(&section_name, n)?,
		None => settings.max_backups,
	};
	let attached = section.database.take();

	let target = build_target(&section_name, kind, identity, &section, destination.clone(), keep)?;
	let parent_identity = target.identity.clone();
	targets.push(target);

	if let Some(mut db) = attached.map(|b| *b) {
		let db_section = format!("{section_name}.database");
		if db.database.is_some() {
			return Err(ConfigError::Malformed(format!("[{db_section}] cannot attach another database")));
		}
		let db_kind: TargetKind = db
			.db_type
			.as_deref()
			.ok_or_else(|| ConfigError::MissingRequiredField { section: db_section.clone(), field: "db_type" })?
			.parse()
			.map_err(|e: crate::models::target::UnknownKind| {
				ConfigError::Malformed(format!("[{db_section}] unknown db_type `{}`", e.0))
			})?;
		if !db_kind.is_database() {
			return Err(ConfigError::Malformed(format!("[{db_section}] db_type must be a database kind")));
		}
		let db_destination = match db.db_backup_path.take().or_else(|| db.backup_path.take()) {
			Some(p) => normalize_dir(&p),
			None => normalize_dir(&format!("{destination}db")),
		};
		let db_keep = match db.max_backups {
			Some(n) => retention(&db_section, n)?,
			None => keep,
		};
		let db_identity = format!("{parent_identity}#db");
		let mut db_target = build_target(&db_section, db_kind, &db_identity, &db, db_destination, db_keep)?;
		// "notes#db" would make a poor file name; name dumps after the database
		if db_target.expected_name_prefix.is_none() {
			db_target.expected_name_prefix = match &db_target.source {
				Source::Database(conn) | Source::Command { connection: conn, .. } => Some(conn.db_name.clone()),
				_ => None,
			};
		}
		targets.push(db_target);
	}

	Ok(())
}

fn default_destination(settings: &Settings, kind: TargetKind, identity: &str) -> String {
	match kind {
		TargetKind::RemoteFetch => match identity.split_once('/') {
			Some((owner, _)) => normalize_dir(&format!("{}{owner}", settings.base_path)),
			None => settings.base_path.clone(),
		},
		db => normalize_dir(&format!("{}{}", settings.base_path, db.as_str())),
	}
}

fn connection(section: &TargetSection, identity: &str) -> DbConnection {
	DbConnection {
		db_name: section.db_name.clone().unwrap_or_else(|| identity.to_string()),
		user: section.db_user.clone(),
		password: section.db_password.clone(),
		host: section.db_host.clone(),
		port: section.db_port,
		ssl_mode: section.ssl_mode.clone(),
	}
}

fn build_target(
	section_name: &str,
	kind: TargetKind,
	identity: &str,
	section: &TargetSection,
	destination_path: String,
	retention_count: NonZeroU32,
) -> Result<Target, ConfigError> {
	let missing = |field| ConfigError::MissingRequiredField { section: section_name.to_string(), field };

	let source = match kind {
		TargetKind::RemoteFetch => Source::RemoteFetch {
			repo_id: section.repo_id.clone().unwrap_or_else(|| identity.to_string()),
			token: section.hf_token.clone(),
			type_hint: section.hf_type,
		},
		TargetKind::Mysql | TargetKind::Postgresql | TargetKind::Mongodb => {
			Source::Database(connection(section, identity))
		}
		TargetKind::Sqlite => Source::File { path: section.db_file.clone().ok_or_else(|| missing("db_file"))? },
		TargetKind::CustomCommand => Source::Command {
			template: section.command.clone().ok_or_else(|| missing("command"))?,
			connection: connection(section, identity),
			extension: section
				.extension
				.clone()
				.map(|e| e.trim_start_matches('.').to_string())
				.filter(|e| !e.is_empty())
				.unwrap_or_else(|| DEFAULT_EXTENSION.to_string()),
		},
	};

	Ok(Target {
		identity: identity.to_string(),
		kind,
		source,
		destination_path,
		retention_count,
		expected_name_prefix: section.expected_name_prefix.clone(),
		format_suffix: section.format_suffix.clone(),
	})
}
