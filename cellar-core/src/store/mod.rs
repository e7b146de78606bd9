//! Remote storage the artifacts end up in.

pub mod local;
pub mod memory;
pub mod webdav;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use webdav::WebDavStore;

use crate::config::StoreSettings;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
	#[error("store rejected credentials: {0}")]
	AuthFailed(String),

	#[error("cannot reach store: {0}")]
	ConnectFailed(String),

	#[error("store is out of space: {0}")]
	QuotaExceeded(String),

	#[error("store error: {0}")]
	Other(String),
}

impl StoreError {
	pub fn kind(&self) -> &'static str {
		match self {
			StoreError::AuthFailed(_) => "auth_failed",
			StoreError::ConnectFailed(_) => "connect_failed",
			StoreError::QuotaExceeded(_) => "quota_exceeded",
			StoreError::Other(_) => "other",
		}
	}
}

/// A directory tree of artifacts, addressed by `remote_dir` + `remote_name`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
	/// File names directly inside `remote_dir`, sorted. A missing directory
	/// lists as empty.
	async fn list(&self, remote_dir: &str) -> Result<Vec<String>, StoreError>;

	/// Upload `local_path` as `remote_dir/remote_name`, creating the directory
	/// if needed. Never leaves a partial file under the final name.
	async fn upload(&self, local_path: &Path, remote_dir: &str, remote_name: &str) -> Result<(), StoreError>;

	/// Remove one entry. Removing something that is not there succeeds.
	async fn delete(&self, remote_dir: &str, remote_name: &str) -> Result<(), StoreError>;
}

/// Name an in-flight upload is written under before the final rename.
pub fn partial_name(remote_name: &str) -> String {
	format!(".{remote_name}.partial")
}

pub fn is_partial(name: &str) -> bool {
	name.starts_with('.') && name.ends_with(".partial")
}

/// `a//b` → `/a/b/`. Every remote directory carries exactly one leading and
/// one trailing slash.
pub fn normalize_dir(dir: &str) -> String {
	let segments: Vec<&str> = segments(dir).collect();
	if segments.is_empty() {
		"/".to_string()
	} else {
		format!("/{}/", segments.join("/"))
	}
}

pub(crate) fn segments(dir: &str) -> impl Iterator<Item = &str> {
	dir.split('/').filter(|s| !s.is_empty() && *s != ".")
}

/// Build the store a configuration asks for.
pub fn open(settings: &StoreSettings, timeout: Duration) -> Result<Arc<dyn RemoteStore>, StoreError> {
	Ok(match settings {
		StoreSettings::WebDav { url, username, password } => Arc::new(WebDavStore::new(
			url,
			username.clone(),
			password.clone(),
			timeout,
		)?),
		StoreSettings::Local { root } => Arc::new(LocalStore::new(root.clone())),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case::plain("/backups/alice/", "/backups/alice/")]
	#[case::no_slashes("backups/alice", "/backups/alice/")]
	#[case::doubled("//backups//alice///", "/backups/alice/")]
	#[case::root("", "/")]
	#[case::dot("/./db/", "/db/")]
	fn normalizes_remote_dirs(#[case] input: &str, #[case] expected: &str) {
		assert_eq!(normalize_dir(input), expected);
	}

	#[test]
	fn partial_names_are_hidden() {
		let p = partial_name("data1_20240101_030000.tar.gz");
		assert_eq!(p, ".data1_20240101_030000.tar.gz.partial");
		assert!(is_partial(&p));
		assert!(!is_partial("data1_20240101_030000.tar.gz"));
	}
}
