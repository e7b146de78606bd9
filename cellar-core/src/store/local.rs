use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{RemoteStore, StoreError, is_partial, partial_name, segments};

/// A store rooted at a local directory, e.g. a mounted network share.
#[derive(Debug, Clone)]
pub struct LocalStore {
	root: PathBuf,
}

impl LocalStore {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	fn dir_path(&self, remote_dir: &str) -> Result<PathBuf, StoreError> {
		let mut path = self.root.clone();
		for segment in segments(remote_dir) {
			if segment == ".." {
				return Err(StoreError::Other(format!("path escapes store root: {remote_dir}")));
			}
			path.push(segment);
		}
		Ok(path)
	}
}

fn map_io_error(err: io::Error, path: &Path) -> StoreError {
	let what = format!("{}: {err}", path.display());
	match err.kind() {
		io::ErrorKind::PermissionDenied => StoreError::AuthFailed(what),
		io::ErrorKind::StorageFull => StoreError::QuotaExceeded(what),
		_ => StoreError::Other(what),
	}
}

#[async_trait]
impl RemoteStore for LocalStore {
	async fn list(&self, remote_dir: &str) -> Result<Vec<String>, StoreError> {
		let dir = self.dir_path(remote_dir)?;
		let mut read_dir = match tokio::fs::read_dir(&dir).await {
			Ok(rd) => rd,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(map_io_error(e, &dir)),
		};

		let mut names = Vec::new();
		while let Some(entry) = read_dir.next_entry().await.map_err(|e| map_io_error(e, &dir))? {
			let file_type = entry.file_type().await.map_err(|e| map_io_error(e, &entry.path()))?;
			if !file_type.is_file() {
				continue;
			}
			let name = entry.file_name().to_string_lossy().to_string();
			if !is_partial(&name) {
				names.push(name);
			}
		}
		names.sort();
		Ok(names)
	}

	async fn upload(&self, local_path: &Path, remote_dir: &str, remote_name: &str) -> Result<(), StoreError> {
		let dir = self.dir_path(remote_dir)?;
		tokio::fs::create_dir_all(&dir).await.map_err(|e| map_io_error(e, &dir))?;

		let partial = dir.join(partial_name(remote_name));
		let dest = dir.join(remote_name);
		if let Err(e) = tokio::fs::copy(local_path, &partial).await {
			let _ = tokio::fs::remove_file(&partial).await;
			return Err(map_io_error(e, &partial));
		}
		tokio::fs::rename(&partial, &dest).await.map_err(|e| map_io_error(e, &dest))
	}

	async fn delete(&self, remote_dir: &str, remote_name: &str) -> Result<(), StoreError> {
		let path = self.dir_path(remote_dir)?.join(remote_name);
		match tokio::fs::remove_file(&path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(map_io_error(e, &path)),
		}
	}
}
