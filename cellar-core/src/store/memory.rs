use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{RemoteStore, StoreError, normalize_dir};

#[derive(Debug, Default)]
struct State {
	dirs: BTreeMap<String, BTreeSet<String>>,
	fail_list: Option<StoreError>,
	fail_upload: Option<StoreError>,
	fail_delete: BTreeMap<String, StoreError>,
	uploads: u64,
	deletes: Vec<String>,
}

/// An in-process store. Keeps names only; `upload` checks the local file is
/// readable but does not retain its bytes.
///
/// Failures can be injected per operation for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
	state: Mutex<State>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Pre-populate `dir` with `names`.
	pub fn seed<S: AsRef<str>>(&self, dir: &str, names: &[S]) {
		let mut state = self.state.lock();
		let entries = state.dirs.entry(normalize_dir(dir)).or_default();
		entries.extend(names.iter().map(|n| n.as_ref().to_string()));
	}

	pub fn entries(&self, dir: &str) -> Vec<String> {
		let state = self.state.lock();
		state
			.dirs
			.get(&normalize_dir(dir))
			.map(|e| e.iter().cloned().collect())
			.unwrap_or_default()
	}

	pub fn fail_list(&self, err: Option<StoreError>) {
		self.state.lock().fail_list = err;
	}

	pub fn fail_upload(&self, err: Option<StoreError>) {
		self.state.lock().fail_upload = err;
	}

	/// Make deleting `name` (in any directory) fail with `err`.
	pub fn fail_delete_of(&self, name: &str, err: StoreError) {
		self.state.lock().fail_delete.insert(name.to_string(), err);
	}

	pub fn upload_count(&self) -> u64 {
		self.state.lock().uploads
	}

	/// Every name passed to a successful `delete`, in call order.
	pub fn deleted(&self) -> Vec<String> {
		self.state.lock().deletes.clone()
	}
}

#[async_trait]
impl RemoteStore for MemoryStore {
	async fn list(&self, remote_dir: &str) -> Result<Vec<String>, StoreError> {
		let state = self.state.lock();
		if let Some(err) = &state.fail_list {
			return Err(err.clone());
		}
		Ok(state
			.dirs
			.get(&normalize_dir(remote_dir))
			.map(|e| e.iter().cloned().collect())
			.unwrap_or_default())
	}

	async fn upload(&self, local_path: &Path, remote_dir: &str, remote_name: &str) -> Result<(), StoreError> {
		{
			let mut state = self.state.lock();
			state.uploads += 1;
			if let Some(err) = &state.fail_upload {
				return Err(err.clone());
			}
		}

		tokio::fs::metadata(local_path)
			.await
			.map_err(|e| StoreError::Other(format!("{}: {e}", local_path.display())))?;

		let mut state = self.state.lock();
		state
			.dirs
			.entry(normalize_dir(remote_dir))
			.or_default()
			.insert(remote_name.to_string());
		Ok(())
	}

	async fn delete(&self, remote_dir: &str, remote_name: &str) -> Result<(), StoreError> {
		let mut state = self.state.lock();
		if let Some(err) = state.fail_delete.get(remote_name) {
			return Err(err.clone());
		}
		if let Some(entries) = state.dirs.get_mut(&normalize_dir(remote_dir)) {
			entries.remove(remote_name);
		}
		state.deletes.push(remote_name.to_string());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn upload_list_delete() {
		let tmp = tempfile::tempdir().unwrap();
		let file = tmp.path().join("a.sql");
		std::fs::write(&file, "x").unwrap();
		let store = MemoryStore::new();

		store.upload(&file, "/db/", "shop_20240102_030000.sql").await.unwrap();
		store.seed("db", &["shop_20240101_030000.sql"]);
		assert_eq!(
			store.list("/db").await.unwrap(),
			vec!["shop_20240101_030000.sql", "shop_20240102_030000.sql"]
		);

		store.delete("/db/", "shop_20240101_030000.sql").await.unwrap();
		store.delete("/db/", "never-existed").await.unwrap();
		assert_eq!(store.entries("/db/"), vec!["shop_20240102_030000.sql"]);
		assert!(store.list("/elsewhere/").await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn injected_failures_surface() {
		let store = MemoryStore::new();
		store.fail_upload(Some(StoreError::QuotaExceeded("full".into())));
		let err = store.upload(Path::new("/nope"), "/db/", "x").await.unwrap_err();
		assert_eq!(err, StoreError::QuotaExceeded("full".into()));
		assert_eq!(store.upload_count(), 1);
	}
}
