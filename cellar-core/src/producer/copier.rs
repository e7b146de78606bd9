use std::{
	fs,
	io::{self, Read, Write},
	path::Path,
};

use thiserror::Error;

const CHUNK_SIZE: usize = 256 * 1024; // 256KB

#[derive(Debug, Error)]
pub enum CopyError {
	#[error("source file not found: {0}")]
	SourceNotFound(String),

	#[error("permission denied: {0}")]
	PermissionDenied(String),

	#[error("disk full: {0}")]
	DiskFull(String),

	#[error("I/O error: {0}")]
	IoError(String),

	#[error("hash mismatch: source={source_hash}, dest={dest_hash}")]
	HashMismatch {
		source_hash: String,
		dest_hash: String,
	},
}

impl CopyError {
	/// Whether this error is transient I/O rather than a broken source.
	pub fn is_retryable(&self) -> bool {
		matches!(self, CopyError::IoError(_))
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResult {
	pub bytes_copied: u64,
	pub digest: String,
}

/// Size and blake3 digest of a finished artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
	pub size_bytes: u64,
	pub digest: String,
}

/// Copy `source` to `dest` in one pass, hashing as we go, then re-read the
/// destination to verify. Blocking; run it on `spawn_blocking`.
pub fn copy_and_hash(source_path: &Path, dest_path: &Path) -> Result<CopyResult, CopyError> {
	if let Some(parent) = dest_path.parent() {
		fs::create_dir_all(parent).map_err(|e| map_io_error(e, parent))?;
	}

	let mut source = fs::File::open(source_path).map_err(|e| map_io_error(e, source_path))?;
	let mut dest = fs::File::create(dest_path).map_err(|e| map_io_error(e, dest_path))?;

	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; CHUNK_SIZE];
	let mut bytes_copied: u64 = 0;

	loop {
		let n = source.read(&mut buf).map_err(|e| map_io_error(e, source_path))?;
		if n == 0 {
			break;
		}

		hasher.update(&buf[..n]);
		dest.write_all(&buf[..n]).map_err(|e| map_io_error(e, dest_path))?;
		bytes_copied += n as u64;
	}

	dest.flush().map_err(|e| map_io_error(e, dest_path))?;
	drop(dest);

	let source_hash = hasher.finalize().to_hex().to_string();
	let dest_hash = digest_file(dest_path)?.digest;
	if source_hash != dest_hash {
		return Err(CopyError::HashMismatch { source_hash, dest_hash });
	}

	Ok(CopyResult { bytes_copied, digest: source_hash })
}

/// Hash a file using blake3 in 256KB chunks.
pub fn digest_file(path: &Path) -> Result<FileDigest, CopyError> {
	let mut file = fs::File::open(path).map_err(|e| map_io_error(e, path))?;
	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; CHUNK_SIZE];
	let mut size_bytes: u64 = 0;

	loop {
		let n = file.read(&mut buf).map_err(|e| map_io_error(e, path))?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
		size_bytes += n as u64;
	}

	Ok(FileDigest { size_bytes, digest: hasher.finalize().to_hex().to_string() })
}

pub(crate) fn map_io_error(err: io::Error, path: &Path) -> CopyError {
	let path = path.display().to_string();
	match err.kind() {
		io::ErrorKind::NotFound => CopyError::SourceNotFound(path),
		io::ErrorKind::PermissionDenied => CopyError::PermissionDenied(path),
		io::ErrorKind::StorageFull => CopyError::DiskFull(path),
		_ => CopyError::IoError(format!("{path}: {err}")),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn copy_and_verify_small_file() {
		let tmp = tempfile::tempdir().unwrap();
		let src = tmp.path().join("source.db");
		let dst = tmp.path().join("nested/dest.db");
		fs::write(&src, "hello world").unwrap();

		let result = copy_and_hash(&src, &dst).unwrap();

		assert_eq!(result.bytes_copied, 11);
		assert_eq!(result.digest, blake3::hash(b"hello world").to_hex().to_string());
		assert_eq!(fs::read_to_string(&dst).unwrap(), "hello world");
	}

	#[test]
	fn digest_empty_file() {
		let tmp = tempfile::tempdir().unwrap();
		let f = tmp.path().join("empty.txt");
		fs::write(&f, "").unwrap();

		let digest = digest_file(&f).unwrap();
		assert_eq!(digest.digest.len(), 64); // blake3 hex
		assert_eq!(digest.size_bytes, 0);
	}

	#[test]
	fn digest_multichunk_file() {
		let tmp = tempfile::tempdir().unwrap();
		let f = tmp.path().join("big.bin");
		let data = vec![42u8; CHUNK_SIZE * 3 + 1000];
		fs::write(&f, &data).unwrap();

		let digest = digest_file(&f).unwrap();

		assert_eq!(digest.digest, blake3::hash(&data).to_hex().to_string());
		assert_eq!(digest.size_bytes, data.len() as u64);
	}

	#[test]
	fn missing_source_is_classified() {
		let tmp = tempfile::tempdir().unwrap();
		let err = copy_and_hash(&tmp.path().join("nope.db"), &tmp.path().join("out.db")).unwrap_err();
		assert!(matches!(err, CopyError::SourceNotFound(_)));
	}

	#[test]
	fn error_classification() {
		assert!(CopyError::IoError("tmp".into()).is_retryable());
		assert!(!CopyError::SourceNotFound("x".into()).is_retryable());
		assert!(!CopyError::PermissionDenied("x".into()).is_retryable());
		assert!(!CopyError::DiskFull("x".into()).is_retryable());
		assert!(!CopyError::HashMismatch { source_hash: "a".into(), dest_hash: "b".into() }.is_retryable());
	}
}
