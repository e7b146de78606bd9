use std::{fs, io, path::Path};

use flate2::{Compression, write::GzEncoder};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackResult {
	pub files_packed: u64,
	pub skipped_entries: u64,
}

/// Pack everything under `source_dir` into a gzip'd tarball at `dest`.
///
/// Entries are stored relative to `root_name`, so unpacking yields a single
/// top-level directory. Symlinks and unreadable entries are skipped and
/// counted. Blocking; run it on `spawn_blocking`.
pub fn pack_dir(source_dir: &Path, root_name: &str, dest: &Path) -> io::Result<PackResult> {
	if !source_dir.is_dir() {
		return Err(io::Error::new(
			io::ErrorKind::NotFound,
			format!("not a directory: {}", source_dir.display()),
		));
	}

	let file = fs::File::create(dest)?;
	let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
	builder.follow_symlinks(false);

	let mut result = PackResult::default();

	for entry in WalkDir::new(source_dir).follow_links(false).sort_by_file_name() {
		let entry = match entry {
			Ok(e) => e,
			Err(_) => {
				result.skipped_entries += 1;
				continue;
			}
		};

		if entry.file_type().is_symlink() {
			result.skipped_entries += 1;
			continue;
		}

		let Ok(relative) = entry.path().strip_prefix(source_dir) else {
			result.skipped_entries += 1;
			continue;
		};
		let name = Path::new(root_name).join(relative);

		if entry.file_type().is_dir() {
			builder.append_dir(&name, entry.path())?;
			continue;
		}

		match fs::File::open(entry.path()) {
			Ok(mut f) => {
				builder.append_file(&name, &mut f)?;
				result.files_packed += 1;
			}
			Err(_) => result.skipped_entries += 1,
		}
	}

	builder.into_inner()?.finish()?;
	Ok(result)
}
