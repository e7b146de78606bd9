use std::path::PathBuf;

/// A local file a producer materialized for one job run.
///
/// Lives inside the job's scratch directory and disappears with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub local_path: PathBuf,
    /// Without the leading dot, e.g. `tar.gz`.
    pub extension: String,
    /// Prefix carried by an already-named artifact (a prebuilt archive
    /// pulled from the remote repository).
    pub detected_prefix: Option<String>,
    pub size_bytes: u64,
    /// blake3, hex.
    pub digest: String,
}
