pub mod artifact;
pub mod job;
pub mod target;

pub use artifact::Artifact;
pub use job::{JobResult, JobStage, JobStatus};
pub use target::{DbConnection, RepoType, Source, Target, TargetKind};
