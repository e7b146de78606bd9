use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The outcome of one job run: one target, one produce/upload/prune pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub identity: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Present iff status is not `success`.
    pub error_detail: Option<String>,
    /// Present iff the upload went through.
    pub remote_artifact_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<String>,
    pub size_bytes: Option<u64>,
    pub digest: Option<String>,
}

impl JobResult {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    ProduceFailed,
    UploadFailed,
    CleanupFailedNonfatal,
}

impl JobStatus {
    /// Hard failures flip the process exit status; a failed prune does not.
    pub fn is_hard_failure(&self) -> bool {
        matches!(self, JobStatus::ProduceFailed | JobStatus::UploadFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::ProduceFailed => "produce_failed",
            JobStatus::UploadFailed => "upload_failed",
            JobStatus::CleanupFailedNonfatal => "cleanup_failed_nonfatal",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a running job currently is.
///
/// `Pending → Producing → Uploading → Cleaning → Done`, with an early jump to
/// `Done` from any stage that fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Pending,
    Producing,
    Uploading,
    Cleaning,
    Done(JobStatus),
}

impl JobStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Done(_))
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: JobStage) -> bool {
        match (self, next) {
            (JobStage::Pending, JobStage::Producing) => true,
            (JobStage::Producing, JobStage::Uploading) => true,
            (JobStage::Producing, JobStage::Done(JobStatus::ProduceFailed)) => true,
            (JobStage::Uploading, JobStage::Cleaning) => true,
            (JobStage::Uploading, JobStage::Done(JobStatus::UploadFailed)) => true,
            (JobStage::Cleaning, JobStage::Done(JobStatus::Success)) => true,
            (JobStage::Cleaning, JobStage::Done(JobStatus::CleanupFailedNonfatal)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStage::Pending => f.write_str("pending"),
            JobStage::Producing => f.write_str("producing"),
            JobStage::Uploading => f.write_str("uploading"),
            JobStage::Cleaning => f.write_str("cleaning"),
            JobStage::Done(status) => write!(f, "done({status})"),
        }
    }
}
