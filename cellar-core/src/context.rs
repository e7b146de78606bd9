//! Per-run context handed to the scheduler, the runner and the producers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

/// Source of "now". Swapped for [`FixedClock`] in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Everything one orchestration run shares across its jobs.
///
/// Cheap to clone; clones observe the same cancellation state.
#[derive(Clone)]
pub struct RunContext {
    run_id: Ulid,
    scratch_root: PathBuf,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Ulid::new(),
            scratch_root: scratch_root.into(),
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn run_id(&self) -> Ulid {
        self.run_id
    }

    /// Parent directory for per-job scratch directories.
    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Stop handing out not-yet-started jobs. Running jobs finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("scratch_root", &self.scratch_root)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_clock_advances_on_demand() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(chrono::Duration::days(1));
        assert_eq!(clock.now(), Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap());
    }

    #[test]
    fn clones_share_cancellation() {
        let ctx = RunContext::new("/tmp");
        let other = ctx.clone();
        assert!(!other.is_cancelled());

        ctx.cancel();
        assert!(other.is_cancelled());
        assert_eq!(ctx.run_id(), other.run_id());
    }
}
