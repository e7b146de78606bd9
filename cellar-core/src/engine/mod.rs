pub mod naming;
pub mod runner;
pub mod scheduler;

pub use runner::JobRunner;
pub use scheduler::{Filter, RunReport, Scheduler, SchedulerError, StatusCounts};
