// Background Jobs
//
// Scheduled work for the automation engine: resuming delayed runs, firing
// schedule triggers and purging old run records. Jobs are registered with
// tokio-cron-scheduler.

pub mod scheduler;

pub use scheduler::{JobConfig, JobError, JobResult, JobScheduler};
