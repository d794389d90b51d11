// Job Scheduler - background jobs driving the automation engine

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{debug, error, info};

use crate::automations::AutomationEngine;
use crate::config::EngineConfig;
use crate::error::EngineError;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Engine error: {0}")]
    EngineError(#[from] EngineError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub queue_poll_secs: u64,
    /// Six-field cron expression (seconds first)
    pub schedule_tick_cron: String,
    pub run_cleanup_cron: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            queue_poll_secs: 30,
            // Top of every minute
            schedule_tick_cron: "0 * * * * *".to_string(),
            // Daily at midnight UTC
            run_cleanup_cron: "0 0 0 * * *".to_string(),
        }
    }
}

impl From<&EngineConfig> for JobConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            queue_poll_secs: config.queue_poll_secs,
            ..Self::default()
        }
    }
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    engine: Arc<AutomationEngine>,
    config: JobConfig,
}

impl JobScheduler {
    pub async fn new(engine: Arc<AutomationEngine>, config: JobConfig) -> JobResult<Self> {
        if config.queue_poll_secs == 0 {
            return Err(JobError::ConfigError(
                "RUN_QUEUE_POLL_SECS must be greater than zero".to_string(),
            ));
        }

        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            engine,
            config,
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_run_queue_poller().await?;
        self.schedule_trigger_tick().await?;
        self.schedule_run_cleanup().await?;

        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_run_queue_poller(&self) -> JobResult<()> {
        let interval = self.config.queue_poll_secs;
        let engine = self.engine.clone();

        let job = Job::new_repeated_async(Duration::from_secs(interval), move |_uuid, _lock| {
            let engine = engine.clone();

            Box::pin(async move {
                match engine.resume_due().await {
                    Ok(0) => debug!("Run queue poll: nothing due"),
                    Ok(resumed) => info!("Run queue poll resumed {} run(s)", resumed),
                    Err(e) => error!("Run queue poll failed: {}", e),
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled run queue poller every {} seconds", interval);

        Ok(())
    }

    async fn schedule_trigger_tick(&self) -> JobResult<()> {
        let engine = self.engine.clone();

        let job = Job::new_async(self.config.schedule_tick_cron.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();

            Box::pin(async move {
                match engine.run_schedule_tick().await {
                    Ok(0) => debug!("Schedule tick: no automations due"),
                    Ok(started) => info!("Schedule tick started {} run(s)", started),
                    Err(e) => error!("Schedule tick failed: {}", e),
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled schedule-trigger tick ({})", self.config.schedule_tick_cron);

        Ok(())
    }

    async fn schedule_run_cleanup(&self) -> JobResult<()> {
        let engine = self.engine.clone();

        let job = Job::new_async(self.config.run_cleanup_cron.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();

            Box::pin(async move {
                if let Err(e) = engine.purge_finished_runs().await {
                    error!("Run cleanup failed: {}", e);
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled run cleanup ({})", self.config.run_cleanup_cron);

        Ok(())
    }
}
