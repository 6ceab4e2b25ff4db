//! Cron scheduling for the periodic sync jobs.
//!
//! Thin wrapper over tokio-cron-scheduler: jobs are registered as named
//! async closures before `start`, and a failed run is logged and waits for
//! its next scheduled slot rather than retrying immediately.

use crate::error::{AppError, Result};
use std::future::Future;
use tokio_cron_scheduler::JobScheduler;
use tracing::{debug, error, info};

pub struct SchedulerService {
    scheduler: JobScheduler,
    enabled: bool,
    job_count: usize,
    running: bool,
}

impl SchedulerService {
    pub async fn new(enabled: bool) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create scheduler: {}", e)))?;

        Ok(Self {
            scheduler,
            enabled,
            job_count: 0,
            running: false,
        })
    }

    /// Register a named job under a 6-field cron schedule.
    pub async fn add_job<F, Fut>(
        &mut self,
        name: &'static str,
        schedule: &str,
        task: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if !self.enabled {
            debug!(job = name, "Scheduler disabled, job not registered");
            return Ok(());
        }

        let cron_job = tokio_cron_scheduler::Job::new_async(schedule, move |_uuid, _lock| {
            let task = task.clone();
            Box::pin(async move {
                debug!(job = name, "Executing scheduled job");
                let start = std::time::Instant::now();
                match task().await {
                    Ok(()) => {
                        debug!(
                            job = name,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "Job completed"
                        );
                    }
                    Err(e) => {
                        error!(job = name, error = %e, "Job failed");
                    }
                }
            })
        })
        .map_err(|e| AppError::Configuration(format!("Invalid schedule for {}: {}", name, e)))?;

        self.scheduler
            .add(cron_job)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to register {}: {}", name, e)))?;

        self.job_count += 1;
        info!(job = name, schedule, "Job registered");
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        if !self.enabled {
            info!("Scheduler disabled in configuration");
            return Ok(());
        }
        if self.running {
            return Ok(());
        }

        self.scheduler
            .start()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to start scheduler: {}", e)))?;
        self.running = true;
        info!(jobs = self.job_count, "Scheduler started");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to stop scheduler: {}", e)))?;
        self.running = false;
        info!("Scheduler stopped");
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.job_count
    }
}
