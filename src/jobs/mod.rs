//! Background job scheduler for Keyseat.
//!
//! # Available Jobs
//!
//! - **Session Sweep**: expires sessions whose `last_seen_at + timeout` has
//!   passed, freeing their entitlement slots
//!
//! - **Cache Purge**: drops license record cache entries older than the TTL
//!
//! Both jobs run on their own timer, independent of request handling.
//!
//! # Usage
//!
//! ```rust,ignore
//! use keyseat::jobs::{JobConfig, JobScheduler};
//!
//! let scheduler = JobScheduler::new(authority, JobConfig::default()).await?;
//! scheduler.start().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler as TokioJobScheduler};
use tracing::{error, info};

use crate::authority::LicenseAuthority;
use crate::config::SessionConfig;

mod cache_purge;
mod session_sweep;

pub use cache_purge::run_cache_purge;
pub use session_sweep::run_session_sweep;

/// Configuration for background jobs.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// How often expired sessions are swept (default: every 30 seconds)
    pub sweep_interval: Duration,
    /// How often the record cache is purged (default: every 60 seconds)
    pub cache_purge_interval: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            cache_purge_interval: Duration::from_secs(60),
        }
    }
}

impl From<&SessionConfig> for JobConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            sweep_interval: config.sweep_interval(),
            // Purging more often than the TTL buys nothing.
            cache_purge_interval: config.cache_ttl().max(Duration::from_secs(60)),
        }
    }
}

/// Background job scheduler for Keyseat.
pub struct JobScheduler {
    scheduler: TokioJobScheduler,
    authority: Arc<LicenseAuthority>,
    config: JobConfig,
}

impl JobScheduler {
    /// Create a new job scheduler.
    pub async fn new(authority: Arc<LicenseAuthority>, config: JobConfig) -> Result<Self, JobError> {
        let scheduler = TokioJobScheduler::new()
            .await
            .map_err(|e| JobError::SchedulerError(e.to_string()))?;

        Ok(Self {
            scheduler,
            authority,
            config,
        })
    }

    /// Start the job scheduler with all configured jobs.
    pub async fn start(&self) -> Result<(), JobError> {
        info!("Starting Keyseat job scheduler");

        self.add_session_sweep_job().await?;
        self.add_cache_purge_job().await?;

        self.scheduler
            .start()
            .await
            .map_err(|e| JobError::SchedulerError(e.to_string()))?;

        info!("Keyseat job scheduler started successfully");

        Ok(())
    }

    /// Stop the job scheduler.
    pub async fn shutdown(&mut self) -> Result<(), JobError> {
        info!("Shutting down Keyseat job scheduler");
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| JobError::SchedulerError(e.to_string()))?;
        Ok(())
    }

    /// Add the expired session sweep job.
    async fn add_session_sweep_job(&self) -> Result<(), JobError> {
        if self.config.sweep_interval.is_zero() {
            return Err(JobError::InvalidSchedule(
                "sweep interval must be greater than 0".to_string(),
            ));
        }

        let authority = Arc::clone(&self.authority);

        let job = Job::new_repeated_async(self.config.sweep_interval, move |_uuid, _l| {
            let authority = Arc::clone(&authority);
            Box::pin(async move {
                // The sweep takes shard locks; keep it off the async workers.
                match tokio::task::spawn_blocking(move || run_session_sweep(&authority)).await {
                    Ok(count) => {
                        if count > 0 {
                            info!("Session sweep: {} sessions expired", count);
                        }
                    }
                    Err(e) => {
                        error!("Session sweep failed: {}", e);
                    }
                }
            })
        })
        .map_err(|e| JobError::SchedulerError(e.to_string()))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| JobError::SchedulerError(e.to_string()))?;

        info!(
            "Added session sweep job (every {} s)",
            self.config.sweep_interval.as_secs()
        );

        Ok(())
    }

    /// Add the record cache purge job.
    async fn add_cache_purge_job(&self) -> Result<(), JobError> {
        if self.config.cache_purge_interval.is_zero() {
            return Err(JobError::InvalidSchedule(
                "cache purge interval must be greater than 0".to_string(),
            ));
        }

        let authority = Arc::clone(&self.authority);

        let job = Job::new_repeated_async(self.config.cache_purge_interval, move |_uuid, _l| {
            let authority = Arc::clone(&authority);
            Box::pin(async move {
                let purged = run_cache_purge(&authority);
                if purged > 0 {
                    info!("Cache purge: {} entries dropped", purged);
                }
            })
        })
        .map_err(|e| JobError::SchedulerError(e.to_string()))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| JobError::SchedulerError(e.to_string()))?;

        info!(
            "Added cache purge job (every {} s)",
            self.config.cache_purge_interval.as_secs()
        );

        Ok(())
    }

    /// Run the session sweep immediately (useful for testing or manual triggers).
    pub fn run_session_sweep_now(&self) -> usize {
        run_session_sweep(&self.authority)
    }

    /// Run the cache purge immediately.
    pub fn run_cache_purge_now(&self) -> usize {
        run_cache_purge(&self.authority)
    }
}

/// Errors that can occur in the job scheduler.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}
