//! Distributed single-runner scheduler.
//!
//! Before each run of a periodic job, the runner takes a lock key named after
//! the job with `SET NX EX`. Only the instance that created the key runs the
//! body. The key is never released: it expires with its TTL, which also keeps
//! consecutive runs at least one TTL apart across the whole fleet.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use herald_common::error::AppError;

use crate::counter::CounterStore;

/// A job that may run on at most one process at a time.
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    /// Stable name, used as the lock key.
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), AppError>;
}

/// What happened to one scheduled invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDecision {
    Ran,
    /// Another instance holds the lock
    Skipped,
}

/// TTL-lock gate in front of periodic jobs.
#[derive(Clone)]
pub struct SingleRunner {
    counter: Arc<dyn CounterStore>,
    ttl: Duration,
}

impl SingleRunner {
    pub fn new(counter: Arc<dyn CounterStore>, ttl: Duration) -> Self {
        Self { counter, ttl }
    }

    pub fn lock_key(job_name: &str) -> String {
        format!("single_progress_task:{}", job_name)
    }

    /// Run `job` if no other instance ran it within the TTL window.
    ///
    /// A job body error is returned to the caller; the lock stays in place
    /// either way.
    pub async fn try_run(&self, job: &dyn PeriodicJob) -> Result<RunDecision, AppError> {
        let key = Self::lock_key(job.name());
        let acquired = self
            .counter
            .set_if_absent(&key, &uuid::Uuid::new_v4().to_string(), self.ttl)
            .await?;

        if !acquired {
            tracing::debug!(job = job.name(), "Job skipped, lock held elsewhere");
            return Ok(RunDecision::Skipped);
        }

        tracing::debug!(job = job.name(), ttl_secs = self.ttl.as_secs(), "Job lock acquired");
        job.run().await?;
        Ok(RunDecision::Ran)
    }

    /// Attempt `job` every `interval` until `shutdown` fires.
    ///
    /// Failures are logged and the loop keeps going.
    pub async fn run_every(
        &self,
        job: Arc<dyn PeriodicJob>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.try_run(job.as_ref()).await {
                        tracing::error!(job = job.name(), error = %e, "Periodic job failed");
                    }
                }
            }
        }

        tracing::info!(job = job.name(), "Periodic job loop stopped");
    }
}
