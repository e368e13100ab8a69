//! In-flight reaper.
//!
//! Returns messages that some consumer received but never acknowledged or
//! rejected within the visibility timeout to the live queue. Consumers recover
//! their own in-flight list on start; this job covers consumers that never
//! restart under the same name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use herald_common::error::AppError;

use crate::broker::MessageBroker;
use crate::scheduler::PeriodicJob;

pub const JOB_NAME: &str = "in_flight_reaper";

pub struct InFlightReaper {
    broker: Arc<dyn MessageBroker>,
    visibility_timeout: Duration,
}

impl InFlightReaper {
    /// `visibility_timeout` must exceed the longest time a worker may hold one
    /// item, or live deliveries get handed out twice.
    pub fn new(broker: Arc<dyn MessageBroker>, visibility_timeout: Duration) -> Self {
        Self {
            broker,
            visibility_timeout,
        }
    }

    pub async fn run_once(&self) -> Result<usize, AppError> {
        let requeued = self.broker.requeue_expired(self.visibility_timeout).await?;
        if requeued > 0 {
            tracing::warn!(
                requeued,
                timeout_secs = self.visibility_timeout.as_secs(),
                "Reaped unacknowledged deliveries"
            );
        }
        Ok(requeued)
    }
}

#[async_trait]
impl PeriodicJob for InFlightReaper {
    fn name(&self) -> &str {
        JOB_NAME
    }

    async fn run(&self) -> Result<(), AppError> {
        self.run_once().await.map(|_| ())
    }
}
