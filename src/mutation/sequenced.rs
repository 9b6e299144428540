//! Optimistic concurrency retries on `sequence` conflicts.

use crate::config::MutationConfig;
use crate::error::FaultResult;
use crate::reporting::metrics::names;
use crate::reporting::MetricsSink;
use log::{debug, warn};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

pub(crate) struct RetryPolicy<'a> {
    max_retries: usize,
    jitter_ms: u64,
    metrics: &'a dyn MetricsSink,
}

impl<'a> RetryPolicy<'a> {
    pub(crate) fn new(config: &MutationConfig, metrics: &'a dyn MetricsSink) -> Self {
        Self {
            max_retries: config.max_sequence_retries,
            jitter_ms: config.retry_jitter_ms,
            metrics,
        }
    }

    fn backoff(&self, attempt: usize) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::ZERO;
        }
        let step = rand::thread_rng().gen_range(0..=self.jitter_ms);
        Duration::from_millis(step.saturating_mul(attempt as u64))
    }

    /// Run `attempt_fn` until it succeeds, fails with anything other than a
    /// sequencing conflict, or the retry ceiling is reached.
    ///
    /// Every attempt must reload its document; nothing from a failed attempt
    /// is carried into the next.
    pub(crate) async fn run<T, F, Fut>(&self, mut attempt_fn: F) -> FaultResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FaultResult<T>>,
    {
        let mut retries = 0;
        loop {
            match attempt_fn().await {
                Err(fault) if fault.is_sequencing_conflict() && retries < self.max_retries => {
                    retries += 1;
                    self.metrics.increment(names::SEQUENCE_RETRY, 1);
                    let delay = self.backoff(retries);
                    debug!(
                        "sequence conflict on {:?}, retry {} after {:?}",
                        fault.document_id, retries, delay
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(fault) if fault.is_sequencing_conflict() => {
                    warn!("giving up on {:?} after {} sequence retries", fault.document_id, retries);
                    return Err(fault);
                }
                outcome => return outcome,
            }
        }
    }
}
