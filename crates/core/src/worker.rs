//! Worker: the long-running claim/execute/settle loop.

use std::time::Duration;

use crate::config::{self, Settings};
use crate::error::{QueueError, Result};
use crate::executor::Executor;
use crate::job::{unix_now, Job};
use crate::retry::{self, RetryDecision};
use crate::store::Store;

/// Kept between the execution timeout and the lease deadline so a settle
/// always happens on a live lease.
const LEASE_SAFETY_MARGIN: Duration = Duration::from_secs(5);

/// A single worker. Runs one job at a time; competes with its siblings
/// (and with workers in other processes) through the store's claim
/// statement only.
pub struct Worker {
    worker_id: String,
    store: Store,
    executor: Executor,
}

impl Worker {
    pub fn new(store: Store, index: usize) -> Self {
        Self {
            worker_id: generate_worker_id(index),
            store,
            executor: Executor::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until the stop flag is observed or the store fails.
    ///
    /// Registration is an upsert, so a restart reusing this identity
    /// replaces any stale row. The worker record is removed on the way
    /// out, even when the loop ends in error.
    pub async fn run(&self) -> Result<()> {
        self.store
            .register_worker(&self.worker_id, std::process::id())
            .await?;
        tracing::info!(worker = %self.worker_id, "worker started");

        let result = self.poll_loop().await;
        if let Err(e) = &result {
            tracing::error!(worker = %self.worker_id, error = %e, "worker terminating on storage failure");
        }

        if let Err(e) = self.store.unregister_worker(&self.worker_id).await {
            tracing::warn!(worker = %self.worker_id, error = %e, "failed to unregister worker");
        }
        tracing::info!(worker = %self.worker_id, "worker stopped");
        result
    }

    async fn poll_loop(&self) -> Result<()> {
        loop {
            // Config is re-read every tick; `config set` takes effect
            // within one poll interval. The stop flag is only honored
            // between jobs.
            let cfg = self.store.config_all().await?;
            if config::stop_requested(&cfg) {
                tracing::info!(worker = %self.worker_id, "stop flag observed, exiting");
                return Ok(());
            }
            let settings = Settings::from_map(&cfg);

            self.store.touch_worker(&self.worker_id).await?;

            match self
                .store
                .claim_one(&self.worker_id, unix_now(), settings.lease_duration)
                .await?
            {
                Some(job) => self.process(job, &settings).await?,
                None => tokio::time::sleep(settings.poll_interval).await,
            }
        }
    }

    /// Execute a claimed job and settle the outcome.
    ///
    /// While the command runs, the lease is extended at roughly a third of
    /// its duration so a slow job is not stolen from a live worker. Only
    /// storage errors propagate; a stolen lease is logged and abandoned
    /// because the reclaiming worker owns the outcome now.
    async fn process(&self, job: Job, settings: &Settings) -> Result<()> {
        tracing::info!(
            worker = %self.worker_id,
            job_id = job.id,
            attempts = job.attempts,
            max_retries = job.max_retries,
            command = %job.command,
            "claimed job"
        );

        let lease = settings.lease_duration;
        let timeout = settings
            .exec_timeout
            .min(lease.saturating_sub(LEASE_SAFETY_MARGIN))
            .max(Duration::from_secs(1));
        let heartbeat_every = Duration::from_secs((lease.as_secs() / 3).max(1));

        let exec = self.executor.run(&job.command, timeout);
        tokio::pin!(exec);
        let mut ticker = tokio::time::interval(heartbeat_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                outcome = &mut exec => break outcome,
                _ = ticker.tick() => {
                    let deadline = unix_now() + lease.as_secs() as i64;
                    match self.store.extend_lease(job.id, &self.worker_id, deadline).await {
                        Ok(true) => {
                            tracing::trace!(worker = %self.worker_id, job_id = job.id, deadline, "lease extended");
                        }
                        Ok(false) => {
                            tracing::warn!(worker = %self.worker_id, job_id = job.id, "lease no longer held");
                        }
                        Err(e) => {
                            tracing::error!(worker = %self.worker_id, job_id = job.id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        };

        if outcome.success() {
            match self.store.settle_success(job.id, &self.worker_id).await {
                Ok(()) => {
                    tracing::info!(worker = %self.worker_id, job_id = job.id, "job completed");
                }
                Err(QueueError::LeaseStolen(_)) => {
                    tracing::warn!(worker = %self.worker_id, job_id = job.id, "settle rejected, lease was stolen");
                }
                Err(e) => return Err(e),
            }
            return Ok(());
        }

        let attempts = job.attempts + 1;
        let error = format!("rc={} out={}", outcome.exit_code, outcome.output);
        let decision = retry::evaluate(
            attempts,
            job.max_retries,
            settings.base_backoff_secs,
            settings.max_backoff_secs,
        );

        let (next_run_at, to_dlq, delay_secs) = match decision {
            RetryDecision::Retry { delay } => (unix_now() + delay.as_secs() as i64, false, delay.as_secs()),
            RetryDecision::Dead => (unix_now(), true, 0),
        };

        match self
            .store
            .settle_failure(job.id, &self.worker_id, &error, next_run_at, to_dlq)
            .await
        {
            Ok(attempts) if to_dlq => {
                tracing::warn!(
                    worker = %self.worker_id,
                    job_id = job.id,
                    attempts,
                    exit_code = outcome.exit_code,
                    "job moved to dead-letter queue"
                );
            }
            Ok(attempts) => {
                tracing::info!(
                    worker = %self.worker_id,
                    job_id = job.id,
                    attempts,
                    exit_code = outcome.exit_code,
                    retry_in_secs = delay_secs,
                    "job failed, retry scheduled"
                );
            }
            Err(QueueError::LeaseStolen(_)) => {
                tracing::warn!(worker = %self.worker_id, job_id = job.id, "settle rejected, lease was stolen");
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }
}

/// Stable worker identity: host, pid and worker index.
fn generate_worker_id(index: usize) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}-{}", host, std::process::id(), index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_shape() {
        let id = generate_worker_id(3);
        assert!(id.ends_with("-3"));
        assert!(id.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_worker_ids_distinct_per_index() {
        assert_ne!(generate_worker_id(0), generate_worker_id(1));
    }
}
