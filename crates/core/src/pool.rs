//! Worker pool: spawns workers, propagates shutdown, reaps exited workers.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::error::Result;
use crate::store::Store;
use crate::worker::Worker;

/// Supervises a set of worker tasks against one store.
///
/// Workers coordinate through the store only: shutdown is the
/// `workers.stop` config flag, observed by each worker between jobs. A
/// worker that dies mid-job leaves its claim to be stolen on lease expiry;
/// crashed workers are not resurrected.
pub struct WorkerPool {
    store: Store,
    count: usize,
    shutdown_grace: Duration,
}

impl WorkerPool {
    pub fn new(store: Store, count: usize) -> Self {
        Self {
            store,
            count,
            shutdown_grace: Duration::from_secs(30),
        }
    }

    /// Set how long shutdown waits for in-flight jobs before aborting the
    /// remaining workers.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Run the pool until Ctrl-C, or until an external `worker stop`
    /// empties it.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run the pool until `shutdown` resolves or every worker has exited.
    ///
    /// When `shutdown` fires, the stop flag is raised and workers are
    /// given `shutdown_grace` to finish their current job; stragglers are
    /// aborted, after which lease expiry makes their jobs reclaimable.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        // A stale stop flag from a previous run must not kill the new pool
        // on its first tick.
        self.store.clear_stop().await?;

        let mut tasks = JoinSet::new();
        for index in 0..self.count {
            let worker = Worker::new(self.store.clone(), index);
            tasks.spawn(async move { worker.run().await });
        }
        tracing::info!(count = self.count, "worker pool started");

        tokio::pin!(shutdown);
        let grace = tokio::time::sleep(Duration::from_secs(86400 * 365));
        tokio::pin!(grace);
        let mut stop_sent = false;
        let mut aborted = false;

        loop {
            tokio::select! {
                _ = &mut shutdown, if !stop_sent => {
                    tracing::info!("shutdown requested, signalling workers");
                    if let Err(e) = self.store.request_stop().await {
                        tracing::error!(error = %e, "failed to raise stop flag");
                    }
                    stop_sent = true;
                    grace.as_mut().reset(tokio::time::Instant::now() + self.shutdown_grace);
                }
                _ = &mut grace, if stop_sent && !aborted => {
                    tracing::warn!("shutdown grace elapsed, aborting remaining workers");
                    aborted = true;
                    tasks.abort_all();
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        tracing::error!(error = %e, "worker exited with error");
                    }
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "worker task panicked");
                    }
                    None => break,
                }
            }
        }

        tracing::info!("worker pool stopped");
        Ok(())
    }
}
