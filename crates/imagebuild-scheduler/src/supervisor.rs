//! Reclaims stalled deliveries and prunes idle workers.

use std::sync::Arc;

use imagebuild_config::SupervisorConfig;
use imagebuild_core::{JobQueue, QueueError, QueueResult};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error_result;

/// Reason recorded on jobs whose worker went silent.
pub const STALLED_REASON: &str = "worker stopped responding";

/// Outcome of one supervisor pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorPass {
    /// Stalled jobs sent back to pending.
    pub requeued: usize,
    /// Stalled jobs finished with an error result (retry budget spent).
    pub finished: usize,
    /// Idle workers removed.
    pub workers_removed: usize,
}

impl SupervisorPass {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Periodically scans heartbeats and workers of a queue.
pub struct Supervisor {
    queue: Arc<dyn JobQueue>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(queue: Arc<dyn JobQueue>, config: SupervisorConfig) -> Self {
        Self { queue, config }
    }

    /// Run passes every `interval` until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            heartbeat_timeout_secs = self.config.heartbeat_timeout.as_secs(),
            worker_timeout_secs = self.config.worker_timeout.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "Starting supervisor"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick().await {
                Ok(pass) if !pass.is_empty() => info!(
                    requeued = pass.requeued,
                    finished = pass.finished,
                    workers_removed = pass.workers_removed,
                    "Supervisor pass"
                ),
                Ok(_) => debug!("Supervisor pass found nothing to do"),
                Err(e) => error!(error = %e, "Supervisor pass failed"),
            }
        }

        info!("Supervisor stopped");
    }

    /// A single pass: reclaim stalled deliveries, then prune idle workers.
    pub async fn tick(&self) -> QueueResult<SupervisorPass> {
        let mut pass = SupervisorPass::default();
        self.reclaim_stalled(&mut pass).await?;
        self.prune_workers(&mut pass).await?;
        Ok(pass)
    }

    async fn reclaim_stalled(&self, pass: &mut SupervisorPass) -> QueueResult<()> {
        let tokens = self.queue.heartbeats(self.config.heartbeat_timeout).await?;
        for token in tokens {
            let id = match self.queue.id_from_token(token).await {
                Ok(id) => id,
                Err(QueueError::NotExist) => {
                    debug!(token = %token, "Stale heartbeat has no running job");
                    continue;
                }
                Err(e) => {
                    warn!(token = %token, error = %e, "Failed to resolve token");
                    continue;
                }
            };

            let result = error_result(STALLED_REASON)?;
            match self
                .queue
                .requeue_or_finish(id, self.config.max_retries, Some(result))
                .await
            {
                Ok(true) => {
                    info!(job_id = %id, token = %token, "Requeued stalled job");
                    pass.requeued += 1;
                }
                Ok(false) => {
                    warn!(job_id = %id, token = %token, "Stalled job out of retries, finished");
                    pass.finished += 1;
                }
                Err(QueueError::Canceled | QueueError::NotRunning) => {
                    debug!(job_id = %id, "Stalled job settled concurrently");
                }
                Err(e) => warn!(job_id = %id, error = %e, "Failed to reclaim stalled job"),
            }
        }
        Ok(())
    }

    async fn prune_workers(&self, pass: &mut SupervisorPass) -> QueueResult<()> {
        let idle = self.queue.workers(self.config.worker_timeout).await?;
        for worker in idle {
            match self.queue.delete_worker(worker.id).await {
                Ok(()) => {
                    info!(
                        worker_id = %worker.id,
                        channel = %worker.channel,
                        last_seen = %worker.last_seen,
                        "Removed idle worker"
                    );
                    pass.workers_removed += 1;
                }
                Err(QueueError::ActiveJobs) => {
                    debug!(worker_id = %worker.id, "Idle worker still owns jobs");
                }
                Err(QueueError::WorkerNotExist) => {}
                Err(e) => warn!(worker_id = %worker.id, error = %e, "Failed to remove worker"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagebuild_core::{JobState, payload_from_str};
    use imagebuild_fsqueue::FsJobQueue;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;

    fn queue() -> (Arc<dyn JobQueue>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
        (Arc::new(queue), dir)
    }

    fn config(heartbeat_ms: u64, worker_ms: u64, max_retries: u64) -> SupervisorConfig {
        SupervisorConfig {
            heartbeat_timeout: Duration::from_millis(heartbeat_ms),
            worker_timeout: Duration::from_millis(worker_ms),
            interval: Duration::from_millis(10),
            max_retries,
        }
    }

    #[tokio::test]
    async fn test_requeues_then_finishes_stalled_job() {
        let (queue, _dir) = queue();
        let supervisor = Supervisor::new(queue.clone(), config(50, 3_600_000, 1));
        let ctx = CancellationToken::new();

        let id = queue
            .enqueue("osbuild", payload_from_str("{}").unwrap(), &[], "")
            .await
            .unwrap();
        queue.dequeue(&ctx, None, &["osbuild"], &[""]).await.unwrap();

        // Fresh heartbeat: nothing to do.
        let pass = supervisor.tick().await.unwrap();
        assert!(pass.is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let pass = supervisor.tick().await.unwrap();
        assert_eq!(pass.requeued, 1);
        assert_eq!(queue.job_status(id).await.unwrap().state(), JobState::Pending);

        let job = queue.dequeue(&ctx, None, &["osbuild"], &[""]).await.unwrap();
        assert_eq!(job.id, id);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pass = supervisor.tick().await.unwrap();
        assert_eq!(pass.finished, 1);

        let status = queue.job_status(id).await.unwrap();
        assert_eq!(status.state(), JobState::Finished);
        let result: Value = status.result_as().unwrap().unwrap();
        assert_eq!(result["error"]["reason"], STALLED_REASON);
        assert!(queue.heartbeats(Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prunes_only_idle_workers() {
        let (queue, _dir) = queue();
        let supervisor = Supervisor::new(queue.clone(), config(3_600_000, 10, 0));
        let ctx = CancellationToken::new();

        let busy = queue.insert_worker("", "x86_64").await.unwrap();
        let idle = queue.insert_worker("", "aarch64").await.unwrap();
        queue
            .enqueue("osbuild", payload_from_str("{}").unwrap(), &[], "")
            .await
            .unwrap();
        queue
            .dequeue(&ctx, Some(busy), &["osbuild"], &[""])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let pass = supervisor.tick().await.unwrap();
        assert_eq!(pass.workers_removed, 1);

        let remaining = queue.workers(Duration::ZERO).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, busy);
        assert!(matches!(
            queue.update_worker_status(idle).await,
            Err(QueueError::WorkerNotExist)
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (queue, _dir) = queue();
        let supervisor = Supervisor::new(queue, config(10, 10, 0));
        let shutdown = CancellationToken::new();

        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { supervisor.run(shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor should stop")
            .unwrap();
    }
}
