//! Worker that processes jobs from the queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imagebuild_core::{DequeuedJob, JobQueue, Payload, QueueError, QueueResult, Token, WorkerId};
use tokio::time::{MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error_result;

/// Pause after a failed dequeue before trying again.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Executes jobs of the types a worker subscribes to.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run `job` to completion and return its result. An error is recorded
    /// as `{"error": {"reason": ...}}`.
    async fn handle(&self, job: &DequeuedJob) -> anyhow::Result<Payload>;
}

/// What a worker announces and consumes.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// The single channel this worker serves.
    pub channel: String,
    pub architecture: String,
    pub job_types: Vec<String>,
    /// Retry budget for jobs whose handler failed.
    pub max_retries: u64,
    /// How often heartbeat and worker status are refreshed while a job runs.
    pub heartbeat_interval: Duration,
}

impl WorkerOptions {
    pub fn new(job_types: Vec<String>) -> Self {
        Self {
            channel: String::new(),
            architecture: std::env::consts::ARCH.to_string(),
            job_types,
            max_retries: 0,
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// A worker that claims and executes jobs.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            queue,
            handler,
            options,
        }
    }

    /// Register, then process jobs until `shutdown` fires. The worker
    /// unregisters itself on the way out.
    pub async fn run(&self, shutdown: CancellationToken) -> QueueResult<()> {
        let worker = self
            .queue
            .insert_worker(&self.options.channel, &self.options.architecture)
            .await?;
        info!(
            worker_id = %worker,
            channel = %self.options.channel,
            job_types = ?self.options.job_types,
            "Starting worker"
        );

        let job_types: Vec<&str> = self.options.job_types.iter().map(String::as_str).collect();
        let channels = [self.options.channel.as_str()];

        loop {
            match self
                .queue
                .dequeue(&shutdown, Some(worker), &job_types, &channels)
                .await
            {
                Ok(job) => self.process(worker, job).await,
                Err(QueueError::DequeueTimeout) => break,
                Err(e) => {
                    warn!(worker_id = %worker, error = %e, "Failed to dequeue job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }

        if let Err(e) = self.queue.delete_worker(worker).await {
            warn!(worker_id = %worker, error = %e, "Failed to unregister worker");
        }
        info!(worker_id = %worker, "Worker stopped");
        Ok(())
    }

    async fn process(&self, worker: WorkerId, job: DequeuedJob) {
        info!(job_id = %job.id, job_type = %job.job_type, worker_id = %worker, "Processing job");

        let mut beat = tokio::time::interval(self.options.heartbeat_interval);
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        beat.tick().await;

        let mut handle = self.handler.handle(&job);
        let outcome = loop {
            tokio::select! {
                outcome = &mut handle => break outcome,
                _ = beat.tick() => self.beat(worker, job.token).await,
            }
        };

        let (result, max_retries) = match outcome {
            Ok(result) => (result, 0),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job handler failed");
                match error_result(&format!("{e:#}")) {
                    Ok(result) => (result, self.options.max_retries),
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to encode error result");
                        return;
                    }
                }
            }
        };

        match self
            .queue
            .requeue_or_finish(job.id, max_retries, Some(result))
            .await
        {
            Ok(true) => info!(job_id = %job.id, "Job requeued"),
            Ok(false) => info!(job_id = %job.id, "Job finished"),
            Err(QueueError::Canceled) => info!(job_id = %job.id, "Job was canceled while running"),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to report job"),
        }
    }

    async fn beat(&self, worker: WorkerId, token: Token) {
        if let Err(e) = self.queue.refresh_heartbeat(token).await {
            warn!(token = %token, error = %e, "Failed to refresh heartbeat");
        }
        if let Err(e) = self.queue.update_worker_status(worker).await {
            warn!(worker_id = %worker, error = %e, "Failed to update worker status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagebuild_core::{JobId, JobState, payload_from_str};
    use imagebuild_fsqueue::FsJobQueue;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, job: &DequeuedJob) -> anyhow::Result<Payload> {
            Ok(job.args.clone())
        }
    }

    /// Fails the first `failures` calls, then echoes.
    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, job: &DequeuedJob) -> anyhow::Result<Payload> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                anyhow::bail!("depsolve failed");
            }
            Ok(job.args.clone())
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl JobHandler for Slow {
        async fn handle(&self, _job: &DequeuedJob) -> anyhow::Result<Payload> {
            sleep(self.0).await;
            Ok(payload_from_str("{}")?)
        }
    }

    fn queue() -> (Arc<dyn JobQueue>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
        (Arc::new(queue), dir)
    }

    fn options(max_retries: u64) -> WorkerOptions {
        WorkerOptions {
            max_retries,
            heartbeat_interval: Duration::from_millis(20),
            ..WorkerOptions::new(vec!["osbuild".to_string()])
        }
    }

    fn spawn(
        queue: &Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
        shutdown: &CancellationToken,
    ) -> JoinHandle<QueueResult<()>> {
        let worker = Worker::new(queue.clone(), handler, options);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    }

    async fn wait_settled(queue: &Arc<dyn JobQueue>, id: JobId) -> imagebuild_core::JobStatus {
        for _ in 0..500 {
            let status = queue.job_status(id).await.unwrap();
            if status.state().is_terminal() {
                return status;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not settle");
    }

    #[tokio::test]
    async fn test_worker_finishes_jobs_with_handler_result() {
        let (queue, _dir) = queue();
        let shutdown = CancellationToken::new();
        let handle = spawn(&queue, Arc::new(Echo), options(0), &shutdown);

        let id = queue
            .enqueue("osbuild", payload_from_str(r#"{"arch":"x86_64"}"#).unwrap(), &[], "")
            .await
            .unwrap();
        let status = wait_settled(&queue, id).await;
        assert_eq!(status.state(), JobState::Finished);
        assert_eq!(status.result.unwrap().get(), r#"{"arch":"x86_64"}"#);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(queue.workers(Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_is_recorded() {
        let (queue, _dir) = queue();
        let shutdown = CancellationToken::new();
        let handler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: usize::MAX,
        });
        let handle = spawn(&queue, handler, options(0), &shutdown);

        let id = queue
            .enqueue("osbuild", payload_from_str("{}").unwrap(), &[], "")
            .await
            .unwrap();
        let status = wait_settled(&queue, id).await;
        assert_eq!(status.state(), JobState::Finished);
        let result: Value = status.result_as().unwrap().unwrap();
        assert_eq!(result["error"]["reason"], "depsolve failed");

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_jobs_are_retried() {
        let (queue, _dir) = queue();
        let shutdown = CancellationToken::new();
        let handler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: 1,
        });
        let handle = spawn(&queue, handler.clone(), options(1), &shutdown);

        let id = queue
            .enqueue("osbuild", payload_from_str("[1]").unwrap(), &[], "")
            .await
            .unwrap();
        let status = wait_settled(&queue, id).await;
        assert_eq!(status.result.unwrap().get(), "[1]");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_kept_fresh_while_running() {
        let (queue, _dir) = queue();
        let shutdown = CancellationToken::new();
        let handler = Arc::new(Slow(Duration::from_millis(300)));
        let handle = spawn(&queue, handler, options(0), &shutdown);

        let id = queue
            .enqueue("osbuild", payload_from_str("{}").unwrap(), &[], "")
            .await
            .unwrap();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.job_status(id).await.unwrap().state(), JobState::Running);
        assert!(queue
            .heartbeats(Duration::from_millis(100))
            .await
            .unwrap()
            .is_empty());
        assert!(queue
            .workers(Duration::from_millis(100))
            .await
            .unwrap()
            .is_empty());

        wait_settled(&queue, id).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
