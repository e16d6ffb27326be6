//! The job queue contract.
//!
//! Producers enqueue jobs, workers dequeue them and report back with
//! `requeue_or_finish`. Both the embedded and the relational backing
//! implement [`JobQueue`] with identical ordering, dependency and
//! exclusivity guarantees.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::QueueResult;
use crate::id::{JobId, Token, WorkerId};
use crate::job::{DequeuedJob, JobInfo, JobStatus, Payload, payload_from};
use crate::worker::WorkerInfo;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. It becomes ready once every dependency has finished or
    /// been canceled. Fails with `NotExist` if a dependency is unknown, in
    /// which case nothing is recorded.
    async fn enqueue(
        &self,
        job_type: &str,
        args: Payload,
        dependencies: &[JobId],
        channel: &str,
    ) -> QueueResult<JobId>;

    /// Take the oldest ready job whose type is in `job_types` and whose
    /// channel is in `channels`, waiting until one appears. An empty
    /// `channels` only matches the empty channel.
    ///
    /// Returns `DequeueTimeout` once `ctx` is canceled, leaving the queue
    /// untouched.
    async fn dequeue(
        &self,
        ctx: &CancellationToken,
        worker: Option<WorkerId>,
        job_types: &[&str],
        channels: &[&str],
    ) -> QueueResult<DequeuedJob>;

    /// Take a specific job. Never waits: fails with `NotPending` unless the
    /// job is ready right now.
    async fn dequeue_by_id(
        &self,
        ctx: &CancellationToken,
        id: JobId,
        worker: Option<WorkerId>,
    ) -> QueueResult<DequeuedJob>;

    /// Report on a running job. While `retries < max_retries` the job goes
    /// back to pending and `true` is returned; otherwise it finishes with
    /// `result` and `false` is returned. Either way its token and heartbeat
    /// are dropped.
    async fn requeue_or_finish(
        &self,
        id: JobId,
        max_retries: u64,
        result: Option<Payload>,
    ) -> QueueResult<bool>;

    /// Cancel a pending or running job. Dependants treat a canceled job as
    /// finished. Fails with `NotRunning` for finished or unknown jobs
    /// without changing anything.
    async fn cancel_job(&self, id: JobId) -> QueueResult<()>;

    async fn job_status(&self, id: JobId) -> QueueResult<JobStatus>;

    async fn job(&self, id: JobId) -> QueueResult<JobInfo>;

    /// Resolve a live delivery token to its job.
    async fn id_from_token(&self, token: Token) -> QueueResult<JobId>;

    /// Mark a delivery as alive. Unknown tokens are ignored.
    async fn refresh_heartbeat(&self, token: Token) -> QueueResult<()>;

    /// Tokens whose last heartbeat is older than `older_than`.
    async fn heartbeats(&self, older_than: Duration) -> QueueResult<Vec<Token>>;

    async fn insert_worker(&self, channel: &str, architecture: &str) -> QueueResult<WorkerId>;

    async fn update_worker_status(&self, worker: WorkerId) -> QueueResult<()>;

    /// Workers not seen for longer than `older_than`.
    async fn workers(&self, older_than: Duration) -> QueueResult<Vec<WorkerInfo>>;

    /// Remove a worker. Refused with `ActiveJobs` while any heartbeat still
    /// names it, and with `WorkerNotExist` for unknown workers.
    async fn delete_worker(&self, worker: WorkerId) -> QueueResult<()>;

    /// Every job in the store. Scans the whole store.
    async fn all_job_ids(&self) -> QueueResult<Vec<JobId>>;

    /// Jobs no other job depends on. Scans the whole store.
    async fn all_root_job_ids(&self) -> QueueResult<Vec<JobId>>;
}

/// Typed conveniences over [`JobQueue`].
#[async_trait]
pub trait JobQueueExt: JobQueue {
    /// Serialize `args` and enqueue it.
    async fn enqueue_json<T>(
        &self,
        job_type: &str,
        args: &T,
        dependencies: &[JobId],
        channel: &str,
    ) -> QueueResult<JobId>
    where
        T: Serialize + Sync + ?Sized,
    {
        let args = payload_from(args)?;
        self.enqueue(job_type, args, dependencies, channel).await
    }

    /// Serialize `result` and report it via `requeue_or_finish`.
    async fn finish_json<T>(&self, id: JobId, max_retries: u64, result: &T) -> QueueResult<bool>
    where
        T: Serialize + Sync + ?Sized,
    {
        let result = payload_from(result)?;
        self.requeue_or_finish(id, max_retries, Some(result)).await
    }
}

impl<Q: JobQueue + ?Sized> JobQueueExt for Q {}
