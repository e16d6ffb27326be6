//! Embedded job queue backed by a directory of job documents.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imagebuild_core::{
    DequeuedJob, JobId, JobInfo, JobQueue, JobRecord, JobStatus, Payload, QueueError, QueueResult,
    Token, WorkerId, WorkerInfo, clock,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::Waiters;
use crate::documents::DocumentStore;
use crate::index::Index;

#[derive(Debug, Clone)]
struct Heartbeat {
    worker: Option<WorkerId>,
    last_beat: DateTime<Utc>,
}

/// Everything guarded by the store mutex.
#[derive(Default)]
struct State {
    jobs: HashMap<JobId, JobRecord>,
    index: Index,
    heartbeats: HashMap<Token, Heartbeat>,
    workers: HashMap<WorkerId, WorkerInfo>,
    waiters: Waiters,
}

impl State {
    /// Rebuild the indexes from the documents found on disk.
    fn recover(mut jobs: Vec<JobRecord>) -> Self {
        jobs.sort_by_key(|job| (job.queued_at, job.id));
        let order: Vec<JobId> = jobs.iter().map(|job| job.id).collect();

        let mut state = State::default();
        for seq in jobs.iter().filter_map(|job| job.ready_seq) {
            state.index.observe_seq(seq);
        }
        state.jobs = jobs.into_iter().map(|job| (job.id, job)).collect();

        let now = clock::now();
        let mut ready = 0usize;
        let mut running = 0usize;
        for id in order {
            let job = &state.jobs[&id];
            for dep in &job.dependencies {
                if !state.jobs.contains_key(dep) {
                    warn!(job_id = %id, dependency = %dep, "Job depends on a missing document");
                }
            }
            if state.index.track(job, &state.jobs) {
                ready += 1;
            }
            // Deliveries survive a restart; the supervisor decides their fate.
            if let (true, Some(token)) = (job.is_running(), job.token) {
                state.index.bind_token(token, id);
                state.heartbeats.insert(
                    token,
                    Heartbeat {
                        worker: None,
                        last_beat: now,
                    },
                );
                running += 1;
            }
        }

        info!(jobs = state.jobs.len(), ready, running, "Recovered job queue");
        state
    }

    fn insert_job(&mut self, job: JobRecord) {
        let id = job.id;
        self.jobs.insert(id, job);
        let job = &self.jobs[&id];
        if self.index.track(job, &self.jobs) {
            self.waiters.notify(&job.job_type, &job.channel);
        }
    }

    /// Propagate readiness after `id` finished or was canceled.
    ///
    /// Each released dependant gets its ready sequence recorded in its
    /// document. A failed write only loses the position across a restart.
    fn settle(&mut self, documents: &DocumentStore, id: JobId) {
        for ready in self.index.settle(id, &self.jobs) {
            let seq = self.index.next_seq();
            let Some(job) = self.jobs.get_mut(&ready) else {
                continue;
            };
            job.ready_seq = Some(seq);
            if let Err(e) = documents.write(job) {
                warn!(job_id = %ready, error = %e, "Failed to record ready position");
            }
            self.index.push_ready(job);
            self.waiters.notify(&job.job_type, &job.channel);
        }
    }

    /// Queue a requeued job again at its new ready position.
    fn make_ready(&mut self, id: JobId) {
        if let Some(job) = self.jobs.get(&id) {
            self.index.push_ready(job);
            self.waiters.notify(&job.job_type, &job.channel);
        }
    }

    fn drop_delivery(&mut self, token: Token) {
        self.index.unbind_token(token);
        self.heartbeats.remove(&token);
    }

    /// Hand a ready job to a worker: persist the new token first, then
    /// update the indexes.
    fn start(
        &mut self,
        documents: &DocumentStore,
        id: JobId,
        worker: Option<WorkerId>,
    ) -> QueueResult<DequeuedJob> {
        let mut job = self.jobs.get(&id).cloned().ok_or(QueueError::NotExist)?;
        let token = Token::new();
        job.start(token);
        documents.write(&job)?;

        self.index.remove_ready(&job);
        self.index.bind_token(token, id);
        self.heartbeats.insert(
            token,
            Heartbeat {
                worker,
                last_beat: clock::now(),
            },
        );
        let delivery = job.delivery(token);
        self.jobs.insert(id, job);

        debug!(job_id = %id, token = %token, worker_id = ?worker, "Dequeued job");
        Ok(delivery)
    }

    fn is_ready(&self, job: &JobRecord) -> bool {
        job.is_ready(|dep| self.jobs.get(dep).is_some_and(JobRecord::is_settled))
    }
}

/// Single-process job queue persisting one document per job.
///
/// The directory is locked while the queue is open; a second `FsJobQueue`
/// on the same directory, in this or any other process, fails to open.
/// Heartbeats and workers are kept in memory only.
pub struct FsJobQueue {
    documents: DocumentStore,
    state: Mutex<State>,
}

impl FsJobQueue {
    /// Open the store rooted at `root`, creating the directory if needed and
    /// rebuilding the in-memory indexes from the documents it holds. New
    /// documents are created with permission bits `file_mode`.
    pub fn open(root: impl Into<PathBuf>, file_mode: u32) -> QueueResult<Self> {
        let documents = DocumentStore::open(root, file_mode)?;
        let jobs = documents.read_all()?;
        let state = State::recover(jobs);
        info!(root = %documents.root().display(), "Opened embedded job queue");
        Ok(Self {
            documents,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unregisters a blocked dequeuer however its wait ends.
struct Registration<'a> {
    queue: &'a FsJobQueue,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.queue.lock().waiters.remove(self.id);
    }
}

#[async_trait]
impl JobQueue for FsJobQueue {
    async fn enqueue(
        &self,
        job_type: &str,
        args: Payload,
        dependencies: &[JobId],
        channel: &str,
    ) -> QueueResult<JobId> {
        let mut state = self.lock();
        if let Some(missing) = dependencies.iter().find(|dep| !state.jobs.contains_key(dep)) {
            debug!(dependency = %missing, "Refusing job with unknown dependency");
            return Err(QueueError::NotExist);
        }

        let mut job = JobRecord::new(job_type, args, dependencies.to_vec(), channel);
        if state.is_ready(&job) {
            job.ready_seq = Some(state.index.next_seq());
        }
        let id = job.id;
        self.documents.write(&job)?;
        state.insert_job(job);

        debug!(job_id = %id, job_type, channel, "Enqueued job");
        Ok(id)
    }

    async fn dequeue(
        &self,
        ctx: &CancellationToken,
        worker: Option<WorkerId>,
        job_types: &[&str],
        channels: &[&str],
    ) -> QueueResult<DequeuedJob> {
        let (waiter, mut wake) = {
            let mut state = self.lock();
            if let Some(id) = state.index.peek_matching(job_types, channels) {
                return state.start(&self.documents, id, worker);
            }
            state.waiters.register(job_types, channels)
        };
        let _registration = Registration {
            queue: self,
            id: waiter,
        };

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Err(QueueError::DequeueTimeout),
                _ = wake.recv() => {}
            }

            let mut state = self.lock();
            if let Some(id) = state.index.peek_matching(job_types, channels) {
                let delivery = state.start(&self.documents, id, worker);
                // Release before the registration guard takes the lock again.
                drop(state);
                return delivery;
            }
        }
    }

    async fn dequeue_by_id(
        &self,
        ctx: &CancellationToken,
        id: JobId,
        worker: Option<WorkerId>,
    ) -> QueueResult<DequeuedJob> {
        if ctx.is_cancelled() {
            return Err(QueueError::DequeueTimeout);
        }

        let mut state = self.lock();
        let job = state.jobs.get(&id).ok_or(QueueError::NotPending)?;
        if !state.is_ready(job) {
            return Err(QueueError::NotPending);
        }
        state.start(&self.documents, id, worker)
    }

    async fn requeue_or_finish(
        &self,
        id: JobId,
        max_retries: u64,
        result: Option<Payload>,
    ) -> QueueResult<bool> {
        let mut state = self.lock();
        let current = state.jobs.get(&id).ok_or(QueueError::NotExist)?;

        if current.canceled {
            if let Some(token) = current.token {
                state.drop_delivery(token);
            }
            return Err(QueueError::Canceled);
        }
        if !current.is_running() {
            return Err(QueueError::NotRunning);
        }

        let mut job = current.clone();
        let token = job.token;
        let requeue = job.retries < max_retries;
        if requeue {
            job.requeue();
            job.ready_seq = Some(state.index.next_seq());
        } else {
            job.finish(result);
        }
        self.documents.write(&job)?;
        state.jobs.insert(id, job);
        if let Some(token) = token {
            state.drop_delivery(token);
        }

        if requeue {
            state.make_ready(id);
            debug!(job_id = %id, "Requeued job");
        } else {
            state.settle(&self.documents, id);
            debug!(job_id = %id, "Finished job");
        }
        Ok(requeue)
    }

    async fn cancel_job(&self, id: JobId) -> QueueResult<()> {
        let mut state = self.lock();
        let current = state.jobs.get(&id).ok_or(QueueError::NotRunning)?;
        if current.finished_at.is_some() {
            return Err(QueueError::NotRunning);
        }
        if current.canceled {
            return Ok(());
        }

        let mut job = current.clone();
        job.canceled = true;
        self.documents.write(&job)?;
        state.index.remove_ready(&job);
        state.jobs.insert(id, job);
        state.settle(&self.documents, id);

        debug!(job_id = %id, "Canceled job");
        Ok(())
    }

    async fn job_status(&self, id: JobId) -> QueueResult<JobStatus> {
        let state = self.lock();
        let job = state.jobs.get(&id).ok_or(QueueError::NotExist)?;
        Ok(job.status(state.index.dependents(id)))
    }

    async fn job(&self, id: JobId) -> QueueResult<JobInfo> {
        let state = self.lock();
        let job = state.jobs.get(&id).ok_or(QueueError::NotExist)?;
        Ok(job.info())
    }

    async fn id_from_token(&self, token: Token) -> QueueResult<JobId> {
        let state = self.lock();
        let id = state
            .index
            .job_for_token(token)
            .ok_or(QueueError::NotExist)?;
        match state.jobs.get(&id) {
            Some(job) if !job.is_settled() => Ok(id),
            _ => Err(QueueError::NotExist),
        }
    }

    async fn refresh_heartbeat(&self, token: Token) -> QueueResult<()> {
        let mut state = self.lock();
        match state.heartbeats.get_mut(&token) {
            Some(heartbeat) => heartbeat.last_beat = clock::now(),
            None => warn!(token = %token, "Heartbeat for unknown token"),
        }
        Ok(())
    }

    async fn heartbeats(&self, older_than: Duration) -> QueueResult<Vec<Token>> {
        let state = self.lock();
        Ok(state
            .heartbeats
            .iter()
            .filter(|(_, hb)| clock::is_older_than(hb.last_beat, older_than))
            .map(|(token, _)| *token)
            .collect())
    }

    async fn insert_worker(&self, channel: &str, architecture: &str) -> QueueResult<WorkerId> {
        let worker = WorkerInfo {
            id: WorkerId::new(),
            channel: channel.to_string(),
            architecture: architecture.to_string(),
            last_seen: clock::now(),
        };
        let id = worker.id;
        self.lock().workers.insert(id, worker);
        debug!(worker_id = %id, channel, architecture, "Registered worker");
        Ok(id)
    }

    async fn update_worker_status(&self, worker: WorkerId) -> QueueResult<()> {
        let mut state = self.lock();
        let info = state
            .workers
            .get_mut(&worker)
            .ok_or(QueueError::WorkerNotExist)?;
        info.last_seen = clock::now();
        Ok(())
    }

    async fn workers(&self, older_than: Duration) -> QueueResult<Vec<WorkerInfo>> {
        let state = self.lock();
        let mut stale: Vec<WorkerInfo> = state
            .workers
            .values()
            .filter(|w| clock::is_older_than(w.last_seen, older_than))
            .cloned()
            .collect();
        stale.sort_by_key(|w| w.last_seen);
        Ok(stale)
    }

    async fn delete_worker(&self, worker: WorkerId) -> QueueResult<()> {
        let mut state = self.lock();
        if state
            .heartbeats
            .values()
            .any(|hb| hb.worker == Some(worker))
        {
            return Err(QueueError::ActiveJobs);
        }
        state
            .workers
            .remove(&worker)
            .ok_or(QueueError::WorkerNotExist)?;
        debug!(worker_id = %worker, "Deleted worker");
        Ok(())
    }

    async fn all_job_ids(&self) -> QueueResult<Vec<JobId>> {
        let state = self.lock();
        let mut jobs: Vec<&JobRecord> = state.jobs.values().collect();
        jobs.sort_by_key(|job| (job.queued_at, job.id));
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }

    async fn all_root_job_ids(&self) -> QueueResult<Vec<JobId>> {
        let state = self.lock();
        let mut roots: Vec<&JobRecord> = state
            .jobs
            .values()
            .filter(|job| !state.index.has_dependents(job.id))
            .collect();
        roots.sort_by_key(|job| (job.queued_at, job.id));
        Ok(roots.into_iter().map(|job| job.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagebuild_core::{JobState, payload_from_str};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn new_queue() -> (Arc<dyn JobQueue>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
        (Arc::new(queue), dir)
    }

    imagebuild_core::contract_tests!(new_queue);

    fn null() -> Payload {
        payload_from_str("null").unwrap()
    }

    #[tokio::test]
    async fn test_restart_restores_ready_queue() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, c) = {
            let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
            let a = queue.enqueue("octopus", null(), &[], "").await.unwrap();
            let b = queue.enqueue("octopus", null(), &[], "").await.unwrap();
            let c = queue.enqueue("octopus", null(), &[a], "").await.unwrap();
            (a, b, c)
        };

        let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
        let ctx = CancellationToken::new();
        assert_eq!(
            queue.dequeue(&ctx, None, &["octopus"], &[""]).await.unwrap().id,
            a
        );
        assert_eq!(
            queue.dequeue(&ctx, None, &["octopus"], &[""]).await.unwrap().id,
            b
        );
        queue.requeue_or_finish(a, 0, None).await.unwrap();
        let job = queue.dequeue(&ctx, None, &["octopus"], &[""]).await.unwrap();
        assert_eq!(job.id, c);
        assert_eq!(job.dependencies, vec![a]);
    }

    #[tokio::test]
    async fn test_restart_keeps_running_deliveries() {
        let dir = tempfile::tempdir().unwrap();
        let (id, token) = {
            let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
            let id = queue.enqueue("octopus", null(), &[], "").await.unwrap();
            let ctx = CancellationToken::new();
            let job = queue.dequeue(&ctx, None, &["octopus"], &[""]).await.unwrap();
            (id, job.token)
        };

        let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
        assert_eq!(queue.job_status(id).await.unwrap().state(), JobState::Running);
        assert_eq!(queue.id_from_token(token).await.unwrap(), id);
        assert_eq!(
            queue.heartbeats(Duration::from_secs(3600)).await.unwrap(),
            Vec::<Token>::new()
        );

        // Not requeued automatically.
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(matches!(
            queue.dequeue(&ctx, None, &["octopus"], &[""]).await,
            Err(QueueError::DequeueTimeout)
        ));

        assert!(queue.requeue_or_finish(id, 1, None).await.unwrap());
        let job = queue
            .dequeue(&CancellationToken::new(), None, &["octopus"], &[""])
            .await
            .unwrap();
        assert_eq!(job.id, id);
    }

    #[tokio::test]
    async fn test_restart_preserves_finished_results() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
            let id = queue.enqueue("octopus", null(), &[], "").await.unwrap();
            let ctx = CancellationToken::new();
            queue.dequeue(&ctx, None, &["octopus"], &[""]).await.unwrap();
            queue
                .requeue_or_finish(id, 0, Some(payload_from_str(r#"{"ok": true}"#).unwrap()))
                .await
                .unwrap();
            id
        };

        let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
        let status = queue.job_status(id).await.unwrap();
        assert_eq!(status.state(), JobState::Finished);
        assert_eq!(status.result.unwrap().get(), r#"{"ok": true}"#);
    }

    #[tokio::test]
    async fn test_failed_enqueue_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
        let err = queue
            .enqueue("octopus", null(), &[JobId::new()], "")
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotExist));
        let documents = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|entry| {
                let path = entry.as_ref().unwrap().path();
                path.extension().is_some_and(|ext| ext == "json")
            })
            .count();
        assert_eq!(documents, 0);
    }

    #[tokio::test]
    async fn test_canceled_dequeue_unregisters_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
        let ctx = imagebuild_core::testing::deadline(Duration::from_millis(50));
        let err = queue
            .dequeue(&ctx, None, &["octopus"], &[""])
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DequeueTimeout));
        assert_eq!(queue.lock().waiters.len(), 0);
    }

    #[tokio::test]
    async fn test_restart_keeps_ready_order() {
        let dir = tempfile::tempdir().unwrap();
        let (early, late) = {
            let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
            let gate = queue.enqueue("gate", null(), &[], "").await.unwrap();
            let late = queue.enqueue("octopus", null(), &[gate], "").await.unwrap();
            let early = queue.enqueue("octopus", null(), &[], "").await.unwrap();
            let ctx = CancellationToken::new();
            queue.dequeue(&ctx, None, &["gate"], &[""]).await.unwrap();
            queue.requeue_or_finish(gate, 0, None).await.unwrap();
            (early, late)
        };

        let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
        let after = queue.enqueue("octopus", null(), &[], "").await.unwrap();
        let ctx = CancellationToken::new();
        for expected in [early, late, after] {
            let job = queue.dequeue(&ctx, None, &["octopus"], &[""]).await.unwrap();
            assert_eq!(job.id, expected);
        }
    }

    #[tokio::test]
    async fn test_directory_cannot_be_opened_twice() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
        let err = FsJobQueue::open(dir.path(), 0o600).err().unwrap();
        assert!(matches!(err, QueueError::Io(ref e) if e.kind() == std::io::ErrorKind::WouldBlock));

        let id = queue.enqueue("octopus", null(), &[], "").await.unwrap();
        drop(queue);
        let queue = FsJobQueue::open(dir.path(), 0o600).unwrap();
        assert_eq!(queue.all_job_ids().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_documents_use_configured_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let queue = FsJobQueue::open(dir.path(), 0o664).unwrap();
        let id = queue.enqueue("octopus", null(), &[], "").await.unwrap();
        let path = dir.path().join(format!("{id}.json"));
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o664);
    }
}
