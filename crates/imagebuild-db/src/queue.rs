//! PostgreSQL implementation of [`JobQueue`].
//!
//! Dequeue claims rows with `FOR UPDATE SKIP LOCKED`, so any number of
//! processes may share one database. Timestamps are taken from the
//! database clock.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imagebuild_core::{
    DequeuedJob, JobId, JobInfo, JobQueue, JobRecord, JobStatus, Payload, QueueError, QueueResult,
    Token, WorkerId, WorkerInfo,
};
use serde_json::value::RawValue;
use sqlx::{PgConnection, PgPool};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::listener::{self, CHANNEL};
use crate::DbResult;

/// Dequeuers re-check this often even without a notification.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Ages beyond this are clamped; nothing is that old.
const MAX_AGE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

macro_rules! select_jobs {
    ($rest:literal) => {
        concat!(
            "SELECT id, type, args::text AS args, channel, queued_at, started_at, finished_at, \
             retries, canceled, result::text AS result, token, ready_seq FROM jobs ",
            $rest
        )
    };
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    #[sqlx(rename = "type")]
    job_type: String,
    args: String,
    channel: String,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    retries: i64,
    canceled: bool,
    result: Option<String>,
    token: Option<Uuid>,
    ready_seq: Option<i64>,
}

impl JobRow {
    fn into_record(self, dependencies: Vec<JobId>) -> DbResult<JobRecord> {
        Ok(JobRecord {
            id: JobId::from_uuid(self.id),
            job_type: self.job_type,
            args: RawValue::from_string(self.args)?,
            dependencies,
            channel: self.channel,
            queued_at: self.queued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            retries: u64::try_from(self.retries).unwrap_or_default(),
            canceled: self.canceled,
            result: self.result.map(RawValue::from_string).transpose()?,
            token: self.token.map(Token::from_uuid),
            ready_seq: self.ready_seq.and_then(|seq| u64::try_from(seq).ok()),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WorkerRow {
    id: Uuid,
    channel: String,
    architecture: String,
    last_seen: DateTime<Utc>,
}

impl From<WorkerRow> for WorkerInfo {
    fn from(row: WorkerRow) -> Self {
        WorkerInfo {
            id: WorkerId::from_uuid(row.id),
            channel: row.channel,
            architecture: row.architecture,
            last_seen: row.last_seen,
        }
    }
}

/// Lock state of a job read under `FOR UPDATE`.
#[derive(Debug, sqlx::FromRow)]
struct JobLock {
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    retries: i64,
    canceled: bool,
}

fn age_secs(older_than: Duration) -> f64 {
    older_than.min(MAX_AGE).as_secs_f64()
}

fn uuids(ids: &[JobId]) -> Vec<Uuid> {
    ids.iter().map(|id| *id.as_uuid()).collect()
}

async fn notify(conn: &mut PgConnection) -> DbResult<()> {
    sqlx::query("SELECT pg_notify($1, '')")
        .bind(CHANNEL)
        .execute(conn)
        .await?;
    Ok(())
}

async fn dependencies_of(conn: &mut PgConnection, id: Uuid) -> DbResult<Vec<JobId>> {
    let deps: Vec<Uuid> = sqlx::query_scalar(
        "SELECT dependency_id FROM job_dependencies WHERE job_id = $1 ORDER BY position",
    )
    .bind(id)
    .fetch_all(conn)
    .await?;
    Ok(deps.into_iter().map(JobId::from_uuid).collect())
}

async fn load_job(conn: &mut PgConnection, id: JobId) -> DbResult<JobRecord> {
    let row = sqlx::query_as::<_, JobRow>(select_jobs!("WHERE id = $1"))
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(QueueError::NotExist)?;
    let deps = dependencies_of(conn, row.id).await?;
    row.into_record(deps)
}

/// Queue every dependant of `id` whose dependencies are now all settled.
/// Returns how many became ready.
///
/// The dependants are locked first, so two dependencies settling at once
/// are serialized and the later one sees the earlier one's commit when it
/// re-checks `ready_jobs`. Locks are taken in id order, which follows
/// creation order, as in `insert_job`.
async fn release_dependents(conn: &mut PgConnection, id: JobId) -> DbResult<u64> {
    let dependants: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM jobs
        WHERE id IN (SELECT job_id FROM job_dependencies WHERE dependency_id = $1)
        ORDER BY id
        FOR UPDATE
        "#,
    )
    .bind(id.as_uuid())
    .fetch_all(&mut *conn)
    .await?;
    if dependants.is_empty() {
        return Ok(0);
    }

    let released = sqlx::query(
        r#"
        UPDATE jobs SET ready_seq = nextval('ready_seq')
        WHERE id = ANY($1)
          AND id IN (SELECT id FROM ready_jobs)
        "#,
    )
    .bind(&dependants)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(released)
}

/// Record a new delivery and build what the worker receives.
async fn deliver(
    conn: &mut PgConnection,
    claimed: (Uuid, String, String),
    token: Token,
    worker: Option<WorkerId>,
) -> DbResult<DequeuedJob> {
    let (id, job_type, args) = claimed;
    sqlx::query(
        "INSERT INTO heartbeats (token, job_id, worker_id, last_beat) VALUES ($1, $2, $3, NOW())",
    )
    .bind(token.as_uuid())
    .bind(id)
    .bind(worker.map(|w| *w.as_uuid()))
    .execute(&mut *conn)
    .await?;

    let dependencies = dependencies_of(conn, id).await?;
    Ok(DequeuedJob {
        id: JobId::from_uuid(id),
        token,
        dependencies,
        job_type,
        args: RawValue::from_string(args)?,
    })
}

/// Job queue stored in PostgreSQL.
///
/// Must be created inside a Tokio runtime: a background task listens for
/// ready-job notifications until the queue is dropped.
pub struct PgJobQueue {
    pool: PgPool,
    changes: watch::Receiver<u64>,
    shutdown: CancellationToken,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        let shutdown = CancellationToken::new();
        let changes = listener::spawn(pool.clone(), shutdown.clone());
        Self {
            pool,
            changes,
            shutdown,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_job(
        &self,
        job_type: &str,
        args: &RawValue,
        dependencies: &[JobId],
        channel: &str,
    ) -> DbResult<JobId> {
        let mut tx = self.pool.begin().await?;
        let dep_ids = uuids(dependencies);

        // Share-lock the dependencies: a concurrent finish waits for this
        // insert and then sees the new dependant.
        let deps: Vec<(Uuid, bool)> = sqlx::query_as(
            r#"
            SELECT id, finished_at IS NOT NULL OR canceled FROM jobs
            WHERE id = ANY($1)
            ORDER BY id
            FOR SHARE
            "#,
        )
        .bind(&dep_ids)
        .fetch_all(&mut *tx)
        .await?;

        let known: HashSet<Uuid> = deps.iter().map(|(id, _)| *id).collect();
        if let Some(missing) = dep_ids.iter().find(|id| !known.contains(id)) {
            debug!(dependency = %missing, "Refusing job with unknown dependency");
            return Err(QueueError::NotExist.into());
        }
        let ready = deps.iter().all(|(_, settled)| *settled);

        let id = JobId::new();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, type, args, channel, queued_at, ready_seq)
            VALUES ($1, $2, $3::json, $4, NOW(), CASE WHEN $5 THEN nextval('ready_seq') END)
            "#,
        )
        .bind(id.as_uuid())
        .bind(job_type)
        .bind(args.get())
        .bind(channel)
        .bind(ready)
        .execute(&mut *tx)
        .await?;

        for (position, dep) in dep_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO job_dependencies (job_id, dependency_id, position) VALUES ($1, $2, $3)",
            )
            .bind(id.as_uuid())
            .bind(dep)
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }

        if ready {
            notify(&mut tx).await?;
        }
        tx.commit().await?;

        debug!(job_id = %id, job_type, channel, ready, "Enqueued job");
        Ok(id)
    }

    /// One attempt at claiming the oldest matching ready job.
    ///
    /// The outer conditions are re-evaluated against the latest row version
    /// if another transaction touched it while we waited for the lock.
    async fn try_dequeue(
        &self,
        worker: Option<WorkerId>,
        job_types: &[&str],
        channels: &[&str],
    ) -> DbResult<Option<DequeuedJob>> {
        let mut tx = self.pool.begin().await?;
        let token = Token::new();

        let claimed: Option<(Uuid, String, String)> = sqlx::query_as(
            r#"
            UPDATE jobs SET token = $1, started_at = GREATEST(NOW(), jobs.queued_at)
            WHERE id = (
                SELECT id FROM ready_jobs
                WHERE type = ANY($2) AND channel = ANY($3)
                ORDER BY ready_seq NULLS LAST, queued_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
              AND started_at IS NULL
              AND NOT canceled
            RETURNING id, type, args::text
            "#,
        )
        .bind(token.as_uuid())
        .bind(job_types)
        .bind(channels)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(claimed) = claimed else {
            return Ok(None);
        };
        let job = deliver(&mut tx, claimed, token, worker).await?;
        tx.commit().await?;

        debug!(job_id = %job.id, token = %token, worker_id = ?worker, "Dequeued job");
        Ok(Some(job))
    }

    async fn claim_by_id(&self, id: JobId, worker: Option<WorkerId>) -> DbResult<DequeuedJob> {
        let mut tx = self.pool.begin().await?;
        let token = Token::new();

        let claimed: Option<(Uuid, String, String)> = sqlx::query_as(
            r#"
            UPDATE jobs SET token = $1, started_at = GREATEST(NOW(), jobs.queued_at)
            WHERE id = $2
              AND id IN (SELECT id FROM ready_jobs)
              AND started_at IS NULL
              AND NOT canceled
            RETURNING id, type, args::text
            "#,
        )
        .bind(token.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let claimed = claimed.ok_or(QueueError::NotPending)?;
        let job = deliver(&mut tx, claimed, token, worker).await?;
        tx.commit().await?;

        debug!(job_id = %id, token = %token, worker_id = ?worker, "Dequeued job by id");
        Ok(job)
    }

    async fn report(&self, id: JobId, max_retries: u64, result: Option<&str>) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;
        let job = sqlx::query_as::<_, JobLock>(
            "SELECT started_at, finished_at, retries, canceled FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(QueueError::NotExist)?;

        if job.canceled {
            sqlx::query("DELETE FROM heartbeats WHERE job_id = $1")
                .bind(id.as_uuid())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Err(QueueError::Canceled.into());
        }
        if job.started_at.is_none() || job.finished_at.is_some() {
            return Err(QueueError::NotRunning.into());
        }

        let requeue = u64::try_from(job.retries).unwrap_or_default() < max_retries;
        if requeue {
            sqlx::query(
                r#"
                UPDATE jobs
                SET started_at = NULL, token = NULL, retries = retries + 1,
                    ready_seq = nextval('ready_seq')
                WHERE id = $1
                "#,
            )
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE jobs SET finished_at = GREATEST(NOW(), started_at), result = $2::json WHERE id = $1",
            )
            .bind(id.as_uuid())
            .bind(result)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM heartbeats WHERE job_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;

        if requeue || release_dependents(&mut tx, id).await? > 0 {
            notify(&mut tx).await?;
        }
        tx.commit().await?;

        if requeue {
            debug!(job_id = %id, "Requeued job");
        } else {
            debug!(job_id = %id, "Finished job");
        }
        Ok(requeue)
    }

    async fn cancel(&self, id: JobId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let job = sqlx::query_as::<_, JobLock>(
            "SELECT started_at, finished_at, retries, canceled FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(QueueError::NotRunning)?;

        if job.finished_at.is_some() {
            return Err(QueueError::NotRunning.into());
        }
        if job.canceled {
            return Ok(());
        }

        sqlx::query("UPDATE jobs SET canceled = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
        if release_dependents(&mut tx, id).await? > 0 {
            notify(&mut tx).await?;
        }
        tx.commit().await?;

        debug!(job_id = %id, running = job.started_at.is_some(), "Canceled job");
        Ok(())
    }

    async fn status(&self, id: JobId) -> DbResult<JobStatus> {
        let mut conn = self.pool.acquire().await?;
        let job = load_job(&mut conn, id).await?;
        let dependents: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT j.id FROM jobs j
            WHERE EXISTS (
                SELECT 1 FROM job_dependencies d WHERE d.job_id = j.id AND d.dependency_id = $1
            )
            ORDER BY j.queued_at, j.id
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&mut *conn)
        .await?;
        Ok(job.status(dependents.into_iter().map(JobId::from_uuid).collect()))
    }

    async fn info(&self, id: JobId) -> DbResult<JobInfo> {
        let mut conn = self.pool.acquire().await?;
        Ok(load_job(&mut conn, id).await?.info())
    }

    async fn lookup_token(&self, token: Token) -> DbResult<JobId> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE token = $1 AND started_at IS NOT NULL AND finished_at IS NULL AND NOT canceled
            "#,
        )
        .bind(token.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::NotExist)?;
        Ok(JobId::from_uuid(id))
    }

    async fn touch_heartbeat(&self, token: Token) -> DbResult<()> {
        let touched = sqlx::query("UPDATE heartbeats SET last_beat = NOW() WHERE token = $1")
            .bind(token.as_uuid())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if touched == 0 {
            warn!(token = %token, "Heartbeat for unknown token");
        }
        Ok(())
    }

    async fn stale_heartbeats(&self, older_than: Duration) -> DbResult<Vec<Token>> {
        let tokens: Vec<Uuid> = sqlx::query_scalar(
            "SELECT token FROM heartbeats WHERE last_beat < NOW() - make_interval(secs => $1)",
        )
        .bind(age_secs(older_than))
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens.into_iter().map(Token::from_uuid).collect())
    }

    async fn register_worker(&self, channel: &str, architecture: &str) -> DbResult<WorkerId> {
        let id = WorkerId::new();
        sqlx::query(
            "INSERT INTO workers (id, channel, architecture, last_seen) VALUES ($1, $2, $3, NOW())",
        )
        .bind(id.as_uuid())
        .bind(channel)
        .bind(architecture)
        .execute(&self.pool)
        .await?;
        debug!(worker_id = %id, channel, architecture, "Registered worker");
        Ok(id)
    }

    async fn touch_worker(&self, worker: WorkerId) -> DbResult<()> {
        let touched = sqlx::query("UPDATE workers SET last_seen = NOW() WHERE id = $1")
            .bind(worker.as_uuid())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if touched == 0 {
            return Err(QueueError::WorkerNotExist.into());
        }
        Ok(())
    }

    async fn stale_workers(&self, older_than: Duration) -> DbResult<Vec<WorkerInfo>> {
        let rows = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT id, channel, architecture, last_seen FROM workers
            WHERE last_seen < NOW() - make_interval(secs => $1)
            ORDER BY last_seen
            "#,
        )
        .bind(age_secs(older_than))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(WorkerInfo::from).collect())
    }

    async fn remove_worker(&self, worker: WorkerId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let busy: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM heartbeats WHERE worker_id = $1)")
                .bind(worker.as_uuid())
                .fetch_one(&mut *tx)
                .await?;
        if busy {
            return Err(QueueError::ActiveJobs.into());
        }

        let deleted = sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(worker.as_uuid())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(QueueError::WorkerNotExist.into());
        }
        tx.commit().await?;

        debug!(worker_id = %worker, "Deleted worker");
        Ok(())
    }

    async fn job_ids(&self, roots_only: bool) -> DbResult<Vec<JobId>> {
        let query = if roots_only {
            r#"
            SELECT j.id FROM jobs j
            WHERE NOT EXISTS (SELECT 1 FROM job_dependencies d WHERE d.dependency_id = j.id)
            ORDER BY j.queued_at, j.id
            "#
        } else {
            "SELECT id FROM jobs ORDER BY queued_at, id"
        };
        let ids: Vec<Uuid> = sqlx::query_scalar(query).fetch_all(&self.pool).await?;
        Ok(ids.into_iter().map(JobId::from_uuid).collect())
    }
}

impl Drop for PgJobQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        job_type: &str,
        args: Payload,
        dependencies: &[JobId],
        channel: &str,
    ) -> QueueResult<JobId> {
        Ok(self.insert_job(job_type, &args, dependencies, channel).await?)
    }

    async fn dequeue(
        &self,
        ctx: &CancellationToken,
        worker: Option<WorkerId>,
        job_types: &[&str],
        channels: &[&str],
    ) -> QueueResult<DequeuedJob> {
        let channels: &[&str] = if channels.is_empty() { &[""] } else { channels };
        let mut changes = self.changes.clone();

        loop {
            // Mark seen before querying so a notification racing the query
            // still wakes the next wait.
            changes.borrow_and_update();
            if let Some(job) = self.try_dequeue(worker, job_types, channels).await? {
                return Ok(job);
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(QueueError::DequeueTimeout),
                Ok(()) = changes.changed() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
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
        Ok(self.claim_by_id(id, worker).await?)
    }

    async fn requeue_or_finish(
        &self,
        id: JobId,
        max_retries: u64,
        result: Option<Payload>,
    ) -> QueueResult<bool> {
        let result = result.as_deref().map(RawValue::get);
        Ok(self.report(id, max_retries, result).await?)
    }

    async fn cancel_job(&self, id: JobId) -> QueueResult<()> {
        Ok(self.cancel(id).await?)
    }

    async fn job_status(&self, id: JobId) -> QueueResult<JobStatus> {
        Ok(self.status(id).await?)
    }

    async fn job(&self, id: JobId) -> QueueResult<JobInfo> {
        Ok(self.info(id).await?)
    }

    async fn id_from_token(&self, token: Token) -> QueueResult<JobId> {
        Ok(self.lookup_token(token).await?)
    }

    async fn refresh_heartbeat(&self, token: Token) -> QueueResult<()> {
        Ok(self.touch_heartbeat(token).await?)
    }

    async fn heartbeats(&self, older_than: Duration) -> QueueResult<Vec<Token>> {
        Ok(self.stale_heartbeats(older_than).await?)
    }

    async fn insert_worker(&self, channel: &str, architecture: &str) -> QueueResult<WorkerId> {
        Ok(self.register_worker(channel, architecture).await?)
    }

    async fn update_worker_status(&self, worker: WorkerId) -> QueueResult<()> {
        Ok(self.touch_worker(worker).await?)
    }

    async fn workers(&self, older_than: Duration) -> QueueResult<Vec<WorkerInfo>> {
        Ok(self.stale_workers(older_than).await?)
    }

    async fn delete_worker(&self, worker: WorkerId) -> QueueResult<()> {
        Ok(self.remove_worker(worker).await?)
    }

    async fn all_job_ids(&self) -> QueueResult<Vec<JobId>> {
        Ok(self.job_ids(false).await?)
    }

    async fn all_root_job_ids(&self) -> QueueResult<Vec<JobId>> {
        Ok(self.job_ids(true).await?)
    }
}
