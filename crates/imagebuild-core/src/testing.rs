//! Contract tests every [`JobQueue`] backing must pass.
//!
//! Each scenario takes a fresh, empty queue. Backings either call the
//! scenarios directly or generate one test per scenario with
//! [`contract_tests!`](crate::contract_tests).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::id::{JobId, Token, WorkerId};
use crate::job::{JobState, Payload, payload_from_str};
use crate::queue::{JobQueue, JobQueueExt};

/// Generate a `#[tokio::test]` per contract scenario.
///
/// `$make` is an async fn returning `(Arc<dyn JobQueue>, guard)`; the guard
/// lives until the scenario ends (e.g. a temporary directory).
///
/// With `optional`, `$make` returns an `Option` of that pair and every
/// scenario passes trivially on `None` (e.g. no test database configured).
#[macro_export]
macro_rules! contract_tests {
    (@each required $make:path; $($name:ident),* $(,)?) => {
        $(
            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn $name() {
                let (queue, _guard) = $make().await;
                $crate::testing::$name(queue).await;
            }
        )*
    };
    (@each optional $make:path; $($name:ident),* $(,)?) => {
        $(
            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn $name() {
                let Some((queue, _guard)) = $make().await else {
                    return;
                };
                $crate::testing::$name(queue).await;
            }
        )*
    };
    (@list $mode:ident $make:path) => {
        $crate::contract_tests!(@each $mode $make;
            test_basic_round_trip,
            test_args_round_trip,
            test_dependencies_gate_readiness,
            test_cancel_running_job,
            test_requeue_until_budget_spent,
            test_channels_filter,
            test_concurrent_dequeuers,
            test_worker_lifecycle,
            test_heartbeat_lifecycle,
            test_token_validity,
            test_cancel_semantics,
            test_dequeue_by_id,
            test_missing_dependency,
            test_job_listing,
            test_ready_order_is_fifo,
            test_dequeue_wakes_on_enqueue,
            test_unknown_job_errors,
            test_cancel_keeps_delivery_until_reported,
            test_concurrent_sibling_finishes,
        );
    };
    (optional $make:path) => {
        $crate::contract_tests!(@list optional $make);
    };
    ($make:path) => {
        $crate::contract_tests!(@list required $make);
    };
}

/// A cancellation token that fires after `after`.
pub fn deadline(after: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        child.cancel();
    });
    token
}

fn json(text: &str) -> Payload {
    payload_from_str(text).expect("valid json")
}

async fn finish(q: &dyn JobQueue, id: JobId) {
    let requeued = q
        .requeue_or_finish(id, 0, Some(json("{}")))
        .await
        .expect("finish");
    assert!(!requeued);
}

async fn expect_timeout(q: &dyn JobQueue, job_types: &[&str], channels: &[&str]) {
    let ctx = deadline(Duration::from_millis(100));
    let err = q
        .dequeue(&ctx, None, job_types, channels)
        .await
        .expect_err("no job should be ready");
    assert!(matches!(err, QueueError::DequeueTimeout), "got {err:?}");
}

pub async fn test_basic_round_trip(q: Arc<dyn JobQueue>) {
    let id = q.enqueue("octopus", json("null"), &[], "").await.unwrap();

    let info = q.job(id).await.unwrap();
    assert_eq!(info.job_type, "octopus");
    assert_eq!(info.args.get(), "null");
    assert!(info.dependencies.is_empty());
    assert_eq!(info.channel, "");

    let ctx = CancellationToken::new();
    let job = q.dequeue(&ctx, None, &["octopus"], &[""]).await.unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.job_type, "octopus");
    assert_eq!(job.args.get(), "null");
    assert_eq!(q.id_from_token(job.token).await.unwrap(), id);

    let status = q.job_status(id).await.unwrap();
    assert_eq!(status.state(), JobState::Running);

    finish(q.as_ref(), id).await;

    let status = q.job_status(id).await.unwrap();
    assert_eq!(status.state(), JobState::Finished);
    assert_eq!(status.result.as_ref().map(|r| r.get()), Some("{}"));
    let started = status.started_at.unwrap();
    let finished = status.finished_at.unwrap();
    assert!(status.queued_at <= started);
    assert!(started <= finished);
}

pub async fn test_args_round_trip(q: Arc<dyn JobQueue>) {
    let dep = q.enqueue("base", json("{}"), &[], "").await.unwrap();
    let cases = [
        ("octopus", r#"{"name":"squid","arms":[1,2,3]}"#, "kingfisher"),
        ("manifest", r#"[true, null, "x",   1.5e3]"#, ""),
        ("build", r#""just a string""#, "toucan"),
    ];
    for (job_type, args, channel) in cases {
        let id = q.enqueue(job_type, json(args), &[dep], channel).await.unwrap();
        let info = q.job(id).await.unwrap();
        assert_eq!(info.job_type, job_type);
        assert_eq!(info.args.get(), args);
        assert_eq!(info.dependencies, vec![dep]);
        assert_eq!(info.channel, channel);
    }

    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Args {
        distro: String,
        arch: String,
    }
    let args = Args {
        distro: "fedora-39".into(),
        arch: "x86_64".into(),
    };
    let id = q.enqueue_json("typed", &args, &[], "").await.unwrap();
    let ctx = CancellationToken::new();
    let job = q.dequeue_by_id(&ctx, id, None).await.unwrap();
    assert_eq!(job.args_as::<Args>().unwrap(), args);
}

pub async fn test_dependencies_gate_readiness(q: Arc<dyn JobQueue>) {
    let a = q.enqueue("test", json("{}"), &[], "").await.unwrap();
    let b = q.enqueue("test", json("{}"), &[], "").await.unwrap();
    let c = q.enqueue("test", json("{}"), &[a, b], "").await.unwrap();

    let ctx = CancellationToken::new();
    let first = q.dequeue(&ctx, None, &["test"], &[""]).await.unwrap();
    let second = q.dequeue(&ctx, None, &["test"], &[""]).await.unwrap();
    let got: HashSet<_> = [first.id, second.id].into_iter().collect();
    assert_eq!(got, [a, b].into_iter().collect());

    expect_timeout(q.as_ref(), &["test"], &[""]).await;

    finish(q.as_ref(), a).await;
    expect_timeout(q.as_ref(), &["test"], &[""]).await;

    finish(q.as_ref(), b).await;
    let third = q.dequeue(&ctx, None, &["test"], &[""]).await.unwrap();
    assert_eq!(third.id, c);
    assert_eq!(third.dependencies, vec![a, b]);

    let status = q.job_status(a).await.unwrap();
    assert_eq!(status.dependents, vec![c]);
    let status = q.job_status(c).await.unwrap();
    assert_eq!(status.dependencies, vec![a, b]);
    assert!(status.dependents.is_empty());
}

pub async fn test_cancel_running_job(q: Arc<dyn JobQueue>) {
    let id = q.enqueue("octopus", json("null"), &[], "").await.unwrap();
    let ctx = CancellationToken::new();
    let job = q.dequeue(&ctx, None, &["octopus"], &[""]).await.unwrap();
    assert_eq!(job.id, id);

    q.cancel_job(id).await.unwrap();
    assert_eq!(q.job_status(id).await.unwrap().state(), JobState::Canceled);
    assert!(matches!(
        q.id_from_token(job.token).await,
        Err(QueueError::NotExist)
    ));

    let err = q
        .requeue_or_finish(id, 0, Some(json("{}")))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Canceled), "got {err:?}");

    let status = q.job_status(id).await.unwrap();
    assert!(status.canceled);
    assert!(status.finished_at.is_none());
}

pub async fn test_requeue_until_budget_spent(q: Arc<dyn JobQueue>) {
    let id = q.enqueue("octopus", json("null"), &[], "").await.unwrap();
    let ctx = CancellationToken::new();

    let first = q.dequeue(&ctx, None, &["octopus"], &[""]).await.unwrap();
    assert_eq!(first.id, id);
    assert!(q.requeue_or_finish(id, 1, None).await.unwrap());
    assert_eq!(q.job_status(id).await.unwrap().state(), JobState::Pending);

    let second = q.dequeue(&ctx, None, &["octopus"], &[""]).await.unwrap();
    assert_eq!(second.id, id);
    assert_ne!(second.token, first.token);

    assert!(!q.requeue_or_finish(id, 1, Some(json("{}"))).await.unwrap());
    let err = q
        .requeue_or_finish(id, 1, Some(json("{}")))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NotRunning), "got {err:?}");
}

pub async fn test_channels_filter(q: Arc<dyn JobQueue>) {
    let toucan = q.enqueue("octopus", json("null"), &[], "toucan").await.unwrap();
    let kingfisher = q
        .enqueue("octopus", json("null"), &[], "kingfisher")
        .await
        .unwrap();

    expect_timeout(q.as_ref(), &["octopus"], &[""]).await;
    expect_timeout(q.as_ref(), &["octopus"], &[]).await;

    let ctx = CancellationToken::new();
    let first = q
        .dequeue(&ctx, None, &["octopus"], &["kingfisher", "toucan"])
        .await
        .unwrap();
    let second = q
        .dequeue(&ctx, None, &["octopus"], &["kingfisher", "toucan"])
        .await
        .unwrap();
    assert_eq!(first.id, toucan);
    assert_eq!(second.id, kingfisher);
}

pub async fn test_concurrent_dequeuers(q: Arc<dyn JobQueue>) {
    const N: usize = 100;
    let ctx = deadline(Duration::from_secs(30));

    let mut handles = Vec::with_capacity(N);
    for _ in 0..N {
        let q = Arc::clone(&q);
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            q.dequeue(&ctx, None, &["octopus"], &[""]).await
        }));
    }

    let mut enqueued = HashSet::new();
    for _ in 0..N {
        enqueued.insert(q.enqueue("octopus", json("null"), &[], "").await.unwrap());
    }

    let results = futures::future::join_all(handles).await;
    let mut dequeued = HashSet::new();
    for result in results {
        let job = result.expect("task").expect("dequeue");
        assert!(dequeued.insert(job.id), "job {} delivered twice", job.id);
    }
    assert_eq!(dequeued, enqueued);
}

pub async fn test_worker_lifecycle(q: Arc<dyn JobQueue>) {
    let worker = q.insert_worker("chan", "x86_64").await.unwrap();
    let id = q.enqueue("octopus", json("null"), &[], "chan").await.unwrap();

    let ctx = CancellationToken::new();
    let job = q
        .dequeue(&ctx, Some(worker), &["octopus"], &["chan"])
        .await
        .unwrap();
    assert_eq!(job.id, id);

    let err = q.delete_worker(worker).await.unwrap_err();
    assert!(matches!(err, QueueError::ActiveJobs), "got {err:?}");

    finish(q.as_ref(), id).await;
    q.delete_worker(worker).await.unwrap();

    let err = q.update_worker_status(worker).await.unwrap_err();
    assert!(matches!(err, QueueError::WorkerNotExist), "got {err:?}");

    let fresh = q.insert_worker("", "aarch64").await.unwrap();
    assert!(q.workers(Duration::from_secs(3600)).await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stale = q.workers(Duration::from_millis(10)).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, fresh);
    assert_eq!(stale[0].architecture, "aarch64");

    q.update_worker_status(fresh).await.unwrap();
    assert!(q.workers(Duration::from_secs(3600)).await.unwrap().is_empty());

    let err = q.update_worker_status(WorkerId::new()).await.unwrap_err();
    assert!(matches!(err, QueueError::WorkerNotExist), "got {err:?}");
}

pub async fn test_heartbeat_lifecycle(q: Arc<dyn JobQueue>) {
    let id = q.enqueue("octopus", json("null"), &[], "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(q.heartbeats(Duration::ZERO).await.unwrap().is_empty());

    let ctx = CancellationToken::new();
    let job = q.dequeue(&ctx, None, &["octopus"], &[""]).await.unwrap();
    assert!(q.heartbeats(Duration::from_secs(3600)).await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        q.heartbeats(Duration::from_millis(10)).await.unwrap(),
        vec![job.token]
    );

    q.refresh_heartbeat(job.token).await.unwrap();
    assert!(q.heartbeats(Duration::from_secs(3600)).await.unwrap().is_empty());

    // Unknown tokens are ignored.
    q.refresh_heartbeat(Token::new()).await.unwrap();

    finish(q.as_ref(), id).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(q.heartbeats(Duration::ZERO).await.unwrap().is_empty());
}

pub async fn test_token_validity(q: Arc<dyn JobQueue>) {
    let id = q.enqueue("octopus", json("null"), &[], "").await.unwrap();
    let ctx = CancellationToken::new();

    let first = q.dequeue(&ctx, None, &["octopus"], &[""]).await.unwrap();
    assert_eq!(q.id_from_token(first.token).await.unwrap(), id);
    assert!(q.requeue_or_finish(id, 5, None).await.unwrap());
    assert!(matches!(
        q.id_from_token(first.token).await,
        Err(QueueError::NotExist)
    ));

    let second = q.dequeue(&ctx, None, &["octopus"], &[""]).await.unwrap();
    assert_eq!(q.id_from_token(second.token).await.unwrap(), id);
    finish(q.as_ref(), id).await;
    assert!(matches!(
        q.id_from_token(second.token).await,
        Err(QueueError::NotExist)
    ));
    assert!(matches!(
        q.id_from_token(Token::new()).await,
        Err(QueueError::NotExist)
    ));
}

pub async fn test_cancel_semantics(q: Arc<dyn JobQueue>) {
    // Canceling a pending dependency releases its dependants.
    let dep = q.enqueue("parent", json("null"), &[], "").await.unwrap();
    let child = q.enqueue("child", json("null"), &[dep], "").await.unwrap();
    expect_timeout(q.as_ref(), &["child"], &[""]).await;

    q.cancel_job(dep).await.unwrap();
    q.cancel_job(dep).await.unwrap();
    expect_timeout(q.as_ref(), &["parent"], &[""]).await;

    let ctx = deadline(Duration::from_secs(5));
    let job = q.dequeue(&ctx, None, &["child"], &[""]).await.unwrap();
    assert_eq!(job.id, child);

    // Cancel after finish is a no-op reported as NotRunning.
    finish(q.as_ref(), child).await;
    let before = q.job_status(child).await.unwrap();
    let err = q.cancel_job(child).await.unwrap_err();
    assert!(matches!(err, QueueError::NotRunning), "got {err:?}");
    let after = q.job_status(child).await.unwrap();
    assert!(!after.canceled);
    assert_eq!(after.finished_at, before.finished_at);

    let err = q.cancel_job(JobId::new()).await.unwrap_err();
    assert!(matches!(err, QueueError::NotRunning), "got {err:?}");
}

pub async fn test_dequeue_by_id(q: Arc<dyn JobQueue>) {
    let worker = q.insert_worker("", "x86_64").await.unwrap();
    let dep = q.enqueue("octopus", json("null"), &[], "").await.unwrap();
    let blocked = q.enqueue("octopus", json("null"), &[dep], "").await.unwrap();
    let ctx = CancellationToken::new();

    let err = q.dequeue_by_id(&ctx, blocked, None).await.unwrap_err();
    assert!(matches!(err, QueueError::NotPending), "got {err:?}");

    let job = q.dequeue_by_id(&ctx, dep, Some(worker)).await.unwrap();
    assert_eq!(job.id, dep);
    assert_eq!(q.id_from_token(job.token).await.unwrap(), dep);
    assert!(matches!(
        q.delete_worker(worker).await,
        Err(QueueError::ActiveJobs)
    ));

    let err = q.dequeue_by_id(&ctx, dep, None).await.unwrap_err();
    assert!(matches!(err, QueueError::NotPending), "got {err:?}");

    finish(q.as_ref(), dep).await;
    let job = q.dequeue_by_id(&ctx, blocked, None).await.unwrap();
    assert_eq!(job.dependencies, vec![dep]);

    // A job taken by id is no longer available to dequeue.
    expect_timeout(q.as_ref(), &["octopus"], &[""]).await;

    q.cancel_job(blocked).await.unwrap();
    let canceled = q.enqueue("octopus", json("null"), &[], "").await.unwrap();
    q.cancel_job(canceled).await.unwrap();
    let err = q.dequeue_by_id(&ctx, canceled, None).await.unwrap_err();
    assert!(matches!(err, QueueError::NotPending), "got {err:?}");
}

pub async fn test_missing_dependency(q: Arc<dyn JobQueue>) {
    let existing = q.enqueue("octopus", json("null"), &[], "").await.unwrap();
    let err = q
        .enqueue("octopus", json("null"), &[existing, JobId::new()], "")
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NotExist), "got {err:?}");
    assert_eq!(q.all_job_ids().await.unwrap(), vec![existing]);
}

pub async fn test_job_listing(q: Arc<dyn JobQueue>) {
    assert!(q.all_job_ids().await.unwrap().is_empty());
    assert!(q.all_root_job_ids().await.unwrap().is_empty());

    let a = q.enqueue("a", json("null"), &[], "").await.unwrap();
    let b = q.enqueue("b", json("null"), &[a], "").await.unwrap();
    let c = q.enqueue("c", json("null"), &[a, b], "").await.unwrap();
    let d = q.enqueue("d", json("null"), &[], "").await.unwrap();

    let mut all = q.all_job_ids().await.unwrap();
    all.sort();
    let mut expected = vec![a, b, c, d];
    expected.sort();
    assert_eq!(all, expected);

    let mut roots = q.all_root_job_ids().await.unwrap();
    roots.sort();
    let mut expected = vec![c, d];
    expected.sort();
    assert_eq!(roots, expected);
}

pub async fn test_ready_order_is_fifo(q: Arc<dyn JobQueue>) {
    let gate = q.enqueue("gate", json("null"), &[], "").await.unwrap();
    let late = q.enqueue("build", json("null"), &[gate], "").await.unwrap();
    let early = q.enqueue("build", json("null"), &[], "").await.unwrap();

    let ctx = deadline(Duration::from_secs(5));
    let g = q.dequeue(&ctx, None, &["gate"], &[""]).await.unwrap();
    assert_eq!(g.id, gate);
    finish(q.as_ref(), gate).await;
    let after = q.enqueue("build", json("null"), &[], "").await.unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(q.dequeue(&ctx, None, &["build"], &[""]).await.unwrap().id);
    }
    assert_eq!(order, vec![early, late, after]);
}

pub async fn test_dequeue_wakes_on_enqueue(q: Arc<dyn JobQueue>) {
    let waiter = {
        let q = Arc::clone(&q);
        tokio::spawn(async move {
            let ctx = deadline(Duration::from_secs(10));
            q.dequeue(&ctx, None, &["octopus"], &["chan"]).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Jobs for other filters must not satisfy the waiter.
    q.enqueue("octopus", json("null"), &[], "other").await.unwrap();
    q.enqueue("squid", json("null"), &[], "chan").await.unwrap();
    let id = q.enqueue("octopus", json("null"), &[], "chan").await.unwrap();

    let job = waiter.await.expect("task").expect("dequeue");
    assert_eq!(job.id, id);
}

pub async fn test_unknown_job_errors(q: Arc<dyn JobQueue>) {
    let unknown = JobId::new();
    assert!(matches!(q.job(unknown).await, Err(QueueError::NotExist)));
    assert!(matches!(
        q.job_status(unknown).await,
        Err(QueueError::NotExist)
    ));
    assert!(matches!(
        q.requeue_or_finish(unknown, 0, None).await,
        Err(QueueError::NotExist)
    ));

    let ctx = CancellationToken::new();
    assert!(matches!(
        q.dequeue_by_id(&ctx, unknown, None).await,
        Err(QueueError::NotPending) | Err(QueueError::NotExist)
    ));

    let pending = q.enqueue("octopus", json("null"), &[], "").await.unwrap();
    assert!(matches!(
        q.requeue_or_finish(pending, 0, None).await,
        Err(QueueError::NotRunning)
    ));

    assert!(matches!(
        q.delete_worker(WorkerId::new()).await,
        Err(QueueError::WorkerNotExist)
    ));
}

pub async fn test_cancel_keeps_delivery_until_reported(q: Arc<dyn JobQueue>) {
    let worker = q.insert_worker("", "x86_64").await.unwrap();
    let id = q.enqueue("octopus", json("null"), &[], "").await.unwrap();
    let ctx = CancellationToken::new();
    let job = q
        .dequeue(&ctx, Some(worker), &["octopus"], &[""])
        .await
        .unwrap();

    q.cancel_job(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(q.heartbeats(Duration::ZERO).await.unwrap(), vec![job.token]);
    let err = q.delete_worker(worker).await.unwrap_err();
    assert!(matches!(err, QueueError::ActiveJobs), "got {err:?}");

    let err = q.requeue_or_finish(id, 0, None).await.unwrap_err();
    assert!(matches!(err, QueueError::Canceled), "got {err:?}");
    assert!(q.heartbeats(Duration::ZERO).await.unwrap().is_empty());
    q.delete_worker(worker).await.unwrap();
}

pub async fn test_concurrent_sibling_finishes(q: Arc<dyn JobQueue>) {
    const FAMILIES: usize = 25;

    let mut parents = Vec::new();
    let mut children = HashSet::new();
    for _ in 0..FAMILIES {
        let a = q.enqueue("parent", json("null"), &[], "").await.unwrap();
        let b = q.enqueue("parent", json("null"), &[], "").await.unwrap();
        children.insert(q.enqueue("child", json("null"), &[a, b], "").await.unwrap());
        parents.extend([a, b]);
    }

    let ctx = CancellationToken::new();
    for id in &parents {
        q.dequeue_by_id(&ctx, *id, None).await.unwrap();
    }
    let finishes = parents.iter().map(|id| {
        let q = q.clone();
        let id = *id;
        tokio::spawn(async move { finish(q.as_ref(), id).await })
    });
    for finished in futures::future::join_all(finishes).await {
        finished.unwrap();
    }

    // Every child was released before this one was enqueued.
    let late = q.enqueue("child", json("null"), &[], "").await.unwrap();
    let ctx = deadline(Duration::from_secs(5));
    let mut released = HashSet::new();
    for _ in 0..FAMILIES {
        let job = q.dequeue(&ctx, None, &["child"], &[""]).await.unwrap();
        released.insert(job.id);
    }
    assert_eq!(released, children);
    let job = q.dequeue(&ctx, None, &["child"], &[""]).await.unwrap();
    assert_eq!(job.id, late);
}
