//! Wakeups for blocked dequeuers via PostgreSQL LISTEN/NOTIFY.
//!
//! Every transaction that makes a job ready issues `pg_notify` on
//! [`CHANNEL`]. A single background task per queue listens and bumps a
//! counter that dequeuers watch, so waiting dequeuers hold no connection.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Notification channel used for "a job became ready".
pub const CHANNEL: &str = "imagebuild_jobs";

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Spawn the listener task. It runs until `shutdown` is canceled.
pub(crate) fn spawn(pool: PgPool, shutdown: CancellationToken) -> watch::Receiver<u64> {
    let (tx, rx) = watch::channel(0u64);
    tokio::spawn(run(pool, tx, shutdown));
    rx
}

fn bump(changes: &watch::Sender<u64>) {
    changes.send_modify(|n| *n = n.wrapping_add(1));
}

async fn run(pool: PgPool, changes: watch::Sender<u64>, shutdown: CancellationToken) {
    loop {
        match listen(&pool, &changes, &shutdown).await {
            Ok(()) => {
                debug!("Job listener stopped");
                return;
            }
            Err(e) => warn!(error = %e, "Job listener failed, reconnecting"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// Listen until shutdown (`Ok`) or a connection error (`Err`).
async fn listen(
    pool: &PgPool,
    changes: &watch::Sender<u64>,
    shutdown: &CancellationToken,
) -> Result<(), sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(CHANNEL).await?;
    info!(channel = CHANNEL, "Listening for ready jobs");

    // Anything published while we were not listening is unknown.
    bump(changes);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            message = listener.try_recv() => match message? {
                Some(_) => bump(changes),
                None => {
                    // Connection dropped; try_recv reconnects on the next call.
                    debug!("Job listener connection lost");
                    bump(changes);
                }
            }
        }
    }
}
