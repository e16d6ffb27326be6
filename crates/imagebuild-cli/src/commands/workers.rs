//! Worker and heartbeat commands.

use std::time::Duration;

use anyhow::Result;
use imagebuild_core::{JobId, JobQueue, QueueError, Token};

pub async fn list(queue: &dyn JobQueue, older_than_secs: u64) -> Result<()> {
    let workers = queue.workers(Duration::from_secs(older_than_secs)).await?;
    if workers.is_empty() {
        println!("No workers");
        return Ok(());
    }

    println!("{:<38} {:<10} {:<16} LAST SEEN", "ID", "ARCH", "CHANNEL");
    for worker in workers {
        println!(
            "{:<38} {:<10} {:<16} {}",
            worker.id, worker.architecture, worker.channel, worker.last_seen
        );
    }
    Ok(())
}

pub async fn heartbeats(queue: &dyn JobQueue, older_than_secs: u64) -> Result<()> {
    let tokens = queue
        .heartbeats(Duration::from_secs(older_than_secs))
        .await?;
    for token in tokens {
        match token_owner(queue, token).await? {
            Some(id) => println!("{token} {id}"),
            None => println!("{token} -"),
        }
    }
    Ok(())
}

/// The job a delivery token belongs to, or `None` once it is settled.
async fn token_owner(queue: &dyn JobQueue, token: Token) -> Result<Option<JobId>> {
    match queue.id_from_token(token).await {
        Ok(id) => Ok(Some(id)),
        Err(QueueError::NotExist) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
