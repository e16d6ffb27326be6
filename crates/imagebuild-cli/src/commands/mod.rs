//! CLI command implementations.

pub mod jobs;
pub mod workers;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use imagebuild_config::{Backing, Config, SupervisorConfig};
use imagebuild_core::JobQueue;
use imagebuild_db::{PgJobQueue, create_pool, run_migrations};
use imagebuild_fsqueue::FsJobQueue;
use imagebuild_scheduler::Supervisor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Load the configuration file, or configure from the environment alone.
pub fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => imagebuild_config::load_config(path)
            .with_context(|| format!("loading {}", path.display())),
        None => imagebuild_config::parse_config("", |name| std::env::var(name).ok())
            .context("no configuration file given and the environment selects no queue"),
    }
}

/// Refuse `command` on an embedded store. Its workers and heartbeats live
/// only in the process that has the directory open, so this process would
/// see an empty, freshly recovered copy.
pub fn require_shared(backing: &Backing, command: &str) -> Result<()> {
    match backing {
        Backing::Embedded { storage_root, .. } => bail!(
            "`{command}` needs the relational backing; workers and heartbeats of the \
             embedded store at {} are only known to the process that owns it",
            storage_root.display()
        ),
        Backing::Relational { .. } => Ok(()),
    }
}

/// Open the configured backing.
pub async fn open_queue(config: &Config) -> Result<Arc<dyn JobQueue>> {
    match &config.queue {
        Backing::Embedded {
            storage_root,
            file_mode,
        } => {
            let queue = FsJobQueue::open(storage_root.clone(), *file_mode)
                .with_context(|| format!("opening {}", storage_root.display()))?;
            Ok(Arc::new(queue))
        }
        Backing::Relational { database_url } => {
            info!("Connecting to database...");
            let pool = create_pool(database_url).await?;
            run_migrations(&pool).await?;
            info!("Database connected");
            Ok(Arc::new(PgJobQueue::new(pool)))
        }
    }
}

/// Run the supervisor until Ctrl-C.
pub async fn supervise(queue: Arc<dyn JobQueue>, config: SupervisorConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted, shutting down");
                    shutdown.cancel();
                }
                Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
            }
        });
    }

    Supervisor::new(queue, config).run(shutdown).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_live_state_commands_need_relational_backing() {
        let embedded = Backing::Embedded {
            storage_root: PathBuf::from("/var/lib/imagebuild/jobs"),
            file_mode: 0o600,
        };
        let err = require_shared(&embedded, "supervise").unwrap_err();
        assert!(err.to_string().contains("`supervise`"), "got {err}");

        let relational = Backing::Relational {
            database_url: "postgres://localhost/imagebuild".into(),
        };
        require_shared(&relational, "heartbeats").unwrap();
    }
}
