//! PostgreSQL job queue for imagebuild.
//!
//! Jobs, dependency edges, heartbeats and workers live in four tables
//! (see `migrations/`). Any number of processes may share one database.

pub mod error;
mod listener;
pub mod queue;

pub use error::{DbError, DbResult};
pub use listener::CHANNEL;
pub use queue::PgJobQueue;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}
