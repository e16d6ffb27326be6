//! Job supervision and execution for imagebuild.
//!
//! - [`Supervisor`] reclaims deliveries whose worker stopped heartbeating
//!   and prunes workers that went quiet.
//! - [`Worker`] pulls jobs through any [`JobQueue`](imagebuild_core::JobQueue)
//!   and runs them with a [`JobHandler`].

pub mod supervisor;
pub mod worker;

pub use supervisor::{Supervisor, SupervisorPass};
pub use worker::{JobHandler, Worker, WorkerOptions};

use imagebuild_core::{Payload, QueueResult, payload_from};
use serde_json::json;

/// The result recorded for a job that failed with `reason`.
pub fn error_result(reason: &str) -> QueueResult<Payload> {
    payload_from(&json!({ "error": { "reason": reason } }))
}
