//! Core types and the queue contract for imagebuild.
//!
//! This crate contains:
//! - Identifiers for jobs, delivery tokens and workers
//! - The job record and the views returned to callers
//! - The error taxonomy
//! - The `JobQueue` trait implemented by every backing
//! - A backing-independent contract test-suite (`testing` feature)

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod queue;
#[cfg(feature = "testing")]
pub mod testing;
pub mod worker;

pub use error::{QueueError, QueueResult};
pub use id::{JobId, Token, WorkerId};
pub use job::{
    DequeuedJob, JobInfo, JobRecord, JobState, JobStatus, Payload, payload_from, payload_from_str,
};
pub use queue::{JobQueue, JobQueueExt};
pub use worker::WorkerInfo;
