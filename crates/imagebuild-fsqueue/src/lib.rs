//! Embedded job queue for imagebuild.
//!
//! Jobs are stored as one JSON document each under a single directory and
//! indexed in memory. Heartbeats and workers are not persisted; deliveries
//! that were running when the process stopped keep their token and get a
//! fresh heartbeat on the next start, so the supervisor can reclaim them.
//! A directory is held by one open store at a time.

pub mod documents;

mod dispatch;
mod index;
mod lock;
mod queue;

pub use documents::DocumentStore;
pub use queue::FsJobQueue;
