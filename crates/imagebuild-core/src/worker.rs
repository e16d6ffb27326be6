//! Worker registry records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::WorkerId;

/// A registered worker and the last time it reported in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub channel: String,
    pub architecture: String,
    pub last_seen: DateTime<Utc>,
}
