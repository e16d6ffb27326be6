//! Job records and the views handed out to callers.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::clock;
use crate::error::QueueResult;
use crate::id::{JobId, Token};

/// Opaque JSON payload. The queue stores and returns it verbatim.
pub type Payload = Box<RawValue>;

/// Lifecycle state derived from a job's timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Not yet started. May still be waiting on dependencies.
    Pending,
    /// Handed to a worker; a delivery token is live.
    Running,
    /// Finished with a result.
    Finished,
    /// Canceled before finishing.
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Canceled)
    }
}

/// The authoritative representation of a job.
///
/// The embedded store writes this document to disk as-is; the relational
/// store keeps the same fields as columns of `jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub args: Payload,
    #[serde(default)]
    pub dependencies: Vec<JobId>,
    #[serde(default)]
    pub channel: String,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retries: u64,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
    /// Position in the ready order, assigned each time the job becomes
    /// ready. Lower values are handed out first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_seq: Option<u64>,
}

impl JobRecord {
    pub fn new(
        job_type: impl Into<String>,
        args: Payload,
        dependencies: Vec<JobId>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            args,
            dependencies,
            channel: channel.into(),
            queued_at: clock::now(),
            started_at: None,
            finished_at: None,
            retries: 0,
            canceled: false,
            result: None,
            token: None,
            ready_seq: None,
        }
    }

    pub fn state(&self) -> JobState {
        state_of(self.started_at, self.finished_at, self.canceled)
    }

    /// Whether dependants may treat this job as done. Cancellation counts.
    pub fn is_settled(&self) -> bool {
        self.finished_at.is_some() || self.canceled
    }

    /// Currently delivered to a worker (canceled-while-running included).
    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.finished_at.is_none()
    }

    /// Ready iff not started, not canceled, and every dependency settled.
    pub fn is_ready<F>(&self, dependency_settled: F) -> bool
    where
        F: Fn(&JobId) -> bool,
    {
        self.started_at.is_none()
            && !self.canceled
            && self.dependencies.iter().all(dependency_settled)
    }

    /// Hand the job to a worker under `token`.
    pub fn start(&mut self, token: Token) {
        self.started_at = Some(clock::now().max(self.queued_at));
        self.token = Some(token);
    }

    /// Return a running job to the pending state, consuming one retry.
    pub fn requeue(&mut self) {
        self.started_at = None;
        self.token = None;
        self.ready_seq = None;
        self.retries += 1;
    }

    /// Terminally finish a running job.
    pub fn finish(&mut self, result: Option<Payload>) {
        let now = clock::now();
        self.finished_at = Some(self.started_at.map_or(now, |started| now.max(started)));
        self.result = result;
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            job_type: self.job_type.clone(),
            args: self.args.clone(),
            dependencies: self.dependencies.clone(),
            channel: self.channel.clone(),
        }
    }

    pub fn status(&self, dependents: Vec<JobId>) -> JobStatus {
        JobStatus {
            job_type: self.job_type.clone(),
            channel: self.channel.clone(),
            result: self.result.clone(),
            queued_at: self.queued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            canceled: self.canceled,
            dependencies: self.dependencies.clone(),
            dependents,
        }
    }

    pub fn delivery(&self, token: Token) -> DequeuedJob {
        DequeuedJob {
            id: self.id,
            token,
            dependencies: self.dependencies.clone(),
            job_type: self.job_type.clone(),
            args: self.args.clone(),
        }
    }
}

/// What a caller submitted for a job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job_type: String,
    pub args: Payload,
    pub dependencies: Vec<JobId>,
    pub channel: String,
}

/// A job handed to a worker by dequeue.
#[derive(Debug, Clone)]
pub struct DequeuedJob {
    pub id: JobId,
    pub token: Token,
    pub dependencies: Vec<JobId>,
    pub job_type: String,
    pub args: Payload,
}

impl DequeuedJob {
    /// Decode the arguments into a caller type.
    pub fn args_as<T: DeserializeOwned>(&self) -> QueueResult<T> {
        Ok(serde_json::from_str(self.args.get())?)
    }
}

/// Status snapshot of a job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub job_type: String,
    pub channel: String,
    pub result: Option<Payload>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub canceled: bool,
    pub dependencies: Vec<JobId>,
    /// Jobs that list this one as a dependency.
    pub dependents: Vec<JobId>,
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        state_of(self.started_at, self.finished_at, self.canceled)
    }

    /// Decode the result, if any.
    pub fn result_as<T: DeserializeOwned>(&self) -> QueueResult<Option<T>> {
        match &self.result {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }
}

fn state_of(
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    canceled: bool,
) -> JobState {
    if canceled {
        JobState::Canceled
    } else if finished_at.is_some() {
        JobState::Finished
    } else if started_at.is_some() {
        JobState::Running
    } else {
        JobState::Pending
    }
}

/// Wrap JSON text as a payload, rejecting anything that is not JSON.
///
/// Surrounding whitespace is dropped; everything else is kept verbatim.
pub fn payload_from_str(json: &str) -> QueueResult<Payload> {
    Ok(RawValue::from_string(json.to_owned())?)
}

/// Serialize a caller value into a payload.
pub fn payload_from<T: Serialize + ?Sized>(value: &T) -> QueueResult<Payload> {
    Ok(serde_json::value::to_raw_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(deps: Vec<JobId>) -> JobRecord {
        JobRecord::new("octopus", payload_from_str("null").unwrap(), deps, "")
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = record(vec![]);
        assert_eq!(job.state(), JobState::Pending);
        assert!(job.is_ready(|_| true));
        assert!(!job.is_settled());
    }

    #[test]
    fn test_unsettled_dependency_blocks_readiness() {
        let dep = JobId::new();
        let job = record(vec![dep]);
        assert!(!job.is_ready(|_| false));
        assert!(job.is_ready(|id| *id == dep));
    }

    #[test]
    fn test_lifecycle_timestamps_are_ordered() {
        let mut job = record(vec![]);
        let token = Token::new();
        job.start(token);
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(job.token, Some(token));
        assert!(job.started_at.unwrap() >= job.queued_at);

        job.finish(Some(payload_from_str("{}").unwrap()));
        assert_eq!(job.state(), JobState::Finished);
        assert!(job.finished_at.unwrap() >= job.started_at.unwrap());
        assert!(job.is_settled());
    }

    #[test]
    fn test_requeue_clears_delivery() {
        let mut job = record(vec![]);
        job.start(Token::new());
        job.requeue();
        assert_eq!(job.retries, 1);
        assert!(job.token.is_none());
        assert!(job.started_at.is_none());
        assert!(job.is_ready(|_| true));
    }

    #[test]
    fn test_canceled_job_settles_but_is_not_ready() {
        let mut job = record(vec![]);
        job.canceled = true;
        assert!(job.is_settled());
        assert!(!job.is_ready(|_| true));
        assert_eq!(job.state(), JobState::Canceled);
    }

    #[test]
    fn test_document_keeps_payload_bytes() {
        let args = payload_from_str(r#"{"b": 1,  "a":[2, 3]}"#).unwrap();
        let job = JobRecord::new("t", args, vec![], "chan");
        let doc = serde_json::to_vec(&job).unwrap();
        let back: JobRecord = serde_json::from_slice(&doc).unwrap();
        assert_eq!(back.args.get(), r#"{"b": 1,  "a":[2, 3]}"#);
        assert_eq!(back.channel, "chan");
        assert_eq!(back.queued_at, job.queued_at);
    }

    #[test]
    fn test_invalid_payload_is_rejected() {
        assert!(payload_from_str("{not json").is_err());
        assert!(payload_from_str("").is_err());
    }
}
