//! In-memory indexes derived from the job documents.
//!
//! - ready queues: `(type, channel)` -> job ids ordered by their ready sequence
//! - waiting: dependency -> dependants that were not ready when last checked
//! - dependents: dependency -> every job that lists it (never pruned)
//! - tokens: live delivery token -> job id
//!
//! Everything refers to jobs by id; the records themselves live in the
//! job map owned by the store.

use std::collections::{HashMap, HashSet, VecDeque};

use imagebuild_core::{JobId, JobRecord, Token};

type QueueKey = (String, String);

#[derive(Debug, Default)]
pub(crate) struct Index {
    ready: HashMap<QueueKey, VecDeque<(u64, JobId)>>,
    next_seq: u64,
    waiting: HashMap<JobId, Vec<JobId>>,
    dependents: HashMap<JobId, Vec<JobId>>,
    tokens: HashMap<Token, JobId>,
}

fn settled_in(jobs: &HashMap<JobId, JobRecord>, id: &JobId) -> bool {
    jobs.get(id).is_some_and(JobRecord::is_settled)
}

fn key(job: &JobRecord) -> QueueKey {
    (job.job_type.clone(), job.channel.clone())
}

impl Index {
    /// Index a job that is already present in `jobs`.
    ///
    /// Returns true when the job was put on a ready queue.
    pub fn track(&mut self, job: &JobRecord, jobs: &HashMap<JobId, JobRecord>) -> bool {
        let mut seen = HashSet::new();
        for dep in &job.dependencies {
            if seen.insert(*dep) {
                self.dependents.entry(*dep).or_default().push(job.id);
            }
        }

        if job.started_at.is_some() || job.canceled {
            return false;
        }
        if job.is_ready(|dep| settled_in(jobs, dep)) {
            self.push_ready(job);
            return true;
        }
        for dep in seen {
            if !settled_in(jobs, &dep) {
                self.waiting.entry(dep).or_default().push(job.id);
            }
        }
        false
    }

    /// Hand out the next ready sequence number.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Make sure later sequence numbers sort after `seq`.
    pub fn observe_seq(&mut self, seq: u64) {
        self.next_seq = self.next_seq.max(seq.saturating_add(1));
    }

    /// Put a job on its ready queue at the position of its `ready_seq`.
    /// A job without one goes to the tail.
    pub fn push_ready(&mut self, job: &JobRecord) {
        let seq = match job.ready_seq {
            Some(seq) => {
                self.observe_seq(seq);
                seq
            }
            None => self.next_seq(),
        };
        let queue = self.ready.entry(key(job)).or_default();
        let pos = queue.partition_point(|(queued, _)| *queued <= seq);
        queue.insert(pos, (seq, job.id));
    }

    /// Re-evaluate the dependants of a job that just finished or was
    /// canceled. Returns the ones that became ready; queueing them is up
    /// to the caller.
    pub fn settle(&mut self, id: JobId, jobs: &HashMap<JobId, JobRecord>) -> Vec<JobId> {
        let Some(mut waiting) = self.waiting.remove(&id) else {
            return Vec::new();
        };
        waiting.dedup();

        let mut ready = Vec::new();
        for dependant in waiting {
            let Some(job) = jobs.get(&dependant) else {
                continue;
            };
            if job.is_ready(|dep| settled_in(jobs, dep))
                && !self.is_queued(job)
                && !ready.contains(&dependant)
            {
                ready.push(dependant);
            }
        }
        ready
    }

    fn is_queued(&self, job: &JobRecord) -> bool {
        self.ready
            .get(&key(job))
            .is_some_and(|queue| queue.iter().any(|(_, id)| *id == job.id))
    }

    /// The oldest ready job matching any `(type, channel)` combination.
    ///
    /// An empty channel list matches only the empty channel.
    pub fn peek_matching(&self, job_types: &[&str], channels: &[&str]) -> Option<JobId> {
        let channels: &[&str] = if channels.is_empty() { &[""] } else { channels };

        let mut best: Option<(u64, JobId)> = None;
        for job_type in job_types {
            for channel in channels {
                let head = self
                    .ready
                    .get(&(job_type.to_string(), channel.to_string()))
                    .and_then(|queue| queue.front());
                if let Some(&(seq, id)) = head {
                    if best.is_none_or(|(best_seq, _)| seq < best_seq) {
                        best = Some((seq, id));
                    }
                }
            }
        }
        best.map(|(_, id)| id)
    }

    /// Drop a job from its ready queue. Empty queues are removed.
    pub fn remove_ready(&mut self, job: &JobRecord) -> bool {
        let key = key(job);
        let Some(queue) = self.ready.get_mut(&key) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|(_, id)| *id == job.id) else {
            return false;
        };
        queue.remove(pos);
        if queue.is_empty() {
            self.ready.remove(&key);
        }
        true
    }

    pub fn dependents(&self, id: JobId) -> Vec<JobId> {
        self.dependents.get(&id).cloned().unwrap_or_default()
    }

    pub fn has_dependents(&self, id: JobId) -> bool {
        self.dependents.get(&id).is_some_and(|deps| !deps.is_empty())
    }

    pub fn bind_token(&mut self, token: Token, id: JobId) {
        self.tokens.insert(token, id);
    }

    pub fn unbind_token(&mut self, token: Token) -> Option<JobId> {
        self.tokens.remove(&token)
    }

    pub fn job_for_token(&self, token: Token) -> Option<JobId> {
        self.tokens.get(&token).copied()
    }
}
