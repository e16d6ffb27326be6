//! Wakeups for blocked dequeuers.

use std::collections::HashMap;

use tokio::sync::mpsc;

struct Waiter {
    job_types: Vec<String>,
    channels: Vec<String>,
    wake: mpsc::Sender<()>,
}

impl Waiter {
    fn matches(&self, job_type: &str, channel: &str) -> bool {
        self.job_types.iter().any(|t| t == job_type) && self.channels.iter().any(|c| c == channel)
    }
}

/// Registered dequeuers, each with a capacity-1 wakeup channel.
///
/// A full channel already holds a pending wakeup, so sends never block and
/// repeated notifications coalesce.
#[derive(Default)]
pub(crate) struct Waiters {
    next_id: u64,
    entries: HashMap<u64, Waiter>,
}

impl Waiters {
    pub fn register(&mut self, job_types: &[&str], channels: &[&str]) -> (u64, mpsc::Receiver<()>) {
        let channels: &[&str] = if channels.is_empty() { &[""] } else { channels };
        let (wake, rx) = mpsc::channel(1);
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Waiter {
                job_types: job_types.iter().map(|t| t.to_string()).collect(),
                channels: channels.iter().map(|c| c.to_string()).collect(),
                wake,
            },
        );
        (id, rx)
    }

    pub fn remove(&mut self, id: u64) {
        self.entries.remove(&id);
    }

    /// Wake every waiter whose filter matches a newly ready job.
    pub fn notify(&self, job_type: &str, channel: &str) {
        for waiter in self.entries.values() {
            if waiter.matches(job_type, channel) {
                // Full means a wakeup is already pending.
                let _ = waiter.wake.try_send(());
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifies_only_matching_waiters() {
        let mut waiters = Waiters::default();
        let (_, mut octopus) = waiters.register(&["octopus"], &["chan"]);
        let (_, mut squid) = waiters.register(&["squid"], &[]);

        waiters.notify("octopus", "chan");
        waiters.notify("octopus", "chan");
        assert!(octopus.try_recv().is_ok());
        assert!(octopus.try_recv().is_err());
        assert!(squid.try_recv().is_err());

        waiters.notify("squid", "");
        assert!(squid.try_recv().is_ok());
    }

    #[test]
    fn test_removed_waiters_are_forgotten() {
        let mut waiters = Waiters::default();
        let (id, _rx) = waiters.register(&["t"], &[""]);
        assert_eq!(waiters.len(), 1);
        waiters.remove(id);
        assert_eq!(waiters.len(), 0);
    }
}
