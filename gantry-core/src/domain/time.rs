//! Job timestamps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single timestamp entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeStamp {
    pub key: String,
    pub at: DateTime<Utc>,
}

/// Append-only log of state entry times
///
/// Local states are recorded under their status name, remote state times
/// reported by the middleware under `backend_<state>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTime {
    entries: Vec<TimeStamp>,
}

impl JobTime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `key` at the current wall-clock time
    pub fn record(&mut self, key: impl Into<String>) {
        self.record_at(key, Utc::now());
    }

    pub fn record_at(&mut self, key: impl Into<String>, at: DateTime<Utc>) {
        self.entries.push(TimeStamp {
            key: key.into(),
            at,
        });
    }

    /// Records the first time the remote system saw the job in `state`
    ///
    /// Only the first report is kept.
    pub fn record_backend(&mut self, state: &str, at: DateTime<Utc>) {
        let key = format!("backend_{}", state);
        if self.get(&key).is_none() {
            self.record_at(key, at);
        }
    }

    /// Latest time recorded for `key`
    pub fn get(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.key == key)
            .map(|entry| entry.at)
    }

    /// Number of times `key` was recorded
    pub fn count(&self, key: &str) -> usize {
        self.entries.iter().filter(|entry| entry.key == key).count()
    }

    pub fn entries(&self) -> &[TimeStamp] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }
}
