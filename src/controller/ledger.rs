//! In-memory replication ledger keyed by destination image.
//!
//! The ledger is the only state shared between replication workers that
//! needs mutual exclusion: the claim check and the attempt counter are read
//! and written under one lock so two workers never build the same
//! destination concurrently.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Entry {
    /// `namespace/name` of the ImageReplication currently building.
    holder: Option<String>,
    attempts: u32,
}

/// Outcome of [`ReplicationLedger::claim`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Claim {
    Acquired,
    Busy { holder: String },
}

#[derive(Debug, Default)]
pub struct ReplicationLedger {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ReplicationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut guard = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Claim `destination` for `holder`. Re-claiming by the same holder succeeds.
    pub fn claim(&self, destination: &str, holder: &str) -> Claim {
        self.with_entries(|entries| {
            let entry = entries.entry(destination.to_string()).or_default();
            match entry.holder {
                Some(ref current) if current != holder => Claim::Busy {
                    holder: current.clone(),
                },
                _ => {
                    entry.holder = Some(holder.to_string());
                    Claim::Acquired
                }
            }
        })
    }

    /// Release `destination` if `holder` owns it.
    pub fn release(&self, destination: &str, holder: &str) {
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(destination)
                && entry.holder.as_deref() == Some(holder)
            {
                entry.holder = None;
            }
        });
    }

    /// Count a failed build. `observed` is the attempt count persisted on the
    /// object, which wins over the ledger after a restart. Returns the new count.
    pub fn record_failure(&self, destination: &str, observed: u32) -> u32 {
        self.with_entries(|entries| {
            let entry = entries.entry(destination.to_string()).or_default();
            entry.attempts = entry.attempts.max(observed) + 1;
            entry.attempts
        })
    }

    pub fn attempts(&self, destination: &str) -> u32 {
        self.with_entries(|entries| entries.get(destination).map_or(0, |e| e.attempts))
    }
}
