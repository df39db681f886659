//! Version-ordered history of accepted edit batches.
//!
//! The log is the input to the transform resolver: a submission authored at
//! base version `V` is rebased over every entry after `V`. Retention keeps
//! memory bounded; once the log grows past `max_entries` it is cut back to
//! the newest `retain_entries`.

use std::collections::VecDeque;

use thiserror::Error;

use crate::protocol::ClientId;

/// Log retention limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Length that triggers a trim.
    pub max_entries: usize,
    /// Entries kept after a trim.
    pub retain_entries: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            retain_entries: 500,
        }
    }
}

/// One accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry<O> {
    /// Room version produced by this entry.
    pub version: u64,
    pub client_id: ClientId,
    pub ops: Vec<O>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogError {
    #[error("base version {base} predates retained history (oldest retained entry {oldest})")]
    HistoryTrimmed { base: u64, oldest: u64 },
}

#[derive(Debug, Clone)]
pub struct OperationLog<O> {
    entries: VecDeque<LogEntry<O>>,
    retention: Retention,
    /// Highest version discarded by retention (0 when nothing was trimmed).
    trimmed_through: u64,
}

impl<O> OperationLog<O> {
    pub fn new(retention: Retention) -> Self {
        Self {
            entries: VecDeque::new(),
            // A trim to zero entries would lose the ability to rebase anything.
            retention: Retention {
                max_entries: retention.max_entries.max(1),
                retain_entries: retention.retain_entries.clamp(1, retention.max_entries.max(1)),
            },
            trimmed_through: 0,
        }
    }

    /// Append an entry and apply retention. Versions must be strictly ascending.
    pub fn append(&mut self, entry: LogEntry<O>) {
        debug_assert!(
            self.entries.back().map_or(true, |last| last.version < entry.version),
            "log versions must ascend"
        );
        self.entries.push_back(entry);

        if self.entries.len() > self.retention.max_entries {
            let excess = self.entries.len() - self.retention.retain_entries;
            if let Some(last_dropped) = self.entries.drain(..excess).last() {
                self.trimmed_through = last_dropped.version;
            }
            log::debug!(
                "Trimmed {} log entries (history now starts after v{})",
                excess,
                self.trimmed_through
            );
        }
    }

    /// Entries authored after `base` by anyone other than `exclude`, ascending.
    ///
    /// Fails when entries after `base` were already discarded, since a rebase
    /// over partial history would diverge.
    pub fn concurrent_since<'a>(
        &'a self,
        base: u64,
        exclude: &'a str,
    ) -> Result<impl Iterator<Item = &'a LogEntry<O>> + 'a, LogError> {
        if base < self.trimmed_through {
            return Err(LogError::HistoryTrimmed {
                base,
                oldest: self.oldest_version().unwrap_or(self.trimmed_through + 1),
            });
        }
        let start = self.entries.partition_point(|e| e.version <= base);
        Ok(self
            .entries
            .range(start..)
            .filter(move |e| e.client_id != exclude))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn oldest_version(&self) -> Option<u64> {
        self.entries.front().map(|e| e.version)
    }

    pub fn latest_version(&self) -> Option<u64> {
        self.entries.back().map(|e| e.version)
    }

    pub fn trimmed_through(&self) -> u64 {
        self.trimmed_through
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry<O>> {
        self.entries.iter()
    }
}

impl<O> Default for OperationLog<O> {
    fn default() -> Self {
        Self::new(Retention::default())
    }
}
