//! Bounded in-memory log of recent writes
//!
//! The coordinator appends every write it dispatches, keyed by op id. A
//! replica that falls behind can be caught up by replaying the entries after
//! its last applied op id, as long as those entries are still retained.
//! Once the log is full the oldest entry is dropped for each new one.

use crate::protocol::VolumeIoHdr;
use bytes::Bytes;
use quorumio_common::{Error, MsgType, Result};
use std::collections::VecDeque;
use tracing::trace;

/// One retained write
#[derive(Debug, Clone)]
pub struct WriteLogEntry {
    /// Op id assigned to the write
    pub op_id: i64,
    /// Header the write was dispatched with
    pub hdr: VolumeIoHdr,
    /// Message kind
    pub msg_type: MsgType,
    /// Request payload
    pub payload: Bytes,
}

/// Ring of the most recent writes, contiguous in op id
#[derive(Debug)]
pub struct ReplicatedWriteLog {
    capacity: usize,
    last_op_id: i64,
    entries: VecDeque<WriteLogEntry>,
}

impl ReplicatedWriteLog {
    /// Create an empty log whose next entry must be `last_op_id + 1`
    #[must_use]
    pub fn new(capacity: usize, last_op_id: i64) -> Self {
        Self {
            capacity: capacity.max(1),
            last_op_id,
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Append a write, evicting the oldest entry when full
    pub fn append(&mut self, entry: WriteLogEntry) -> Result<()> {
        if entry.op_id != self.last_op_id + 1 {
            return Err(Error::OutOfOrder {
                expected: self.last_op_id + 1,
                actual: entry.op_id,
            });
        }
        if self.entries.len() == self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                trace!("Write log evicted op {}", evicted.op_id);
            }
        }
        self.last_op_id = entry.op_id;
        self.entries.push_back(entry);
        Ok(())
    }

    /// Oldest op id still retained (`last_op_id + 1` when empty)
    #[must_use]
    pub fn oldest_op_id(&self) -> i64 {
        self.entries
            .front()
            .map_or(self.last_op_id + 1, |entry| entry.op_id)
    }

    /// Op id of the most recent write
    #[must_use]
    pub const fn last_op_id(&self) -> i64 {
        self.last_op_id
    }

    /// Whether a replay starting at `from_op_id` can be served
    ///
    /// Starting right after the newest entry is valid and replays nothing.
    #[must_use]
    pub fn covers(&self, from_op_id: i64) -> bool {
        from_op_id >= self.oldest_op_id() && from_op_id <= self.last_op_id + 1
    }

    /// Entries with op id `>= from_op_id`, in ascending order
    pub fn entries_from(&self, from_op_id: i64) -> Result<impl Iterator<Item = &WriteLogEntry>> {
        if !self.covers(from_op_id) {
            return Err(Error::ResyncRequired {
                requested: from_op_id,
                oldest: self.oldest_op_id(),
                latest: self.last_op_id,
            });
        }
        let skip = usize::try_from(from_op_id - self.oldest_op_id()).unwrap_or(0);
        Ok(self.entries.iter().skip(skip))
    }

    /// Drop every entry and restart numbering after `last_op_id`
    pub fn reset(&mut self, last_op_id: i64) {
        self.entries.clear();
        self.last_op_id = last_op_id;
    }

    /// Number of retained entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of retained entries
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
