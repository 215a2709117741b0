//! Placement epoch tracking
//!
//! Every rebalance of the volume placement table publishes a new epoch.
//! Requests pin the epoch they were issued under so the client can tell
//! when the last request of a superseded epoch has finished.

use parking_lot::Mutex;
use quorumio_common::{Epoch, Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Source of the placement epoch new transactions start under
pub trait EpochSource: Send + Sync {
    fn current_epoch(&self) -> Epoch;
}

#[derive(Debug)]
struct TrackerState {
    current: Epoch,
    /// Live pins per epoch; epochs without pins are absent
    pins: BTreeMap<Epoch, usize>,
}

/// Current placement epoch plus reference counts of epochs in use
#[derive(Debug)]
pub struct EpochTracker {
    state: Mutex<TrackerState>,
}

impl EpochTracker {
    #[must_use]
    pub fn new(epoch: Epoch) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TrackerState {
                current: epoch,
                pins: BTreeMap::new(),
            }),
        })
    }

    /// Epoch new requests are issued under
    #[must_use]
    pub fn current(&self) -> Epoch {
        self.state.lock().current
    }

    /// Install a newer placement epoch
    pub fn advance(&self, epoch: Epoch) -> Result<()> {
        let mut state = self.state.lock();
        if epoch <= state.current {
            return Err(Error::invalid_argument(format!(
                "epoch {} does not follow {}",
                epoch, state.current
            )));
        }
        info!(
            "Placement epoch {} -> {} ({} epochs still pinned)",
            state.current,
            epoch,
            state.pins.len()
        );
        state.current = epoch;
        Ok(())
    }

    /// Pin the current epoch until the returned guard is dropped
    #[must_use]
    pub fn pin_current(self: &Arc<Self>) -> EpochPin {
        let mut state = self.state.lock();
        let epoch = state.current;
        *state.pins.entry(epoch).or_insert(0) += 1;
        EpochPin {
            tracker: Arc::clone(self),
            epoch,
        }
    }

    /// Number of live pins on `epoch`
    #[must_use]
    pub fn in_use(&self, epoch: Epoch) -> usize {
        self.state.lock().pins.get(&epoch).copied().unwrap_or(0)
    }

    /// Oldest epoch that still has live pins
    #[must_use]
    pub fn oldest_in_use(&self) -> Option<Epoch> {
        self.state.lock().pins.keys().next().copied()
    }

    fn unpin(&self, epoch: Epoch) {
        let mut state = self.state.lock();
        if let Some(count) = state.pins.get_mut(&epoch) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(&epoch);
                if epoch < state.current {
                    debug!("Placement epoch {} drained", epoch);
                }
            }
        }
    }
}

impl EpochSource for EpochTracker {
    fn current_epoch(&self) -> Epoch {
        self.current()
    }
}

/// Reference on a placement epoch, released on drop
#[derive(Debug)]
pub struct EpochPin {
    tracker: Arc<EpochTracker>,
    epoch: Epoch,
}

impl EpochPin {
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }
}

impl Drop for EpochPin {
    fn drop(&mut self) {
        self.tracker.unpin(self.epoch);
    }
}
