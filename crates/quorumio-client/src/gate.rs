//! Epoch barrier for blob transactions
//!
//! Transactions on a blob must not straddle a placement epoch change. The
//! gate keeps one barrier entry per (volume, blob) recording the epoch the
//! running transactions started under and how many are still open. A
//! transaction arriving under a different epoch waits in FIFO order until
//! every transaction of the old epoch has ended; it is then admitted under
//! whatever epoch is current at release time.
//!
//! An admission that nobody consumes still ends its transaction: a
//! [`DelayedTx`] dropped after it was released, and a dropped [`TxGuard`],
//! both hand the slot back.

use crate::epoch::EpochSource;
use parking_lot::Mutex;
use quorumio_common::{Epoch, Error, Result, VolumeId};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, info};

type BarrierKey = (VolumeId, String);
type Waiter = oneshot::Sender<Result<TxAdmission>>;

/// Grant to run a transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxAdmission {
    /// Epoch the transaction runs under
    pub epoch: Epoch,
    /// Gate-wide admission counter; increases in admission order
    pub admission_id: u64,
}

/// Outcome of [`EpochGate::begin_transaction`]
#[derive(Debug)]
pub enum Admission {
    Admitted(TxAdmission),
    /// Queued behind transactions of an older epoch
    Delayed(DelayedTx),
}

impl Admission {
    /// Wait until the transaction may run
    pub async fn admitted(self) -> Result<TxAdmission> {
        match self {
            Self::Admitted(admission) => Ok(admission),
            Self::Delayed(delayed) => delayed.await,
        }
    }

    #[must_use]
    pub const fn is_delayed(&self) -> bool {
        matches!(self, Self::Delayed(_))
    }
}

/// A queued transaction start
///
/// Resolves once the older epoch drained, or with
/// [`Error::VolumeAccessDenied`] if the volume is removed first.
#[derive(Debug)]
pub struct DelayedTx {
    rx: oneshot::Receiver<Result<TxAdmission>>,
    gate: Weak<GateShared>,
    key: BarrierKey,
}

impl Future for DelayedTx {
    type Output = Result<TxAdmission>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::VolumeAccessDenied)))
    }
}

impl Drop for DelayedTx {
    fn drop(&mut self) {
        self.rx.close();
        // Released while nobody was polling any more
        if let Ok(Ok(admission)) = self.rx.try_recv() {
            if let Some(gate) = self.gate.upgrade() {
                debug!(
                    "Admission {} on {}/{} abandoned",
                    admission.admission_id, self.key.0, self.key.1
                );
                gate.release(&self.key);
            }
        }
    }
}

/// Ends an admitted transaction when dropped
///
/// [`TxGuard::keep_open`] leaves the transaction running for a later
/// commit or abort to end.
#[derive(Debug)]
#[must_use = "dropping the guard ends the transaction"]
pub struct TxGuard {
    gate: Weak<GateShared>,
    key: Option<BarrierKey>,
}

impl TxGuard {
    pub fn keep_open(mut self) {
        self.key = None;
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        if let (Some(key), Some(gate)) = (self.key.take(), self.gate.upgrade()) {
            gate.release(&key);
        }
    }
}

#[derive(Debug)]
struct BarrierEntry {
    epoch: Epoch,
    /// Admitted transactions not yet ended
    pending: usize,
    queue: VecDeque<Waiter>,
}

impl BarrierEntry {
    const fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            pending: 0,
            queue: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.pending == 0 && self.queue.is_empty()
    }
}

#[derive(Debug, Default)]
struct GateState {
    entries: HashMap<BarrierKey, BarrierEntry>,
    next_admission: u64,
}

impl GateState {
    fn next_admission(&mut self, epoch: Epoch) -> TxAdmission {
        self.next_admission += 1;
        TxAdmission {
            epoch,
            admission_id: self.next_admission,
        }
    }

    /// Admit a released waiter under `epoch`, or queue it again if the
    /// entry already belongs to another epoch
    fn readmit(&mut self, key: &BarrierKey, waiter: Waiter, epoch: Epoch) {
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| BarrierEntry::new(epoch));
        if entry.epoch != epoch {
            entry.queue.push_back(waiter);
            return;
        }
        entry.pending += 1;

        let admission = self.next_admission(epoch);
        if waiter.send(Ok(admission)).is_err() {
            // Caller gave up while queued
            if let Some(entry) = self.entries.get_mut(key) {
                entry.pending -= 1;
                if entry.is_idle() {
                    self.entries.remove(key);
                }
            }
        }
    }
}

struct GateShared {
    epochs: Arc<dyn EpochSource>,
    state: Mutex<GateState>,
}

impl GateShared {
    fn end_transaction(&self, key: &BarrierKey) -> Result<()> {
        let (volume, blob) = (key.0, key.1.as_str());
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(entry) = state.entries.get_mut(key) else {
            return Err(Error::invalid_argument(format!(
                "no open transaction on {}/{}",
                volume, blob
            )));
        };
        entry.pending = entry.pending.saturating_sub(1);
        if entry.pending > 0 {
            return Ok(());
        }

        let Some(drained) = state.entries.remove(key) else {
            return Ok(());
        };
        if !drained.queue.is_empty() {
            debug!(
                "Epoch {} drained on {}/{}, releasing {} transactions",
                drained.epoch,
                volume,
                blob,
                drained.queue.len()
            );
        }
        for waiter in drained.queue {
            state.readmit(key, waiter, self.epochs.current_epoch());
        }
        Ok(())
    }

    fn release(&self, key: &BarrierKey) {
        if let Err(e) = self.end_transaction(key) {
            debug!("Transaction end on {}/{} ignored: {}", key.0, key.1, e);
        }
    }
}

/// Per-(volume, blob) barrier against placement epoch changes
pub struct EpochGate {
    shared: Arc<GateShared>,
}

impl EpochGate {
    pub fn new(epochs: Arc<dyn EpochSource>) -> Self {
        Self {
            shared: Arc::new(GateShared {
                epochs,
                state: Mutex::new(GateState::default()),
            }),
        }
    }

    /// Start a transaction on `blob`
    ///
    /// Admitted immediately when no transaction is open on the blob or the
    /// open ones share the current epoch; delayed otherwise.
    pub fn begin_transaction(&self, volume: VolumeId, blob: &str) -> Admission {
        let epoch = self.shared.epochs.current_epoch();
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        match state.entries.entry((volume, blob.to_string())) {
            Entry::Vacant(vacant) => {
                vacant.insert(BarrierEntry::new(epoch)).pending = 1;
            }
            Entry::Occupied(mut occupied) if occupied.get().epoch == epoch => {
                occupied.get_mut().pending += 1;
            }
            Entry::Occupied(mut occupied) => {
                let (tx, rx) = oneshot::channel();
                let entry = occupied.get_mut();
                entry.queue.push_back(tx);
                debug!(
                    "Transaction on {}/{} at epoch {} waits for epoch {} ({} pending, {} queued)",
                    volume,
                    blob,
                    epoch,
                    entry.epoch,
                    entry.pending,
                    entry.queue.len()
                );
                return Admission::Delayed(DelayedTx {
                    rx,
                    gate: Arc::downgrade(&self.shared),
                    key: occupied.key().clone(),
                });
            }
        }
        Admission::Admitted(state.next_admission(epoch))
    }

    /// End a transaction on `blob`
    ///
    /// When the last transaction of the entry's epoch ends, every queued
    /// start is released in FIFO order.
    pub fn end_transaction(&self, volume: VolumeId, blob: &str) -> Result<()> {
        self.shared.end_transaction(&(volume, blob.to_string()))
    }

    /// Guard that ends the admitted transaction on `blob` when dropped
    pub fn guard(&self, volume: VolumeId, blob: &str) -> TxGuard {
        TxGuard {
            gate: Arc::downgrade(&self.shared),
            key: Some((volume, blob.to_string())),
        }
    }

    /// Drop every barrier of `volume`, failing queued starts with
    /// [`Error::VolumeAccessDenied`]
    ///
    /// Returns the number of queued transactions that were failed.
    pub fn remove_volume(&self, volume: VolumeId) -> usize {
        let removed: Vec<BarrierEntry> = {
            let mut state = self.shared.state.lock();
            let keys: Vec<BarrierKey> = state
                .entries
                .keys()
                .filter(|(v, _)| *v == volume)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|key| state.entries.remove(key))
                .collect()
        };

        let mut failed = 0;
        for entry in removed {
            for waiter in entry.queue {
                let _ = waiter.send(Err(Error::VolumeAccessDenied));
                failed += 1;
            }
        }
        if failed > 0 {
            info!(
                "Volume {} removed, denied {} queued transactions",
                volume, failed
            );
        }
        failed
    }

    /// Open transactions on `blob`
    #[must_use]
    pub fn pending(&self, volume: VolumeId, blob: &str) -> usize {
        self.shared
            .state
            .lock()
            .entries
            .get(&(volume, blob.to_string()))
            .map_or(0, |e| e.pending)
    }

    /// Transaction starts waiting on `blob`
    #[must_use]
    pub fn queued(&self, volume: VolumeId, blob: &str) -> usize {
        self.shared
            .state
            .lock()
            .entries
            .get(&(volume, blob.to_string()))
            .map_or(0, |e| e.queue.len())
    }

    /// Whether no barrier entry remains
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().entries.is_empty()
    }
}

impl std::fmt::Debug for EpochGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochGate")
            .field("entries", &self.shared.state.lock().entries.len())
            .finish()
    }
}
