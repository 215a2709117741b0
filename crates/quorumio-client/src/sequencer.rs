//! Per-volume sequence ids for commit-class writes
//!
//! A sequence id is handed out together with the volume's lock. The caller
//! keeps the [`SequenceGuard`] until the write has been admitted to the
//! replicas, so the order of sequence ids on the wire is the order they
//! were assigned in.

use dashmap::DashMap;
use quorumio_common::VolumeId;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

/// Sequence id plus the volume lock it was assigned under
#[derive(Debug)]
pub struct SequenceGuard {
    sequence_id: i64,
    _lock: OwnedMutexGuard<i64>,
}

impl SequenceGuard {
    #[must_use]
    pub const fn sequence_id(&self) -> i64 {
        self.sequence_id
    }
}

/// Last assigned sequence id of every attached volume
#[derive(Debug, Default)]
pub struct VolumeSequencer {
    volumes: DashMap<VolumeId, Arc<Mutex<i64>>>,
}

impl VolumeSequencer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, volume: VolumeId) -> Arc<Mutex<i64>> {
        // Clone out so no map shard stays locked across an await
        Arc::clone(&self.volumes.entry(volume).or_default())
    }

    /// Assign the next sequence id of `volume`
    ///
    /// Waits while another caller holds the volume's guard.
    pub async fn acquire_sequence(&self, volume: VolumeId) -> SequenceGuard {
        let mut last = self.slot(volume).lock_owned().await;
        *last += 1;
        trace!("Volume {} assigned sequence {}", volume, *last);
        SequenceGuard {
            sequence_id: *last,
            _lock: last,
        }
    }

    /// Raise the last sequence id to one recovered from the replicas
    pub async fn register_observed_sequence(&self, volume: VolumeId, observed: i64) {
        let mut last = self.slot(volume).lock_owned().await;
        if observed > *last {
            debug!(
                "Volume {} sequence advanced {} -> {} from replicas",
                volume, *last, observed
            );
            *last = observed;
        }
    }

    /// Last assigned sequence id, if the volume is attached
    pub async fn last_sequence(&self, volume: VolumeId) -> Option<i64> {
        let slot = self.volumes.get(&volume).map(|s| Arc::clone(&s))?;
        let last = *slot.lock().await;
        Some(last)
    }

    /// Detach `volume`; returns whether it was attached
    pub fn remove_volume(&self, volume: VolumeId) -> bool {
        self.volumes.remove(&volume).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::time::Duration;

    const VOLUME: VolumeId = VolumeId::new(4);

    #[tokio::test]
    async fn test_ids_increase_per_volume() {
        let sequencer = VolumeSequencer::new();
        for expected in 1..=3 {
            let guard = sequencer.acquire_sequence(VOLUME).await;
            assert_eq!(guard.sequence_id(), expected);
        }
        let other = sequencer.acquire_sequence(VolumeId::new(5)).await;
        assert_eq!(other.sequence_id(), 1);
        assert_eq!(sequencer.last_sequence(VOLUME).await, Some(3));
    }

    #[tokio::test]
    async fn test_observed_sequence_only_moves_forward() {
        let sequencer = VolumeSequencer::new();
        sequencer.register_observed_sequence(VOLUME, 10).await;
        sequencer.register_observed_sequence(VOLUME, 4).await;
        assert_eq!(sequencer.acquire_sequence(VOLUME).await.sequence_id(), 11);
    }

    #[tokio::test]
    async fn test_guard_serializes_holders() {
        let sequencer = Arc::new(VolumeSequencer::new());
        let first = sequencer.acquire_sequence(VOLUME).await;

        let waiter = {
            let sequencer = Arc::clone(&sequencer);
            tokio::spawn(async move { sequencer.acquire_sequence(VOLUME).await.sequence_id() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        assert_eq!(waiter.await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ids_are_a_permutation() {
        let sequencer = Arc::new(VolumeSequencer::new());
        sequencer.register_observed_sequence(VOLUME, 100).await;

        let mut delays: Vec<u64> = (0..32).collect();
        delays.shuffle(&mut rand::thread_rng());
        let tasks: Vec<_> = delays
            .into_iter()
            .map(|delay| {
                let sequencer = Arc::clone(&sequencer);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_micros(delay * 50)).await;
                    sequencer.acquire_sequence(VOLUME).await.sequence_id()
                })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (101..=132).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_remove_volume_restarts_numbering() {
        let sequencer = VolumeSequencer::new();
        sequencer.acquire_sequence(VOLUME).await;
        assert!(sequencer.remove_volume(VOLUME));
        assert!(!sequencer.remove_volume(VOLUME));
        assert_eq!(sequencer.last_sequence(VOLUME).await, None);
        assert_eq!(sequencer.acquire_sequence(VOLUME).await.sequence_id(), 1);
    }
}
