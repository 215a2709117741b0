//! Client admission path
//!
//! The dispatcher owns one coordinator per attached volume and decides
//! which admission steps a request goes through before it reaches it:
//!
//! | Request                         | Epoch gate | Sequencer | Group op |
//! |---------------------------------|------------|-----------|----------|
//! | `start_tx`                      | begin      |           | write    |
//! | `update_blob`                   |            |           | write / modify |
//! | `commit_tx`                     | end        | yes       | commit   |
//! | `update_catalog_once`           | begin, end | yes       | commit   |
//! | `set_volume_metadata`           |            | yes       | commit   |
//! | `read`                          |            |           | read     |
//!
//! Every dispatched request pins the current placement epoch until it
//! completes. Mutations are additionally serialized per volume or per blob
//! when the client config asks for it.

use crate::epoch::EpochTracker;
use crate::gate::EpochGate;
use crate::sequencer::VolumeSequencer;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use quorumio_common::config::{ClientConfig, SerializationMode, VolumeGroupConfig};
use quorumio_common::{Config, Error, MsgType, Result, ServiceId, VolumeId};
use quorumio_volumegroup::{
    AccessMode, AddToVolumeGroupMsg, AddToVolumeGroupReply, GroupDeps, OpenedGroup,
    VolumeGroupCoordinator,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Serialization domain: a whole volume or one blob of it
type SerialKey = (VolumeId, Option<String>);

/// Routes client requests to volume group coordinators
pub struct VolumeDispatcher {
    /// Identity this client coordinates groups under
    id: ServiceId,
    group_config: VolumeGroupConfig,
    client_config: ClientConfig,
    deps: GroupDeps,
    epochs: Arc<EpochTracker>,
    gate: EpochGate,
    sequencer: VolumeSequencer,
    groups: RwLock<HashMap<VolumeId, VolumeGroupCoordinator>>,
    serial: DashMap<SerialKey, Arc<Mutex<()>>>,
}

impl VolumeDispatcher {
    pub fn new(id: ServiceId, config: &Config, deps: GroupDeps, epochs: Arc<EpochTracker>) -> Self {
        Self {
            id,
            group_config: config.volume_group.clone(),
            client_config: config.client.clone(),
            deps,
            gate: EpochGate::new(epochs.clone()),
            epochs,
            sequencer: VolumeSequencer::new(),
            groups: RwLock::new(HashMap::new()),
            serial: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ServiceId {
        self.id
    }

    #[must_use]
    pub const fn gate(&self) -> &EpochGate {
        &self.gate
    }

    #[must_use]
    pub const fn sequencer(&self) -> &VolumeSequencer {
        &self.sequencer
    }

    #[must_use]
    pub const fn epochs(&self) -> &Arc<EpochTracker> {
        &self.epochs
    }

    /// Attached volumes
    #[must_use]
    pub fn volumes(&self) -> Vec<VolumeId> {
        let mut volumes: Vec<VolumeId> = self.groups.read().keys().copied().collect();
        volumes.sort_unstable();
        volumes
    }

    /// Coordinator of an attached volume
    pub fn group(&self, volume: VolumeId) -> Result<VolumeGroupCoordinator> {
        self.groups
            .read()
            .get(&volume)
            .cloned()
            .ok_or(Error::VolumeNotFound(volume.get()))
    }

    /// Attach `volume`, building its coordinator from the membership service
    pub async fn register_volume(&self, volume: VolumeId) -> Result<VolumeGroupCoordinator> {
        if !self.client_config.volume_grouping {
            return Err(Error::OpNotAllowed(
                "volume grouping is disabled".to_string(),
            ));
        }
        let existing = self.groups.read().get(&volume).cloned();
        if let Some(group) = existing {
            return Ok(group);
        }

        let group = VolumeGroupCoordinator::create(
            volume,
            self.id,
            self.group_config.clone(),
            self.deps.clone(),
        )
        .await?;
        let group = self
            .groups
            .write()
            .entry(volume)
            .or_insert(group)
            .clone();
        debug!("Volume {} registered", volume);
        Ok(group)
    }

    /// Attach and open `volume`
    ///
    /// A writable open seeds the sequencer with the highest sequence id the
    /// replicas reported, so ids keep increasing across coordinators.
    pub async fn open_volume(&self, volume: VolumeId, mode: AccessMode) -> Result<OpenedGroup> {
        let group = self.register_volume(volume).await?;
        let opened = group.open(mode).await?;
        if mode.can_write() {
            self.sequencer
                .register_observed_sequence(volume, opened.sequence_id)
                .await;
        }
        info!(
            "Volume {} open {:?} at sequence {}",
            volume, mode, opened.sequence_id
        );
        Ok(opened)
    }

    /// Close and detach `volume`
    pub async fn close_volume(&self, volume: VolumeId) -> Result<()> {
        let group = self
            .groups
            .write()
            .remove(&volume)
            .ok_or(Error::VolumeNotFound(volume.get()))?;
        group.close().await
    }

    /// Start a blob transaction
    ///
    /// Waits behind transactions of an older placement epoch on the same
    /// blob. If the start fails the transaction is ended again.
    pub async fn start_tx(&self, volume: VolumeId, blob: &str, payload: Bytes) -> Result<Bytes> {
        let group = self.group(volume)?;
        let admission = self
            .gate
            .begin_transaction(volume, blob)
            .admitted()
            .await?;
        let open = self.gate.guard(volume, blob);
        debug!(
            "Transaction on {}/{} admitted at epoch {}",
            volume, blob, admission.epoch
        );

        let result = {
            let _serial = self.serialize(volume, Some(blob)).await;
            let _pin = self.epochs.pin_current();
            group.send_write_msg(MsgType::StartBlobTx, payload).await
        };
        if result.is_ok() {
            open.keep_open();
        }
        result
    }

    /// End a blob transaction without dispatching anything
    pub fn end_tx(&self, volume: VolumeId, blob: &str) -> Result<()> {
        self.gate.end_transaction(volume, blob)
    }

    /// Commit a blob transaction and end it
    pub async fn commit_tx(&self, volume: VolumeId, blob: &str, payload: Bytes) -> Result<Bytes> {
        let _open = self.gate.guard(volume, blob);
        self.send_sequenced(volume, Some(blob), MsgType::CommitBlobTx, payload)
            .await
    }

    /// Abort a blob transaction and end it
    pub async fn abort_tx(&self, volume: VolumeId, blob: &str, payload: Bytes) -> Result<Bytes> {
        let _open = self.gate.guard(volume, blob);
        let group = self.group(volume)?;
        let _serial = self.serialize(volume, Some(blob)).await;
        let _pin = self.epochs.pin_current();
        group.send_write_msg(MsgType::AbortBlobTx, payload).await
    }

    /// Catalog update that is its own transaction
    pub async fn update_catalog_once(
        &self,
        volume: VolumeId,
        blob: &str,
        payload: Bytes,
    ) -> Result<Bytes> {
        self.group(volume)?;
        self.gate
            .begin_transaction(volume, blob)
            .admitted()
            .await?;
        let _open = self.gate.guard(volume, blob);
        self.send_sequenced(volume, Some(blob), MsgType::UpdateCatalogOnce, payload)
            .await
    }

    /// Replicate a blob mutation inside an open transaction
    ///
    /// Catalog updates advance the op id only; deletes, renames and
    /// metadata changes advance the commit id as well.
    pub async fn update_blob(
        &self,
        volume: VolumeId,
        blob: &str,
        msg_type: MsgType,
        payload: Bytes,
    ) -> Result<Bytes> {
        if msg_type.is_read()
            || msg_type.is_control()
            || msg_type.is_commit()
            || matches!(msg_type, MsgType::StartBlobTx | MsgType::AbortBlobTx)
        {
            return Err(Error::invalid_argument(format!(
                "{} is not a blob update",
                msg_type
            )));
        }
        let group = self.group(volume)?;
        let _serial = self.serialize(volume, Some(blob)).await;
        let _pin = self.epochs.pin_current();
        match msg_type {
            MsgType::UpdateCatalog => group.send_write_msg(msg_type, payload).await,
            _ => group.send_modify_msg(msg_type, payload).await,
        }
    }

    /// Replicate volume metadata as a sequenced commit
    pub async fn set_volume_metadata(&self, volume: VolumeId, payload: Bytes) -> Result<Bytes> {
        self.send_sequenced(volume, None, MsgType::SetVolumeMetadata, payload)
            .await
    }

    /// Read through the volume group
    pub async fn read(&self, volume: VolumeId, msg_type: MsgType, payload: Bytes) -> Result<Bytes> {
        if !msg_type.is_read() {
            return Err(Error::invalid_argument(format!(
                "{} is not a read",
                msg_type
            )));
        }
        let group = self.group(volume)?;
        let _pin = self.epochs.pin_current();
        group.send_read_msg(msg_type, payload).await
    }

    /// Route a replica's join request to its group
    pub async fn add_to_volume_group(
        &self,
        msg: AddToVolumeGroupMsg,
    ) -> Result<AddToVolumeGroupReply> {
        let group = self.group(msg.group_id)?;
        Ok(group.handle_add_to_volume_group(msg).await)
    }

    /// Detach `volume` for good
    ///
    /// Queued transactions are denied before the group is closed.
    pub async fn remove_volume(&self, volume: VolumeId) -> Result<()> {
        let denied = self.gate.remove_volume(volume);
        self.sequencer.remove_volume(volume);
        self.serial.retain(|(v, _), _| *v != volume);
        let group = self.groups.write().remove(&volume);
        info!(
            "Volume {} removed, {} queued transactions denied",
            volume, denied
        );
        match group {
            Some(group) => group.close().await,
            None => Ok(()),
        }
    }

    /// Whether no transaction is open or waiting
    #[must_use]
    pub fn done(&self) -> bool {
        self.gate.is_empty()
    }

    /// Assign a sequence id and admit a commit while holding it
    async fn send_sequenced(
        &self,
        volume: VolumeId,
        blob: Option<&str>,
        msg_type: MsgType,
        payload: Bytes,
    ) -> Result<Bytes> {
        let group = self.group(volume)?;
        let _serial = self.serialize(volume, blob).await;
        let _pin = self.epochs.pin_current();
        let ticket = {
            let sequence = self.sequencer.acquire_sequence(volume).await;
            group.submit_commit(msg_type, payload, sequence.sequence_id())
        };
        ticket.await
    }

    /// Take the serialization lock the config asks for, if any
    async fn serialize(&self, volume: VolumeId, blob: Option<&str>) -> Option<OwnedMutexGuard<()>> {
        let key = match self.client_config.serialization {
            SerializationMode::None => return None,
            SerializationMode::Volume => (volume, None),
            SerializationMode::Blob => (volume, blob.map(str::to_string)),
        };
        let lock = Arc::clone(&self.serial.entry(key).or_default());
        Some(lock.lock_owned().await)
    }
}

impl std::fmt::Debug for VolumeDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeDispatcher")
            .field("id", &self.id)
            .field("volumes", &self.volumes())
            .field("gate", &self.gate)
            .finish()
    }
}
