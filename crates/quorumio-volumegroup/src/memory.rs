//! In-process replica cluster
//!
//! Implements [`ReplicaTransport`] and [`MembershipProvider`] over replicas
//! that live in memory. Requests are applied when they are dispatched, so
//! per-replica delivery order is dispatch order. Each replica enforces
//! contiguous op ids and can be taken offline, made unresponsive, slowed
//! down or told to fail every request.
//!
//! Write payloads are `key=value` pairs; read payloads are keys.

use crate::coordinator::VolumeGroupCoordinator;
use crate::protocol::{
    AddToVolumeGroupMsg, CoordinatorInfo, GroupMembership, OpenVolumeReply, ReplicaMessage,
    ReplicaReply, ReplicaRequest, ReplyBody, ResourceState, VolumeGroupInfo, VolumeIoHdr,
};
use crate::transport::{MembershipProvider, ReplicaTransport, ReplyFuture};
use crate::{COMMIT_START_ID, OP_START_ID, VERSION_START};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use futures::future;
use parking_lot::Mutex;
use quorumio_common::{Epoch, Error, MsgType, Result, ServiceId, VolumeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How a replica reacts to requests
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicaBehavior {
    /// Apply and answer
    Healthy,
    /// Refuse delivery (transport error)
    Offline,
    /// Accept and never answer
    Unresponsive,
    /// Apply, answer after a delay
    Delayed(Duration),
    /// Answer every request with an error
    FailWith(Error),
    /// Apply, answer with the previous group version in the header
    StaleGroupVersion,
}

/// One request as seen by the cluster
#[derive(Clone, Debug)]
pub struct DispatchRecord {
    pub replica: ServiceId,
    pub msg_type: MsgType,
    pub hdr: VolumeIoHdr,
}

#[derive(Debug)]
struct VolumeReplica {
    activated: bool,
    /// Group version of the session this replica last joined
    session: i64,
    group_version: i64,
    applied_op_id: i64,
    applied_commit_id: i64,
    blobs: BTreeMap<String, Bytes>,
}

impl Default for VolumeReplica {
    fn default() -> Self {
        Self {
            activated: false,
            session: 0,
            group_version: 0,
            applied_op_id: OP_START_ID,
            applied_commit_id: COMMIT_START_ID,
            blobs: BTreeMap::new(),
        }
    }
}

impl VolumeReplica {
    fn apply_write(&mut self, hdr: &VolumeIoHdr, msg_type: MsgType, payload: &Bytes) -> Result<()> {
        if hdr.op_id != self.applied_op_id + 1 {
            return Err(Error::OutOfOrder {
                expected: self.applied_op_id + 1,
                actual: hdr.op_id,
            });
        }
        self.applied_op_id = hdr.op_id;
        self.applied_commit_id = self.applied_commit_id.max(hdr.commit_id);

        let text = String::from_utf8_lossy(payload);
        let (key, value) = text.split_once('=').unwrap_or((text.as_ref(), ""));
        match msg_type {
            MsgType::DeleteBlob => {
                self.blobs.remove(key);
            }
            MsgType::RenameBlob => {
                if let Some(data) = self.blobs.remove(key) {
                    self.blobs.insert(value.to_string(), data);
                }
            }
            _ => {
                self.blobs
                    .insert(key.to_string(), Bytes::from(value.to_string()));
            }
        }
        Ok(())
    }

    fn read(&self, msg_type: MsgType, payload: &Bytes) -> Result<Bytes> {
        if msg_type == MsgType::StatVolume {
            return Ok(Bytes::from(self.blobs.len().to_string()));
        }
        let key = String::from_utf8_lossy(payload);
        self.blobs
            .get(key.as_ref())
            .cloned()
            .ok_or_else(|| Error::BlobNotFound(key.into_owned()))
    }
}

#[derive(Debug)]
struct MemoryReplica {
    id: ServiceId,
    version: i64,
    behavior: ReplicaBehavior,
    volumes: HashMap<VolumeId, VolumeReplica>,
}

impl MemoryReplica {
    fn apply(&mut self, request: &ReplicaRequest) -> ReplicaReply {
        let version = self.version;
        let failure = match &self.behavior {
            ReplicaBehavior::FailWith(e) => Some(e.clone()),
            _ => None,
        };
        let volume = self.volumes.entry(request.hdr.group_id).or_default();

        match &request.message {
            ReplicaMessage::OpenVolume(msg) => {
                if let Some(e) = failure {
                    return ReplicaReply::error(version, request, e);
                }
                if msg.mode.can_write() {
                    volume.activated = true;
                } else if !volume.activated {
                    return ReplicaReply::error(version, request, Error::NotActivated);
                }
                ReplicaReply {
                    replica_version: version,
                    hdr: request.hdr,
                    result: Ok(ReplyBody::Opened(OpenVolumeReply {
                        sequence_id: volume.applied_commit_id,
                        group_version: volume.group_version,
                    })),
                }
            }
            ReplicaMessage::GroupInfoUpdate(info) => {
                if let Some(e) = failure {
                    return ReplicaReply::error(version, request, e);
                }
                Self::apply_group_info(self.id, volume, info);
                ReplicaReply::data(version, request, Bytes::new())
            }
            ReplicaMessage::Io { msg_type, payload } if msg_type.is_read() => {
                if let Some(e) = failure {
                    return ReplicaReply::error(version, request, e);
                }
                match volume.read(*msg_type, payload) {
                    Ok(data) => ReplicaReply::data(version, request, data),
                    Err(e) => ReplicaReply::error(version, request, e),
                }
            }
            ReplicaMessage::Io { msg_type, payload } => {
                match volume.apply_write(&request.hdr, *msg_type, payload) {
                    // A failing replica still consumes the op id
                    Ok(()) => match failure {
                        Some(e) => ReplicaReply::error(version, request, e),
                        None => ReplicaReply::data(version, request, Bytes::new()),
                    },
                    Err(e) => ReplicaReply::error(version, request, e),
                }
            }
        }
    }

    fn apply_group_info(id: ServiceId, volume: &mut VolumeReplica, info: &VolumeGroupInfo) {
        volume.group_version = volume.group_version.max(info.version);
        let member = matches!(
            info.replica_state(id),
            Some(ResourceState::Active | ResourceState::Syncing)
        );
        // A new coordinator session restarts op numbering
        if member && volume.session != info.coordinator.version {
            volume.session = info.coordinator.version;
            volume.applied_op_id = info.last_op_id;
        }
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    epoch: Epoch,
    replicas: BTreeMap<ServiceId, MemoryReplica>,
    volumes: HashMap<VolumeId, Option<CoordinatorInfo>>,
    dispatched: Vec<DispatchRecord>,
}

/// A set of in-memory replicas hosting every volume of the cluster
#[derive(Debug)]
pub struct MemoryCluster {
    quorum_count: usize,
    state: Mutex<ClusterState>,
}

impl MemoryCluster {
    /// Cluster of `replicas` healthy replicas with ids `1..=replicas`
    pub fn new(replicas: usize, quorum_count: usize) -> Arc<Self> {
        let replicas = (1..=replicas as u128)
            .map(|n| {
                let id = ServiceId::from_u128(n);
                let replica = MemoryReplica {
                    id,
                    version: VERSION_START,
                    behavior: ReplicaBehavior::Healthy,
                    volumes: HashMap::new(),
                };
                (id, replica)
            })
            .collect();
        Arc::new(Self {
            quorum_count,
            state: Mutex::new(ClusterState {
                epoch: Epoch::new(1),
                replicas,
                ..ClusterState::default()
            }),
        })
    }

    /// Replica ids in ascending order
    #[must_use]
    pub fn replica_ids(&self) -> Vec<ServiceId> {
        self.state.lock().replicas.keys().copied().collect()
    }

    /// Make `volume` known to the membership service
    pub fn create_volume(&self, volume: VolumeId) {
        self.state.lock().volumes.entry(volume).or_insert(None);
    }

    /// Publish a new placement epoch
    pub fn set_epoch(&self, epoch: Epoch) {
        self.state.lock().epoch = epoch;
    }

    pub fn set_behavior(&self, replica: ServiceId, behavior: ReplicaBehavior) {
        if let Some(node) = self.state.lock().replicas.get_mut(&replica) {
            debug!("Replica {} now {:?}", replica.short(), behavior);
            node.behavior = behavior;
        }
    }

    /// Pretend `replica` already committed up to `commit_id` for `volume`
    pub fn seed_commit(&self, replica: ServiceId, volume: VolumeId, commit_id: i64) {
        if let Some(node) = self.state.lock().replicas.get_mut(&replica) {
            let volume = node.volumes.entry(volume).or_default();
            volume.applied_commit_id = commit_id;
            volume.activated = true;
        }
    }

    /// Coordinator registered for `volume`
    #[must_use]
    pub fn coordinator(&self, volume: VolumeId) -> Option<CoordinatorInfo> {
        self.state.lock().volumes.get(&volume).copied().flatten()
    }

    #[must_use]
    pub fn applied_op_id(&self, replica: ServiceId, volume: VolumeId) -> i64 {
        self.with_volume(replica, volume, |v| v.applied_op_id)
            .unwrap_or(OP_START_ID)
    }

    #[must_use]
    pub fn applied_commit_id(&self, replica: ServiceId, volume: VolumeId) -> i64 {
        self.with_volume(replica, volume, |v| v.applied_commit_id)
            .unwrap_or(COMMIT_START_ID)
    }

    /// Value stored under `key` on one replica
    #[must_use]
    pub fn blob(&self, replica: ServiceId, volume: VolumeId, key: &str) -> Option<Bytes> {
        self.with_volume(replica, volume, |v| v.blobs.get(key).cloned())
            .flatten()
    }

    /// Every request dispatched so far, in dispatch order
    #[must_use]
    pub fn dispatched(&self) -> Vec<DispatchRecord> {
        self.state.lock().dispatched.clone()
    }

    fn with_volume<T>(
        &self,
        replica: ServiceId,
        volume: VolumeId,
        f: impl FnOnce(&VolumeReplica) -> T,
    ) -> Option<T> {
        let state = self.state.lock();
        state
            .replicas
            .get(&replica)
            .and_then(|node| node.volumes.get(&volume))
            .map(f)
    }

    /// Walk `replica` through the rejoin handshake with `coordinator`
    ///
    /// Announces a reload, restarts at the next replica version, asks for a
    /// replay of the writes it missed and finally asks to become active.
    pub async fn rejoin(&self, replica: ServiceId, coordinator: &VolumeGroupCoordinator) -> Result<()> {
        let volume = coordinator.volume();
        let (version, last_op_id, last_commit_id) = {
            let state = self.state.lock();
            let node = state
                .replicas
                .get(&replica)
                .ok_or_else(|| Error::ReplicaUnavailable(replica.to_string()))?;
            let (op, commit) = node
                .volumes
                .get(&volume)
                .map_or((OP_START_ID, COMMIT_START_ID), |v| {
                    (v.applied_op_id, v.applied_commit_id)
                });
            (node.version, op, commit)
        };

        let mut msg = AddToVolumeGroupMsg {
            group_id: volume,
            replica,
            replica_version: version,
            target_state: ResourceState::Loading,
            last_op_id,
            last_commit_id,
        };
        coordinator.handle_add_to_volume_group(msg).await.status?;

        let next_version = version + 1;
        if let Some(node) = self.state.lock().replicas.get_mut(&replica) {
            node.version = next_version;
        }
        msg.replica_version = next_version;
        msg.target_state = ResourceState::Syncing;
        coordinator.handle_add_to_volume_group(msg).await.status?;

        msg.target_state = ResourceState::Active;
        msg.last_op_id = self.applied_op_id(replica, volume);
        msg.last_commit_id = self.applied_commit_id(replica, volume);
        coordinator.handle_add_to_volume_group(msg).await.status
    }
}

impl ReplicaTransport for MemoryCluster {
    fn dispatch(&self, replica: ServiceId, request: ReplicaRequest) -> ReplyFuture {
        let mut state = self.state.lock();
        state.dispatched.push(DispatchRecord {
            replica,
            msg_type: request.message.msg_type(),
            hdr: request.hdr,
        });
        let Some(node) = state.replicas.get_mut(&replica) else {
            return future::ready(Err(Error::ReplicaUnavailable(replica.to_string()))).boxed();
        };
        let delay = match &node.behavior {
            ReplicaBehavior::Offline => {
                return future::ready(Err(Error::ReplicaUnavailable(replica.short()))).boxed();
            }
            ReplicaBehavior::Unresponsive => return future::pending().boxed(),
            ReplicaBehavior::Delayed(delay) => Some(*delay),
            ReplicaBehavior::Healthy
            | ReplicaBehavior::FailWith(_)
            | ReplicaBehavior::StaleGroupVersion => None,
        };
        let stale = node.behavior == ReplicaBehavior::StaleGroupVersion;
        let mut reply = node.apply(&request);
        if stale {
            reply.hdr.group_version -= 1;
        }
        drop(state);

        match delay {
            Some(delay) => async move {
                tokio::time::sleep(delay).await;
                Ok(reply)
            }
            .boxed(),
            None => future::ready(Ok(reply)).boxed(),
        }
    }
}

#[async_trait]
impl MembershipProvider for MemoryCluster {
    async fn resolve(&self, volume: VolumeId) -> Result<GroupMembership> {
        let state = self.state.lock();
        if !state.volumes.contains_key(&volume) {
            return Err(Error::VolumeNotFound(volume.get()));
        }
        Ok(GroupMembership {
            replicas: state.replicas.keys().copied().collect(),
            quorum_count: self.quorum_count,
            epoch: state.epoch,
        })
    }

    async fn set_coordinator(
        &self,
        volume: VolumeId,
        coordinator: Option<CoordinatorInfo>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .volumes
            .get_mut(&volume)
            .ok_or(Error::VolumeNotFound(volume.get()))?;
        *entry = coordinator;
        Ok(())
    }
}
