//! Messages exchanged between a volume group coordinator and its replicas
//!
//! The coordinator never encodes bytes itself. Requests carry typed control
//! messages or opaque payloads, and the [`ReplicaTransport`] implementation
//! decides how they travel.
//!
//! [`ReplicaTransport`]: crate::transport::ReplicaTransport

use bytes::Bytes;
use quorumio_common::{Epoch, Error, MsgType, Result, ServiceId, VolumeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a volume group or of one replica within it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceState {
    /// Never opened, or closed
    #[default]
    Unknown,
    /// Open in progress
    Loading,
    /// Catching up on missed writes; receives new writes but does not count
    /// toward quorum
    Syncing,
    /// Serving requests
    Active,
    /// Failed or unreachable
    Offline,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::Loading => "Loading",
            Self::Syncing => "Syncing",
            Self::Active => "Active",
            Self::Offline => "Offline",
        };
        write!(f, "{}", s)
    }
}

/// How a group handle was opened
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Coordinator: orders and replicates writes
    #[default]
    ReadWrite,
    /// Read-only handle: failover reads, no coordinator duties
    ReadOnly,
}

impl AccessMode {
    /// Whether the handle may issue writes
    #[must_use]
    pub const fn can_write(&self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

/// Header stamped on every request sent to a replica
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeIoHdr {
    /// Group (volume) the request belongs to
    pub group_id: VolumeId,
    /// Group version at dispatch time
    pub group_version: i64,
    /// Op id (writes only, otherwise the latest assigned op id)
    pub op_id: i64,
    /// Commit id (latest assigned commit id)
    pub commit_id: i64,
    /// Client sequence id attached to commit requests (0 when unset)
    pub sequence_id: i64,
}

impl VolumeIoHdr {
    /// Header for a request on `group_id`
    #[must_use]
    pub const fn new(group_id: VolumeId, group_version: i64) -> Self {
        Self {
            group_id,
            group_version,
            op_id: 0,
            commit_id: 0,
            sequence_id: 0,
        }
    }
}

/// Identity of the coordinator that currently owns a group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorInfo {
    /// Service hosting the coordinator
    pub id: ServiceId,
    /// Coordinator incarnation
    pub version: i64,
}

/// Ask a replica to take part in a group open
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenVolumeMsg {
    pub volume: VolumeId,
    pub mode: AccessMode,
    pub coordinator: CoordinatorInfo,
}

/// A replica's answer to [`OpenVolumeMsg`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenVolumeReply {
    /// Highest commit (sequence) id the replica has applied
    pub sequence_id: i64,
    /// Highest group version the replica has seen
    pub group_version: i64,
}

/// Snapshot of group membership pushed to replicas
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroupInfo {
    pub group_id: VolumeId,
    pub version: i64,
    pub coordinator: CoordinatorInfo,
    pub last_op_id: i64,
    pub last_commit_id: i64,
    pub functional: Vec<ServiceId>,
    pub syncing: Vec<ServiceId>,
    pub nonfunctional: Vec<ServiceId>,
}

impl VolumeGroupInfo {
    /// State of `replica` according to this snapshot
    #[must_use]
    pub fn replica_state(&self, replica: ServiceId) -> Option<ResourceState> {
        if self.functional.contains(&replica) {
            Some(ResourceState::Active)
        } else if self.syncing.contains(&replica) {
            Some(ResourceState::Syncing)
        } else if self.nonfunctional.contains(&replica) {
            Some(ResourceState::Offline)
        } else {
            None
        }
    }
}

/// Replica set of a volume as resolved by the membership service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMembership {
    /// Candidate replicas, in placement order
    pub replicas: Vec<ServiceId>,
    /// Acks required for a write to succeed
    pub quorum_count: usize,
    /// Placement epoch the membership was resolved at
    pub epoch: Epoch,
}

/// A replica asking to (re)join the group at `target_state`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddToVolumeGroupMsg {
    pub group_id: VolumeId,
    pub replica: ServiceId,
    pub replica_version: i64,
    /// `Loading`, `Syncing` or `Active`
    pub target_state: ResourceState,
    /// Last op id the replica applied (used for replay on `Syncing`)
    pub last_op_id: i64,
    pub last_commit_id: i64,
}

/// Coordinator answer to [`AddToVolumeGroupMsg`]
#[derive(Clone, Debug)]
pub struct AddToVolumeGroupReply {
    pub status: Result<()>,
    pub group: VolumeGroupInfo,
}

/// Body of a request sent to a replica
#[derive(Clone, Debug)]
pub enum ReplicaMessage {
    /// Group open
    OpenVolume(OpenVolumeMsg),
    /// Membership push
    GroupInfoUpdate(VolumeGroupInfo),
    /// Data path request with an opaque payload
    Io { msg_type: MsgType, payload: Bytes },
}

impl ReplicaMessage {
    /// Message kind
    #[must_use]
    pub const fn msg_type(&self) -> MsgType {
        match self {
            Self::OpenVolume(_) => MsgType::OpenVolume,
            Self::GroupInfoUpdate(_) => MsgType::GroupInfoUpdate,
            Self::Io { msg_type, .. } => *msg_type,
        }
    }
}

/// A request addressed to one replica
#[derive(Clone, Debug)]
pub struct ReplicaRequest {
    /// Version of the target replica as known by the coordinator
    pub replica_version: i64,
    pub hdr: VolumeIoHdr,
    pub message: ReplicaMessage,
}

/// Successful reply body
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyBody {
    Opened(OpenVolumeReply),
    Data(Bytes),
}

/// A replica's reply; the header is echoed from the request
#[derive(Clone, Debug)]
pub struct ReplicaReply {
    pub replica_version: i64,
    pub hdr: VolumeIoHdr,
    pub result: Result<ReplyBody>,
}

impl ReplicaReply {
    /// Successful data reply to `request`
    #[must_use]
    pub fn data(replica_version: i64, request: &ReplicaRequest, payload: Bytes) -> Self {
        Self {
            replica_version,
            hdr: request.hdr,
            result: Ok(ReplyBody::Data(payload)),
        }
    }

    /// Error reply to `request`
    #[must_use]
    pub fn error(replica_version: i64, request: &ReplicaRequest, error: Error) -> Self {
        Self {
            replica_version,
            hdr: request.hdr,
            result: Err(error),
        }
    }

    /// Result as seen by the data path
    #[must_use]
    pub fn into_payload(self) -> Result<Bytes> {
        match self.result? {
            ReplyBody::Data(payload) => Ok(payload),
            ReplyBody::Opened(_) => Ok(Bytes::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_info() -> VolumeGroupInfo {
        VolumeGroupInfo {
            group_id: VolumeId::new(1),
            version: 3,
            coordinator: CoordinatorInfo {
                id: ServiceId::from_u128(100),
                version: 1,
            },
            last_op_id: 10,
            last_commit_id: 4,
            functional: vec![ServiceId::from_u128(1)],
            syncing: vec![ServiceId::from_u128(2)],
            nonfunctional: vec![ServiceId::from_u128(3)],
        }
    }

    #[test]
    fn test_replica_state_lookup() {
        let info = group_info();
        assert_eq!(
            info.replica_state(ServiceId::from_u128(1)),
            Some(ResourceState::Active)
        );
        assert_eq!(
            info.replica_state(ServiceId::from_u128(2)),
            Some(ResourceState::Syncing)
        );
        assert_eq!(
            info.replica_state(ServiceId::from_u128(3)),
            Some(ResourceState::Offline)
        );
        assert_eq!(info.replica_state(ServiceId::from_u128(4)), None);
    }

    #[test]
    fn test_group_info_json() {
        let info = group_info();
        let json = serde_json::to_string(&info).unwrap();
        let back: VolumeGroupInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, back);
    }

    #[test]
    fn test_reply_payload() {
        let request = ReplicaRequest {
            replica_version: 1,
            hdr: VolumeIoHdr::new(VolumeId::new(1), 2),
            message: ReplicaMessage::Io {
                msg_type: MsgType::GetBlobMetadata,
                payload: Bytes::new(),
            },
        };
        let ok = ReplicaReply::data(1, &request, Bytes::from_static(b"meta"));
        assert_eq!(ok.hdr.group_version, 2);
        assert_eq!(ok.into_payload().unwrap(), Bytes::from_static(b"meta"));

        let err = ReplicaReply::error(1, &request, Error::CatalogEntryNotFound);
        assert_eq!(err.into_payload(), Err(Error::CatalogEntryNotFound));
        assert_eq!(request.message.msg_type(), MsgType::GetBlobMetadata);
    }

    #[test]
    fn test_access_mode() {
        assert!(AccessMode::ReadWrite.can_write());
        assert!(!AccessMode::ReadOnly.can_write());
    }
}
