//! QuorumIO Volume Groups
//!
//! A volume group is the set of replica services that host copies of one
//! logical volume. This crate provides the coordinator that owns the group:
//! it opens the group, orders every mutating request with monotonically
//! increasing op and commit ids, fans requests out to the replicas and
//! answers the caller once a write quorum has acknowledged.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────┐
//! │   Client dispatcher    │  (epoch gate, sequencer)
//! └───────────┬────────────┘
//!             │
//! ┌───────────▼────────────┐
//! │ VolumeGroupCoordinator │
//! │  - replica handles     │
//! │  - write log           │
//! │  - broadcast/failover  │
//! └───────────┬────────────┘
//!             │ ReplicaTransport
//! ┌───────────▼────────────┐
//! │    Volume replicas     │
//! └────────────────────────┘
//! ```
//!
//! All group state lives behind a single lock per group. Handlers take the
//! lock, mutate, and release it before awaiting any replica reply, so state
//! transitions for a group are applied one at a time.

pub mod classifier;
pub mod coordinator;
pub mod memory;
pub mod protocol;
pub mod replica;
pub mod request;
pub mod transport;
pub mod write_log;

pub use classifier::{DefaultErrorClassifier, ErrorClassifier};
pub use coordinator::{GroupDeps, OpTicket, OpenedGroup, VolumeGroupCoordinator};
pub use memory::{DispatchRecord, MemoryCluster, ReplicaBehavior};
pub use protocol::{
    AccessMode, AddToVolumeGroupMsg, AddToVolumeGroupReply, CoordinatorInfo, GroupMembership,
    OpenVolumeMsg, OpenVolumeReply, ReplicaMessage, ReplicaReply, ReplicaRequest, ReplyBody,
    ResourceState, VolumeGroupInfo, VolumeIoHdr,
};
pub use replica::ReplicaHandle;
pub use request::{BroadcastRequest, FailoverRequest, GroupRequest, SuccessAcks};
pub use transport::{MembershipProvider, ReplicaTransport, ReplyFuture};
pub use write_log::{ReplicatedWriteLog, WriteLogEntry};

/// First op id of a group session; the first write is assigned `OP_START_ID + 1`
pub const OP_START_ID: i64 = 0;

/// First commit id of a group session
pub const COMMIT_START_ID: i64 = 0;

/// Replica version of a replica that never joined the group
pub const VERSION_INVALID: i64 = 0;

/// Version a replica presents on its first join
pub const VERSION_START: i64 = 1;
