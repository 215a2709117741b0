//! Per-replica bookkeeping held by a coordinator

use crate::protocol::ResourceState;
use crate::{COMMIT_START_ID, OP_START_ID, VERSION_INVALID};
use quorumio_common::{Error, ServiceId};
use serde::Serialize;

/// Coordinator view of one replica
#[derive(Clone, Debug, Serialize)]
pub struct ReplicaHandle {
    /// Service hosting the replica
    pub id: ServiceId,
    /// Replica incarnation; bumped whenever the replica faults
    pub version: i64,
    /// Current state
    pub state: ResourceState,
    /// Last fault-inducing error observed
    #[serde(serialize_with = "serialize_error")]
    pub last_error: Option<Error>,
    /// Highest op id the replica acknowledged
    pub applied_op_id: i64,
    /// Highest commit id the replica acknowledged
    pub applied_commit_id: i64,
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<Error>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(e.error_code()),
        None => serializer.serialize_none(),
    }
}

impl ReplicaHandle {
    /// New handle for a replica that has not joined yet
    #[must_use]
    pub const fn new(id: ServiceId) -> Self {
        Self {
            id,
            version: VERSION_INVALID,
            state: ResourceState::Unknown,
            last_error: None,
            applied_op_id: OP_START_ID,
            applied_commit_id: COMMIT_START_ID,
        }
    }

    /// Counts toward write quorum
    #[must_use]
    pub fn is_functional(&self) -> bool {
        self.state == ResourceState::Active
    }

    /// Receives writes but does not count toward quorum
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.state == ResourceState::Syncing
    }

    /// Neither functional nor syncing
    #[must_use]
    pub fn is_nonfunctional(&self) -> bool {
        !self.is_functional() && !self.is_syncing()
    }

    /// Reset version, state and progress in one step
    pub fn set_info(&mut self, version: i64, state: ResourceState, op_id: i64, commit_id: i64) {
        self.version = version;
        self.state = state;
        self.applied_op_id = op_id;
        self.applied_commit_id = commit_id;
    }

    /// Mark the replica failed and retire its current incarnation
    pub fn set_fault(&mut self, error: Error) {
        self.state = ResourceState::Offline;
        self.version += 1;
        self.last_error = Some(error);
    }

    /// Record progress from an acknowledged write; ids never move backward
    pub fn record_applied(&mut self, op_id: i64, commit_id: i64) {
        self.applied_op_id = self.applied_op_id.max(op_id);
        self.applied_commit_id = self.applied_commit_id.max(commit_id);
    }
}
