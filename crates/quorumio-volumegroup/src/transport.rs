//! Seams between the coordinator and the rest of the cluster

use crate::protocol::{CoordinatorInfo, GroupMembership, ReplicaReply, ReplicaRequest};
use async_trait::async_trait;
use futures::future::BoxFuture;
use quorumio_common::{Result, ServiceId, VolumeId};

/// Future resolving to one replica's reply
pub type ReplyFuture = BoxFuture<'static, Result<ReplicaReply>>;

/// Delivers requests to replica services
///
/// `dispatch` admits the request before it returns: two requests dispatched
/// to the same replica are delivered in dispatch order, whatever order their
/// futures are polled in. An `Err` from the future is a transport failure.
pub trait ReplicaTransport: Send + Sync {
    fn dispatch(&self, replica: ServiceId, request: ReplicaRequest) -> ReplyFuture;
}

/// Resolves volume placement and records group ownership
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    /// Current replica set and write quorum of `volume`
    async fn resolve(&self, volume: VolumeId) -> Result<GroupMembership>;

    /// Record (or with `None`, clear) the coordinator owning `volume`
    async fn set_coordinator(
        &self,
        volume: VolumeId,
        coordinator: Option<CoordinatorInfo>,
    ) -> Result<()>;
}
