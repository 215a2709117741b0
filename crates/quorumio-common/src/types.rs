//! Core type definitions for QuorumIO
//!
//! This module defines the identifiers shared by the replication engine and
//! the client-side admission path: volumes, replicas, placement epochs and
//! message kinds.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a logical volume (also the id of its volume group)
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct VolumeId(u64);

impl VolumeId {
    /// Create a volume id from its numeric value
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the numeric value
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeId({})", self.0)
    }
}

/// Identity of a service instance (replica hosts and coordinators alike)
///
/// Service ids are totally ordered so that failover order is deterministic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// Generate a new random service ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create from a numeric value (handy for fixed cluster layouts)
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Short form used in log lines
    #[must_use]
    pub fn short(&self) -> String {
        let s = self.0.simple().to_string();
        s[s.len() - 8..].to_string()
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceId({})", self.short())
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Placement epoch (version of the volume → replica placement table)
///
/// A new epoch is published whenever the cluster rebalances.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct Epoch(u64);

impl Epoch {
    /// Epoch value used before any placement table is known
    pub const INVALID: Self = Self(0);

    /// Create an epoch from its numeric value
    #[must_use]
    pub const fn new(epoch: u64) -> Self {
        Self(epoch)
    }

    /// Get the numeric value
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// The epoch following this one
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}

/// Kind of message exchanged with volume replicas
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum MsgType {
    /// Prepare a replica for group open
    OpenVolume,
    /// Push the current group membership to replicas
    GroupInfoUpdate,
    /// Start a blob transaction
    StartBlobTx,
    /// Update blob catalog within a transaction
    UpdateCatalog,
    /// Single-shot catalog update (implicit transaction)
    UpdateCatalogOnce,
    /// Commit a blob transaction
    CommitBlobTx,
    /// Abort a blob transaction
    AbortBlobTx,
    /// Delete a blob
    DeleteBlob,
    /// Rename a blob
    RenameBlob,
    /// Set blob metadata
    SetBlobMetadata,
    /// Set volume metadata
    SetVolumeMetadata,
    /// Query the blob catalog
    QueryCatalog,
    /// Read blob metadata
    GetBlobMetadata,
    /// Read volume metadata
    GetVolumeMetadata,
    /// Volume statistics
    StatVolume,
    /// List blobs in the volume
    GetBucket,
}

impl MsgType {
    /// Whether the message only reads replica state
    #[must_use]
    pub const fn is_read(&self) -> bool {
        matches!(
            self,
            Self::QueryCatalog
                | Self::GetBlobMetadata
                | Self::GetVolumeMetadata
                | Self::StatVolume
                | Self::GetBucket
        )
    }

    /// Whether the message marks a durable commit boundary
    #[must_use]
    pub const fn is_commit(&self) -> bool {
        matches!(
            self,
            Self::CommitBlobTx | Self::UpdateCatalogOnce | Self::SetVolumeMetadata
        )
    }

    /// Whether the message is a group control message
    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self, Self::OpenVolume | Self::GroupInfoUpdate)
    }
}
