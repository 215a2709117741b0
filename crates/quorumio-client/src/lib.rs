//! QuorumIO Client - request admission for volume groups
//!
//! Everything a request goes through on the originating side before it
//! reaches a volume group coordinator:
//!
//! - [`EpochTracker`]: current placement epoch and the requests pinning
//!   older ones
//! - [`EpochGate`]: holds new blob transactions back while transactions of an
//!   older epoch on the same blob are still running
//! - [`VolumeSequencer`]: hands out per-volume sequence ids whose order is
//!   the order commits are admitted to the replicas
//! - [`VolumeDispatcher`]: owns the coordinators and wires the above into
//!   the request path

pub mod dispatcher;
pub mod epoch;
pub mod gate;
pub mod sequencer;

// Re-exports
pub use dispatcher::VolumeDispatcher;
pub use epoch::{EpochPin, EpochSource, EpochTracker};
pub use gate::{Admission, DelayedTx, EpochGate, TxAdmission, TxGuard};
pub use sequencer::{SequenceGuard, VolumeSequencer};
