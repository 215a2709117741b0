//! Per-operation bookkeeping for in-flight group requests
//!
//! A request owns its completion channel. Whatever path finishes it (quorum,
//! exhaustion, cancellation) goes through [`GroupRequest::complete`], which
//! delivers at most one result.

use bytes::Bytes;
use quorumio_common::{Error, MsgType, Result, ServiceId};
use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::protocol::VolumeIoHdr;

/// Completion channel of an operation
pub type Responder = oneshot::Sender<Result<Bytes>>;

/// Acknowledgements collected for an operation, in arrival order
pub type SuccessAcks = Vec<(ServiceId, Result<Bytes>)>;

/// Fan-out to every writable replica, completed by quorum
#[derive(Debug)]
pub struct BroadcastRequest {
    pub msg_type: MsgType,
    pub hdr: VolumeIoHdr,
    /// Acks needed for success
    pub quorum: usize,
    /// Targets still to answer, with the replica version they were sent at
    pub outstanding: HashMap<ServiceId, i64>,
    pub acks: SuccessAcks,
    /// First error seen; reported if quorum is missed
    pub first_error: Option<Error>,
    responder: Option<Responder>,
}

impl BroadcastRequest {
    pub fn new(
        msg_type: MsgType,
        hdr: VolumeIoHdr,
        quorum: usize,
        targets: &[(ServiceId, i64)],
        responder: Responder,
    ) -> Self {
        Self {
            msg_type,
            hdr,
            quorum,
            outstanding: targets.iter().copied().collect(),
            acks: Vec::with_capacity(targets.len()),
            first_error: None,
            responder: Some(responder),
        }
    }

    /// Remember the first failure
    pub fn note_error(&mut self, error: Error) {
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
    }

    #[must_use]
    pub fn quorum_met(&self) -> bool {
        self.acks.len() >= self.quorum
    }

    /// Error reported when quorum cannot be reached
    #[must_use]
    pub fn failure(&self) -> Error {
        self.first_error.clone().unwrap_or(Error::GroupDown)
    }
}

/// Try functional replicas one at a time until one answers
#[derive(Debug)]
pub struct FailoverRequest {
    pub msg_type: MsgType,
    pub hdr: VolumeIoHdr,
    pub payload: Bytes,
    /// Replicas already attempted
    pub tried: Vec<ServiceId>,
    pub acks: SuccessAcks,
    pub last_error: Option<Error>,
    responder: Option<Responder>,
}

impl FailoverRequest {
    pub fn new(msg_type: MsgType, hdr: VolumeIoHdr, payload: Bytes, responder: Responder) -> Self {
        Self {
            msg_type,
            hdr,
            payload,
            tried: Vec::new(),
            acks: Vec::new(),
            last_error: None,
            responder: Some(responder),
        }
    }

    /// Error reported when every candidate failed
    #[must_use]
    pub fn failure(&self) -> Error {
        self.last_error.clone().unwrap_or(Error::GroupDown)
    }
}

/// Kind of an in-flight group request
#[derive(Debug)]
pub enum GroupRequest {
    Broadcast(BroadcastRequest),
    Failover(FailoverRequest),
}

impl GroupRequest {
    #[must_use]
    pub const fn msg_type(&self) -> MsgType {
        match self {
            Self::Broadcast(r) => r.msg_type,
            Self::Failover(r) => r.msg_type,
        }
    }

    fn responder(&mut self) -> &mut Option<Responder> {
        match self {
            Self::Broadcast(r) => &mut r.responder,
            Self::Failover(r) => &mut r.responder,
        }
    }

    /// Deliver the terminal result; later calls are no-ops
    pub fn complete(&mut self, result: Result<Bytes>) {
        if let Some(tx) = self.responder().take() {
            // The caller may have stopped waiting
            let _ = tx.send(result);
        }
    }

    /// Whether a result was delivered
    pub fn is_complete(&mut self) -> bool {
        self.responder().is_none()
    }

    /// Deliver the variant's failure if nothing was delivered yet
    pub fn fail_if_pending(&mut self) {
        if !self.is_complete() {
            let error = match self {
                Self::Broadcast(r) => r.failure(),
                Self::Failover(r) => r.failure(),
            };
            self.complete(Err(error));
        }
    }
}
