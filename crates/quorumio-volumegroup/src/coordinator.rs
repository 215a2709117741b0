//! Volume group coordinator
//!
//! One coordinator owns one volume group. It classifies replicas into
//! functional, syncing and non-functional sets, assigns op and commit ids,
//! fans writes out to every writable replica and reports success once a
//! quorum of functional replicas acknowledged. Reads fail over across the
//! functional replicas one at a time.
//!
//! Every state change happens with the group lock held, and the lock is
//! never held across an `.await`. Request continuations run as tokio tasks
//! that take the lock to process each reply.

use crate::classifier::{DefaultErrorClassifier, ErrorClassifier};
use crate::protocol::{
    AccessMode, AddToVolumeGroupMsg, AddToVolumeGroupReply, CoordinatorInfo, GroupMembership,
    OpenVolumeMsg, OpenVolumeReply, ReplicaMessage, ReplicaReply, ReplicaRequest, ReplyBody,
    ResourceState, VolumeGroupInfo, VolumeIoHdr,
};
use crate::replica::ReplicaHandle;
use crate::request::{BroadcastRequest, FailoverRequest, GroupRequest, SuccessAcks};
use crate::transport::{MembershipProvider, ReplicaTransport};
use crate::write_log::{ReplicatedWriteLog, WriteLogEntry};
use crate::{COMMIT_START_ID, OP_START_ID, VERSION_START};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use quorumio_common::config::VolumeGroupConfig;
use quorumio_common::{Epoch, Error, MsgType, Result, ServiceId, VolumeId};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Notify, oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Collaborators injected into a coordinator
#[derive(Clone)]
pub struct GroupDeps {
    pub transport: Arc<dyn ReplicaTransport>,
    pub membership: Arc<dyn MembershipProvider>,
    pub classifier: Arc<dyn ErrorClassifier>,
}

impl GroupDeps {
    /// Dependencies with the default error classifier
    pub fn new(
        transport: Arc<dyn ReplicaTransport>,
        membership: Arc<dyn MembershipProvider>,
    ) -> Self {
        Self {
            transport,
            membership,
            classifier: Arc::new(DefaultErrorClassifier),
        }
    }

    /// Replace the error classifier
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }
}

/// Pending result of a submitted operation
///
/// Resolves exactly once. If the coordinator goes away without answering
/// the ticket resolves to [`Error::Closed`].
#[derive(Debug)]
pub struct OpTicket {
    rx: oneshot::Receiver<Result<Bytes>>,
}

impl Future for OpTicket {
    type Output = Result<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Closed)))
    }
}

/// Result of a successful open
#[derive(Debug, Clone)]
pub struct OpenedGroup {
    /// Highest committed sequence id reported by the replica set
    pub sequence_id: i64,
    /// Membership after open
    pub group: VolumeGroupInfo,
}

/// Reply of one dispatched request, tagged with target and version
type Attempt = BoxFuture<'static, (ServiceId, i64, Result<ReplicaReply>)>;

fn attempt(
    transport: &dyn ReplicaTransport,
    replica: ServiceId,
    request: ReplicaRequest,
    timeout: Duration,
) -> Attempt {
    let version = request.replica_version;
    let reply = transport.dispatch(replica, request);
    async move {
        let reply = tokio::time::timeout(timeout, reply)
            .await
            .unwrap_or(Err(Error::Timeout));
        (replica, version, reply)
    }
    .boxed()
}

/// Replay of one logged write, tagged with the header and type replayed
type Replay = BoxFuture<'static, (ServiceId, i64, VolumeIoHdr, MsgType, Result<ReplicaReply>)>;

/// Group state; only touched with the group lock held
struct GroupState {
    volume: VolumeId,
    quorum: usize,
    epoch: Epoch,
    state: ResourceState,
    mode: AccessMode,
    coordinator: CoordinatorInfo,
    group_version: i64,
    /// Bumped on every group state change; in-flight requests started under
    /// an older generation are abandoned
    generation: u64,
    generation_tx: watch::Sender<u64>,
    op_seq: i64,
    commit_seq: i64,
    /// Sorted by replica id except on read-only handles, where failed
    /// replicas rotate to the back
    replicas: Vec<ReplicaHandle>,
    write_log: Option<ReplicatedWriteLog>,
    write_log_capacity: usize,
    in_flight: usize,
    closing: bool,
    closed: bool,
    registered: bool,
    check_scheduled: bool,
}

impl GroupState {
    fn index_of(&self, replica: ServiceId) -> Option<usize> {
        self.replicas.iter().position(|r| r.id == replica)
    }

    fn functional_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_functional()).count()
    }

    fn syncing_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_syncing()).count()
    }

    fn nonfunctional_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_nonfunctional()).count()
    }

    fn hdr(&self) -> VolumeIoHdr {
        VolumeIoHdr {
            group_id: self.volume,
            group_version: self.group_version,
            op_id: self.op_seq,
            commit_id: self.commit_seq,
            sequence_id: 0,
        }
    }

    fn change_state(&mut self, target: ResourceState) {
        if self.state == target {
            return;
        }
        info!(
            "Volume group {} state {} -> {} (functional {}/{})",
            self.volume,
            self.state,
            target,
            self.functional_count(),
            self.quorum
        );
        self.state = target;
        self.group_version += 1;
        self.generation += 1;
        self.generation_tx.send_replace(self.generation);
    }

    /// Reject requests the group cannot take right now
    fn check_access(&self, is_write: bool) -> Result<()> {
        if self.closing || self.closed {
            return Err(Error::Closed);
        }
        if is_write && !self.mode.can_write() {
            return Err(Error::invalid_argument(
                "write on a read-only volume group handle",
            ));
        }
        match self.state {
            ResourceState::Active => Ok(()),
            ResourceState::Unknown | ResourceState::Loading => Err(Error::GroupNotOpen),
            _ if self.functional_count() == 0 => Err(Error::GroupInvalid),
            ResourceState::Offline if !is_write => Ok(()),
            _ => Err(Error::GroupDown),
        }
    }

    /// Error for a request abandoned by a state change
    fn abandon_error(&self, is_write: bool) -> Error {
        self.check_access(is_write).err().unwrap_or(Error::GroupDown)
    }

    fn group_info(&self) -> VolumeGroupInfo {
        let ids = |pred: fn(&ReplicaHandle) -> bool| {
            self.replicas
                .iter()
                .filter(|r| pred(r))
                .map(|r| r.id)
                .collect::<Vec<_>>()
        };
        VolumeGroupInfo {
            group_id: self.volume,
            version: self.group_version,
            coordinator: self.coordinator,
            last_op_id: self.op_seq,
            last_commit_id: self.commit_seq,
            functional: ids(ReplicaHandle::is_functional),
            syncing: ids(ReplicaHandle::is_syncing),
            nonfunctional: ids(ReplicaHandle::is_nonfunctional),
        }
    }

    /// Replicas that receive writes, with the version they are addressed at
    fn writable_targets(&self) -> Vec<(ServiceId, i64)> {
        self.replicas
            .iter()
            .filter(|r| r.is_functional() || r.is_syncing())
            .map(|r| (r.id, r.version))
            .collect()
    }

    /// Functional replicas among `outstanding` that could still ack
    fn outstanding_functional(&self, outstanding: &HashMap<ServiceId, i64>) -> usize {
        self.replicas
            .iter()
            .filter(|r| r.is_functional() && outstanding.get(&r.id) == Some(&r.version))
            .count()
    }

    fn reset_for_open(&mut self, mode: AccessMode) {
        self.mode = mode;
        self.op_seq = OP_START_ID;
        self.commit_seq = COMMIT_START_ID;
        self.write_log = None;
        for replica in &mut self.replicas {
            replica.state = ResourceState::Offline;
            replica.last_error = None;
        }
        self.change_state(ResourceState::Loading);
    }

    fn reset_op_ids(&mut self) {
        if self.op_seq == OP_START_ID {
            return;
        }
        info!(
            "Volume group {} has no functional replicas, op ids restart at {}",
            self.volume, OP_START_ID
        );
        self.op_seq = OP_START_ID;
        if let Some(log) = self.write_log.as_mut() {
            log.reset(OP_START_ID);
        }
    }

    fn log_write(&mut self, entry: WriteLogEntry) {
        let Some(log) = self.write_log.as_mut() else {
            return;
        };
        let op_id = entry.op_id;
        if let Err(e) = log.append(entry.clone()) {
            warn!("Volume group {} write log out of step: {}", self.volume, e);
            log.reset(op_id - 1);
            if let Err(e) = log.append(entry) {
                warn!("Volume group {} dropped op {} from write log: {}", self.volume, op_id, e);
            }
        }
    }

    /// Take a replica out of service after a fault
    fn fault_replica(&mut self, idx: usize, error: Error) {
        let handle = &mut self.replicas[idx];
        let was_functional = handle.is_functional();
        warn!(
            "Volume group {} replica {} faulted at version {}: {}",
            self.volume,
            handle.id.short(),
            handle.version,
            error
        );
        handle.set_fault(error);
        self.group_version += 1;

        let functional = self.functional_count();
        if was_functional && self.state == ResourceState::Active && functional < self.quorum {
            warn!(
                "Volume group {} lost write quorum: {} functional, {} required",
                self.volume, functional, self.quorum
            );
            self.change_state(ResourceState::Offline);
        }
        if self.state != ResourceState::Active && functional == 0 {
            self.reset_op_ids();
        }
    }

    /// Apply one replica reply to group state
    ///
    /// Replies from a retired replica version are dropped. Successes and
    /// logical errors advance the replica's watermarks and, for functional
    /// replicas, are appended to `acks`. Faults take the replica offline
    /// (read-only handles only rotate it to the back of the read order).
    #[allow(clippy::too_many_arguments)]
    fn handle_volume_response(
        &mut self,
        classifier: &dyn ErrorClassifier,
        replica: ServiceId,
        replica_version: i64,
        hdr: &VolumeIoHdr,
        msg_type: MsgType,
        is_write: bool,
        status: &Result<Bytes>,
        acks: &mut SuccessAcks,
    ) {
        let Some(idx) = self.index_of(replica) else {
            warn!(
                "Volume group {} ignoring reply from unknown replica {}",
                self.volume, replica
            );
            return;
        };
        let read_only = !self.mode.can_write();
        let handle = &mut self.replicas[idx];
        if !read_only && handle.version != replica_version {
            debug!(
                "Volume group {} dropping stale {} reply from {}: version {} != {}",
                self.volume,
                msg_type,
                replica.short(),
                replica_version,
                handle.version
            );
            return;
        }

        let fault = match status {
            Err(e) if classifier.is_fault(msg_type, e) => Some(e.clone()),
            _ => None,
        };
        match fault {
            None => {
                if is_write {
                    if hdr.op_id > handle.applied_op_id + 1 {
                        debug!(
                            "Replica {} acked op {} after op {}",
                            replica.short(),
                            hdr.op_id,
                            handle.applied_op_id
                        );
                    }
                    handle.record_applied(hdr.op_id, hdr.commit_id);
                }
                if handle.is_functional() {
                    acks.push((replica, status.clone()));
                }
            }
            Some(error) if read_only => {
                let mut handle = self.replicas.remove(idx);
                debug!(
                    "Volume group {} rotating replica {} after {}",
                    self.volume,
                    replica.short(),
                    error
                );
                handle.last_error = Some(error);
                self.replicas.push(handle);
            }
            Some(error) => {
                if !handle.is_nonfunctional() {
                    self.fault_replica(idx, error);
                }
            }
        }
    }

    fn replay_attempts(
        &self,
        transport: &dyn ReplicaTransport,
        idx: usize,
        entries: Vec<WriteLogEntry>,
        timeout: Duration,
    ) -> Vec<Replay> {
        let handle = &self.replicas[idx];
        entries
            .into_iter()
            .map(|entry| {
                let (hdr, msg_type) = (entry.hdr, entry.msg_type);
                let request = ReplicaRequest {
                    replica_version: handle.version,
                    hdr,
                    message: ReplicaMessage::Io {
                        msg_type,
                        payload: entry.payload,
                    },
                };
                let reply = attempt(transport, handle.id, request, timeout);
                async move {
                    let (replica, version, reply) = reply.await;
                    (replica, version, hdr, msg_type, reply)
                }
                .boxed()
            })
            .collect()
    }

    /// Move a replica towards `msg.target_state`; returns replay requests
    fn add_to_group(
        &mut self,
        transport: &dyn ReplicaTransport,
        msg: &AddToVolumeGroupMsg,
        timeout: Duration,
    ) -> Result<Vec<Replay>> {
        if self.closing || self.closed {
            return Err(Error::Closed);
        }
        if !self.mode.can_write() {
            return Err(Error::InvalidCoordinator);
        }
        if matches!(
            self.state,
            ResourceState::Unknown | ResourceState::Loading
        ) {
            return Err(Error::NotReady(format!(
                "volume group {} is not open",
                self.volume
            )));
        }
        let idx = self.index_of(msg.replica).ok_or_else(|| {
            Error::invalid_argument(format!(
                "replica {} is not a member of volume group {}",
                msg.replica, self.volume
            ))
        })?;

        match msg.target_state {
            ResourceState::Loading => {
                if self.replicas[idx].is_nonfunctional() {
                    self.replicas[idx].state = ResourceState::Offline;
                    self.group_version += 1;
                } else {
                    self.fault_replica(idx, Error::NotReady("replica reloading".to_string()));
                }
                info!(
                    "Volume group {} replica {} loading",
                    self.volume,
                    msg.replica.short()
                );
                Ok(Vec::new())
            }
            ResourceState::Syncing => {
                let handle = &self.replicas[idx];
                if !handle.is_nonfunctional() {
                    return Err(Error::invalid_argument(format!(
                        "replica {} is already {}",
                        msg.replica, handle.state
                    )));
                }
                // A faulted handle's version is already past the retired one
                if msg.replica_version != VERSION_START && msg.replica_version < handle.version {
                    return Err(Error::InvalidVersion {
                        expected: handle.version,
                        actual: msg.replica_version,
                    });
                }
                let log = self.write_log.as_ref().ok_or_else(|| {
                    Error::NotReady(format!("volume group {} is not buffering writes", self.volume))
                })?;
                let entries: Vec<WriteLogEntry> =
                    log.entries_from(msg.last_op_id + 1)?.cloned().collect();

                let (op_seq, commit_seq) = (self.op_seq, self.commit_seq);
                self.replicas[idx].set_info(
                    msg.replica_version,
                    ResourceState::Syncing,
                    op_seq,
                    commit_seq,
                );
                self.group_version += 1;
                info!(
                    "Volume group {} replica {} syncing at version {}, replaying {} ops after {}",
                    self.volume,
                    msg.replica.short(),
                    msg.replica_version,
                    entries.len(),
                    msg.last_op_id
                );
                Ok(self.replay_attempts(transport, idx, entries, timeout))
            }
            ResourceState::Active => {
                let op_seq = self.op_seq;
                let handle = &mut self.replicas[idx];
                if !handle.is_syncing() {
                    return Err(Error::invalid_argument(format!(
                        "replica {} is {}, not syncing",
                        msg.replica, handle.state
                    )));
                }
                if msg.replica_version != handle.version {
                    return Err(Error::InvalidVersion {
                        expected: handle.version,
                        actual: msg.replica_version,
                    });
                }
                // Syncing assumed the replay lands; trust only what the replica reports
                if msg.last_op_id != op_seq {
                    return Err(Error::NotReady(format!(
                        "replica at op {} but group at op {}",
                        msg.last_op_id, op_seq
                    )));
                }
                handle.state = ResourceState::Active;
                handle.last_error = None;
                self.group_version += 1;
                info!(
                    "Volume group {} replica {} active at version {}",
                    self.volume,
                    msg.replica.short(),
                    msg.replica_version
                );
                if self.state == ResourceState::Offline && self.functional_count() >= self.quorum {
                    self.change_state(ResourceState::Active);
                }
                Ok(Vec::new())
            }
            other => Err(Error::invalid_argument(format!(
                "cannot join a volume group as {}",
                other
            ))),
        }
    }

    fn finish_coordinator_open(&mut self, opened: &[(usize, i64, OpenVolumeReply)]) -> Result<i64> {
        let Some(latest) = opened.iter().map(|(_, _, reply)| reply.sequence_id).max() else {
            warn!("Volume group {} open: no replica answered", self.volume);
            self.change_state(ResourceState::Unknown);
            return Err(Error::GroupDown);
        };
        let up = opened
            .iter()
            .filter(|(_, _, reply)| reply.sequence_id == latest)
            .count();
        if up < self.quorum {
            warn!(
                "Volume group {} open: {} replicas at sequence {}, {} required",
                self.volume, up, latest, self.quorum
            );
            self.change_state(ResourceState::Unknown);
            return Err(Error::GroupDown);
        }

        let seen = opened
            .iter()
            .map(|(_, _, reply)| reply.group_version)
            .max()
            .unwrap_or(0);
        self.group_version = self.group_version.max(seen) + 1;
        self.commit_seq = latest;
        for &(idx, version, reply) in opened {
            let state = if reply.sequence_id == latest {
                ResourceState::Active
            } else {
                ResourceState::Syncing
            };
            self.replicas[idx].set_info(version, state, OP_START_ID, reply.sequence_id);
        }
        self.write_log = Some(ReplicatedWriteLog::new(self.write_log_capacity, OP_START_ID));
        self.coordinator.version = self.group_version;
        Ok(latest)
    }

    fn finish_read_only_open(
        &mut self,
        opened: &[(usize, i64, OpenVolumeReply)],
        not_activated: usize,
    ) -> Result<i64> {
        if opened.is_empty() && not_activated == self.replicas.len() {
            self.change_state(ResourceState::Unknown);
            return Err(Error::NotActivated);
        }
        for replica in &mut self.replicas {
            replica.state = ResourceState::Active;
        }
        let mut latest = COMMIT_START_ID;
        for &(idx, version, reply) in opened {
            self.replicas[idx].set_info(version, ResourceState::Active, OP_START_ID, reply.sequence_id);
            self.group_version = self.group_version.max(reply.group_version);
            latest = latest.max(reply.sequence_id);
        }
        self.commit_seq = latest;
        self.change_state(ResourceState::Active);
        if opened.is_empty() {
            return Err(Error::GroupDown);
        }
        Ok(latest)
    }

    fn state_info(&self) -> serde_json::Value {
        json!({
            "volume": self.volume.get(),
            "state": self.state.to_string(),
            "mode": format!("{:?}", self.mode),
            "epoch": self.epoch.get(),
            "group_version": self.group_version,
            "coordinator": self.coordinator.id.to_string(),
            "quorum": self.quorum,
            "functional": self.functional_count(),
            "syncing": self.syncing_count(),
            "nonfunctional": self.nonfunctional_count(),
            "op_id": self.op_seq,
            "sequence_id": self.commit_seq,
            "in_flight": self.in_flight,
            "write_log": self.write_log.as_ref().map(|log| json!({
                "len": log.len(),
                "capacity": log.capacity(),
                "oldest_op_id": log.oldest_op_id(),
            })),
            "replicas": serde_json::to_value(&self.replicas).unwrap_or_default(),
        })
    }
}

struct Inner {
    volume: VolumeId,
    config: VolumeGroupConfig,
    deps: GroupDeps,
    state: Mutex<GroupState>,
    drained: Notify,
}

/// Counts an operation as in flight until dropped
///
/// Never drop while holding the group lock.
struct InFlight {
    inner: Arc<Inner>,
}

impl InFlight {
    fn new(inner: &Arc<Inner>, st: &mut GroupState) -> Self {
        st.in_flight += 1;
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let idle = {
            let mut st = self.inner.state.lock();
            st.in_flight -= 1;
            st.in_flight == 0
        };
        if idle {
            self.inner.drained.notify_waiters();
        }
    }
}

impl Inner {
    fn transport(&self) -> &dyn ReplicaTransport {
        self.deps.transport.as_ref()
    }

    fn abandon(&self, request: &mut GroupRequest) {
        let is_write = matches!(request, GroupRequest::Broadcast(_));
        let error = self.state.lock().abandon_error(is_write);
        debug!(
            "Volume group {} abandoning {} request: {}",
            self.volume,
            request.msg_type(),
            error
        );
        request.complete(Err(error));
    }

    /// Process one reply; returns whether more replies are expected
    fn on_reply(
        self: &Arc<Self>,
        request: &mut GroupRequest,
        replica: ServiceId,
        dispatched_version: i64,
        reply: Result<ReplicaReply>,
        generation: u64,
    ) -> bool {
        let mut st = self.state.lock();
        if st.generation != generation {
            drop(st);
            self.abandon(request);
            return false;
        }

        let echoed = match &*request {
            GroupRequest::Broadcast(b) => b.hdr.group_version,
            GroupRequest::Failover(f) => f.hdr.group_version,
        };
        let usable = match reply {
            Ok(reply) if reply.hdr.group_version != echoed => {
                debug!(
                    "Volume group {} dropping reply from {} for group version {} (sent {})",
                    self.volume,
                    replica.short(),
                    reply.hdr.group_version,
                    echoed
                );
                None
            }
            Ok(reply) => Some((reply.replica_version, reply.into_payload())),
            Err(e) => Some((dispatched_version, Err(e))),
        };

        let classifier = self.deps.classifier.as_ref();
        let (outcome, more) = match request {
            GroupRequest::Broadcast(b) => {
                b.outstanding.remove(&replica);
                if let Some((replica_version, status)) = usable {
                    let before = b.acks.len();
                    st.handle_volume_response(
                        classifier,
                        replica,
                        replica_version,
                        &b.hdr,
                        b.msg_type,
                        true,
                        &status,
                        &mut b.acks,
                    );
                    if b.acks.len() == before {
                        if let Err(e) = status {
                            b.note_error(e);
                        }
                    }
                }
                let outcome = if b.quorum_met() {
                    b.acks.first().map(|(_, result)| result.clone())
                } else if b.acks.len() + st.outstanding_functional(&b.outstanding) < b.quorum {
                    Some(Err(b.failure()))
                } else {
                    None
                };
                (outcome, !b.outstanding.is_empty())
            }
            GroupRequest::Failover(f) => {
                match usable {
                    Some((replica_version, status)) => {
                        st.handle_volume_response(
                            classifier,
                            replica,
                            replica_version,
                            &f.hdr,
                            f.msg_type,
                            false,
                            &status,
                            &mut f.acks,
                        );
                        if f.acks.is_empty() {
                            if let Err(e) = status {
                                f.last_error = Some(e);
                            }
                        }
                    }
                    None => f.last_error = Some(Error::GroupDown),
                }
                let outcome = f.acks.first().map(|(_, result)| result.clone());
                let more = outcome.is_none();
                (outcome, more)
            }
        };
        self.maybe_schedule_check(&mut st);
        drop(st);

        if let Some(result) = outcome {
            request.complete(result);
        }
        more
    }

    /// Dispatch the next failover attempt, if a candidate is left
    fn next_failover_attempt(&self, request: &mut GroupRequest, generation: u64) -> Option<Attempt> {
        let st = self.state.lock();
        if st.generation != generation {
            drop(st);
            self.abandon(request);
            return None;
        }
        let GroupRequest::Failover(f) = request else {
            return None;
        };
        let candidate = st
            .replicas
            .iter()
            .find(|r| r.is_functional() && !f.tried.contains(&r.id))?;
        f.tried.push(candidate.id);
        trace!(
            "Volume group {} read attempt {} on {}",
            self.volume,
            f.tried.len(),
            candidate.id.short()
        );
        let request = ReplicaRequest {
            replica_version: candidate.version,
            hdr: f.hdr,
            message: ReplicaMessage::Io {
                msg_type: f.msg_type,
                payload: f.payload.clone(),
            },
        };
        Some(attempt(
            self.transport(),
            candidate.id,
            request,
            self.config.io_timeout(),
        ))
    }

    async fn drive_broadcast(
        self: Arc<Self>,
        mut request: GroupRequest,
        mut attempts: FuturesUnordered<Attempt>,
        generation: u64,
        mut generation_rx: watch::Receiver<u64>,
        _in_flight: InFlight,
    ) {
        loop {
            tokio::select! {
                next = attempts.next() => {
                    let Some((replica, version, reply)) = next else {
                        break;
                    };
                    if !self.on_reply(&mut request, replica, version, reply, generation) {
                        break;
                    }
                }
                _ = generation_rx.changed() => {
                    self.abandon(&mut request);
                    break;
                }
            }
        }
        request.fail_if_pending();
    }

    async fn drive_failover(
        self: Arc<Self>,
        mut request: GroupRequest,
        generation: u64,
        mut generation_rx: watch::Receiver<u64>,
        _in_flight: InFlight,
    ) {
        while let Some(next) = self.next_failover_attempt(&mut request, generation) {
            let (replica, version, reply) = tokio::select! {
                done = next => done,
                _ = generation_rx.changed() => {
                    self.abandon(&mut request);
                    break;
                }
            };
            if !self.on_reply(&mut request, replica, version, reply, generation) {
                break;
            }
        }
        request.fail_if_pending();
    }

    /// Start the periodic group-info push if replicas are down
    fn maybe_schedule_check(self: &Arc<Self>, st: &mut GroupState) {
        if st.check_scheduled || st.closing || st.closed || !st.mode.can_write() {
            return;
        }
        if !matches!(st.state, ResourceState::Active | ResourceState::Offline)
            || st.nonfunctional_count() == 0
        {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        st.check_scheduled = true;
        debug!(
            "Volume group {} scheduling check of {} non-functional replicas",
            self.volume,
            st.nonfunctional_count()
        );
        runtime.spawn(check_nonfunctional(
            Arc::downgrade(self),
            self.config.group_check_interval(),
        ));
    }
}

/// Push group info while replicas are down so recovered ones rejoin
async fn check_nonfunctional(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let (volume, attempts) = {
            let mut st = inner.state.lock();
            let running = matches!(st.state, ResourceState::Active | ResourceState::Offline);
            if st.closing || st.closed || !running || st.nonfunctional_count() == 0 {
                st.check_scheduled = false;
                return;
            }
            debug!(
                "Volume group {} has {} non-functional replicas, pushing group info",
                st.volume,
                st.nonfunctional_count()
            );
            let info = st.group_info();
            let hdr = st.hdr();
            let attempts: Vec<Attempt> = st
                .replicas
                .iter()
                .map(|r| {
                    let request = ReplicaRequest {
                        replica_version: r.version,
                        hdr,
                        message: ReplicaMessage::GroupInfoUpdate(info.clone()),
                    };
                    attempt(inner.transport(), r.id, request, inner.config.io_timeout())
                })
                .collect();
            (st.volume, attempts)
        };
        drop(inner);

        for (replica, _, reply) in join_all(attempts).await {
            if let Err(e) = reply.and_then(ReplicaReply::into_payload) {
                trace!("Group info push for {} to {} failed: {}", volume, replica.short(), e);
            }
        }
    }
}

/// Apply replay replies like write replies; a failed replay faults the replica
async fn settle_replays(inner: Weak<Inner>, replays: Vec<Replay>) {
    let replies = join_all(replays).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut st = inner.state.lock();
    let mut acks = SuccessAcks::new();
    for (replica, dispatched_version, hdr, msg_type, reply) in replies {
        let (replica_version, status) = match reply {
            Ok(reply) => (reply.replica_version, reply.into_payload()),
            Err(e) => (dispatched_version, Err(e)),
        };
        if let Err(e) = &status {
            debug!(
                "Volume group {} replay of op {} to {} failed: {}",
                inner.volume,
                hdr.op_id,
                replica.short(),
                e
            );
        }
        st.handle_volume_response(
            inner.deps.classifier.as_ref(),
            replica,
            replica_version,
            &hdr,
            msg_type,
            true,
            &status,
            &mut acks,
        );
    }
    inner.maybe_schedule_check(&mut st);
}

/// Handle to a volume group coordinator
#[derive(Clone)]
pub struct VolumeGroupCoordinator {
    inner: Arc<Inner>,
}

impl VolumeGroupCoordinator {
    /// Resolve the membership of `volume` and build a coordinator for it
    pub async fn create(
        volume: VolumeId,
        id: ServiceId,
        config: VolumeGroupConfig,
        deps: GroupDeps,
    ) -> Result<Self> {
        let membership = deps.membership.resolve(volume).await?;
        Self::with_membership(volume, id, config, deps, &membership)
    }

    /// Build a coordinator over an already resolved membership
    pub fn with_membership(
        volume: VolumeId,
        id: ServiceId,
        config: VolumeGroupConfig,
        deps: GroupDeps,
        membership: &GroupMembership,
    ) -> Result<Self> {
        let quorum = if membership.quorum_count > 0 {
            membership.quorum_count
        } else {
            config.quorum_count as usize
        };
        let mut replicas: Vec<ReplicaHandle> = membership
            .replicas
            .iter()
            .copied()
            .map(ReplicaHandle::new)
            .collect();
        replicas.sort_by_key(|r| r.id);
        replicas.dedup_by_key(|r| r.id);
        if replicas.is_empty() {
            return Err(Error::invalid_argument(format!(
                "volume {} has no replicas",
                volume
            )));
        }
        if quorum == 0 || quorum > replicas.len() {
            return Err(Error::invalid_argument(format!(
                "quorum {} invalid for {} replicas",
                quorum,
                replicas.len()
            )));
        }

        let (generation_tx, _) = watch::channel(0);
        let state = GroupState {
            volume,
            quorum,
            epoch: membership.epoch,
            state: ResourceState::Unknown,
            mode: AccessMode::ReadWrite,
            coordinator: CoordinatorInfo {
                id,
                version: VERSION_START,
            },
            group_version: VERSION_START,
            generation: 0,
            generation_tx,
            op_seq: OP_START_ID,
            commit_seq: COMMIT_START_ID,
            replicas,
            write_log: None,
            write_log_capacity: config.write_log_capacity,
            in_flight: 0,
            closing: false,
            closed: false,
            registered: false,
            check_scheduled: false,
        };
        debug!(
            "Volume group {} created with {} replicas, quorum {}",
            volume,
            state.replicas.len(),
            quorum
        );

        Ok(Self {
            inner: Arc::new(Inner {
                volume,
                config,
                deps,
                state: Mutex::new(state),
                drained: Notify::new(),
            }),
        })
    }

    /// Volume this group replicates
    #[must_use]
    pub fn volume(&self) -> VolumeId {
        self.inner.volume
    }

    /// Write quorum
    #[must_use]
    pub fn quorum(&self) -> usize {
        self.inner.state.lock().quorum
    }

    /// Current group state
    #[must_use]
    pub fn state(&self) -> ResourceState {
        self.inner.state.lock().state
    }

    #[must_use]
    pub fn group_version(&self) -> i64 {
        self.inner.state.lock().group_version
    }

    /// Last assigned op id
    #[must_use]
    pub fn last_op_id(&self) -> i64 {
        self.inner.state.lock().op_seq
    }

    /// Last assigned commit id
    #[must_use]
    pub fn last_commit_id(&self) -> i64 {
        self.inner.state.lock().commit_seq
    }

    /// Snapshot of one replica's bookkeeping
    #[must_use]
    pub fn replica(&self, replica: ServiceId) -> Option<ReplicaHandle> {
        let st = self.inner.state.lock();
        st.index_of(replica).map(|idx| st.replicas[idx].clone())
    }

    /// Current membership snapshot
    #[must_use]
    pub fn group_info(&self) -> VolumeGroupInfo {
        self.inner.state.lock().group_info()
    }

    /// Diagnostic export of the group state
    #[must_use]
    pub fn state_info(&self) -> serde_json::Value {
        self.inner.state.lock().state_info()
    }

    /// Open the group
    ///
    /// A `ReadWrite` open makes this handle the coordinator: replicas at the
    /// highest committed sequence become functional, lower ones syncing and
    /// silent ones non-functional. Fewer than quorum functional replicas
    /// fails the open with [`Error::GroupDown`].
    pub async fn open(&self, mode: AccessMode) -> Result<OpenedGroup> {
        let inner = &self.inner;
        let (attempts, generation, _in_flight) = {
            let mut st = inner.state.lock();
            if st.closing || st.closed {
                return Err(Error::Closed);
            }
            if st.state != ResourceState::Unknown {
                return Err(Error::invalid_argument(format!(
                    "volume group {} is already {}",
                    inner.volume, st.state
                )));
            }
            info!("Opening volume group {} ({:?})", inner.volume, mode);
            st.reset_for_open(mode);
            let in_flight = InFlight::new(inner, &mut st);
            let msg = OpenVolumeMsg {
                volume: inner.volume,
                mode,
                coordinator: st.coordinator,
            };
            let hdr = st.hdr();
            let attempts: Vec<Attempt> = st
                .replicas
                .iter()
                .map(|r| {
                    let request = ReplicaRequest {
                        replica_version: r.version,
                        hdr,
                        message: ReplicaMessage::OpenVolume(msg),
                    };
                    attempt(inner.transport(), r.id, request, inner.config.open_timeout())
                })
                .collect();
            (attempts, st.generation, in_flight)
        };

        let replies = join_all(attempts).await;

        let (sequence_id, attempts, generation) = {
            let mut st = inner.state.lock();
            if st.generation != generation || st.closing {
                return Err(Error::Closed);
            }
            let mut opened = Vec::new();
            let mut not_activated = 0;
            for (replica, _, reply) in replies {
                let Some(idx) = st.index_of(replica) else {
                    continue;
                };
                let reply = reply.and_then(|r| match r.result {
                    Ok(ReplyBody::Opened(open)) => Ok((r.replica_version, open)),
                    Ok(ReplyBody::Data(_)) => Err(Error::internal("unexpected reply to open")),
                    Err(e) => Err(e),
                });
                match reply {
                    Ok((version, open)) => opened.push((idx, version, open)),
                    Err(e) => {
                        if e == Error::NotActivated {
                            not_activated += 1;
                        }
                        warn!(
                            "Volume group {} open: replica {} failed: {}",
                            inner.volume,
                            replica.short(),
                            e
                        );
                        st.replicas[idx].last_error = Some(e);
                    }
                }
            }

            if !mode.can_write() {
                let sequence_id = st.finish_read_only_open(&opened, not_activated)?;
                info!(
                    "Volume group {} open read-only at sequence {}",
                    inner.volume, sequence_id
                );
                return Ok(OpenedGroup {
                    sequence_id,
                    group: st.group_info(),
                });
            }

            let sequence_id = st.finish_coordinator_open(&opened)?;
            let info = st.group_info();
            let hdr = st.hdr();
            let attempts: Vec<Attempt> = st
                .replicas
                .iter()
                .map(|r| {
                    let request = ReplicaRequest {
                        replica_version: r.version,
                        hdr,
                        message: ReplicaMessage::GroupInfoUpdate(info.clone()),
                    };
                    attempt(inner.transport(), r.id, request, inner.config.io_timeout())
                })
                .collect();
            (sequence_id, attempts, st.generation)
        };

        for (replica, _, reply) in join_all(attempts).await {
            if let Err(e) = reply.and_then(ReplicaReply::into_payload) {
                debug!(
                    "Volume group {} group info to {} failed: {}",
                    inner.volume,
                    replica.short(),
                    e
                );
            }
        }

        let (group, coordinator) = {
            let mut st = inner.state.lock();
            if st.generation != generation || st.closing {
                return Err(Error::Closed);
            }
            st.change_state(ResourceState::Active);
            inner.maybe_schedule_check(&mut st);
            info!(
                "Volume group {} open at sequence {}: {} functional, {} syncing, {} down",
                inner.volume,
                sequence_id,
                st.functional_count(),
                st.syncing_count(),
                st.nonfunctional_count()
            );
            (st.group_info(), st.coordinator)
        };

        match inner
            .deps
            .membership
            .set_coordinator(inner.volume, Some(coordinator))
            .await
        {
            Ok(()) => inner.state.lock().registered = true,
            Err(e) => warn!(
                "Volume group {} failed to register coordinator: {}",
                inner.volume, e
            ),
        }

        Ok(OpenedGroup { sequence_id, group })
    }

    /// Close the group
    ///
    /// New requests are rejected with [`Error::Closed`] right away; the call
    /// returns once every in-flight request has delivered its result.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut st = inner.state.lock();
            if st.closed {
                return Ok(());
            }
            if !st.closing {
                info!(
                    "Closing volume group {} ({} in flight)",
                    inner.volume, st.in_flight
                );
                st.closing = true;
            }
        }

        loop {
            let drained = inner.drained.notified();
            if inner.state.lock().in_flight == 0 {
                break;
            }
            drained.await;
        }

        let registered = {
            let mut st = inner.state.lock();
            if st.closed {
                return Ok(());
            }
            st.change_state(ResourceState::Unknown);
            st.write_log = None;
            st.closed = true;
            std::mem::take(&mut st.registered)
        };
        if registered {
            if let Err(e) = inner
                .deps
                .membership
                .set_coordinator(inner.volume, None)
                .await
            {
                warn!(
                    "Volume group {} failed to clear coordinator: {}",
                    inner.volume, e
                );
            }
        }
        info!("Volume group {} closed", inner.volume);
        Ok(())
    }

    /// Submit a read; fails over across functional replicas
    pub fn submit_read(&self, msg_type: MsgType, payload: Bytes) -> OpTicket {
        let inner = &self.inner;
        let (tx, rx) = oneshot::channel();
        let ticket = OpTicket { rx };

        let mut st = inner.state.lock();
        if let Err(e) = st.check_access(false) {
            drop(st);
            debug!("Volume group {} rejected {}: {}", inner.volume, msg_type, e);
            let _ = tx.send(Err(e));
            return ticket;
        }
        let request = GroupRequest::Failover(FailoverRequest::new(msg_type, st.hdr(), payload, tx));
        let generation = st.generation;
        let generation_rx = st.generation_tx.subscribe();
        let in_flight = InFlight::new(inner, &mut st);
        drop(st);

        tokio::spawn(Arc::clone(inner).drive_failover(
            request,
            generation,
            generation_rx,
            in_flight,
        ));
        ticket
    }

    /// Submit a write that advances the op id only
    pub fn submit_write(&self, msg_type: MsgType, payload: Bytes) -> OpTicket {
        self.submit_broadcast(msg_type, payload, false, 0)
    }

    /// Submit a write that advances both op and commit ids
    pub fn submit_modify(&self, msg_type: MsgType, payload: Bytes) -> OpTicket {
        self.submit_broadcast(msg_type, payload, true, 0)
    }

    /// Submit a commit stamped with a client sequence id
    ///
    /// Callers ordering commits through a sequencer must keep their sequence
    /// guard until this returns: the request is admitted to every replica
    /// before it does.
    pub fn submit_commit(&self, msg_type: MsgType, payload: Bytes, sequence_id: i64) -> OpTicket {
        self.submit_broadcast(msg_type, payload, true, sequence_id)
    }

    fn submit_broadcast(
        &self,
        msg_type: MsgType,
        payload: Bytes,
        commit: bool,
        sequence_id: i64,
    ) -> OpTicket {
        let inner = &self.inner;
        let (tx, rx) = oneshot::channel();
        let ticket = OpTicket { rx };

        let mut st = inner.state.lock();
        if let Err(e) = st.check_access(true) {
            drop(st);
            debug!("Volume group {} rejected {}: {}", inner.volume, msg_type, e);
            let _ = tx.send(Err(e));
            return ticket;
        }

        st.op_seq += 1;
        if commit {
            st.commit_seq += 1;
        }
        let mut hdr = st.hdr();
        hdr.sequence_id = sequence_id;
        st.log_write(WriteLogEntry {
            op_id: hdr.op_id,
            hdr,
            msg_type,
            payload: payload.clone(),
        });

        let targets = st.writable_targets();
        let attempts: FuturesUnordered<Attempt> = targets
            .iter()
            .map(|&(replica, version)| {
                let request = ReplicaRequest {
                    replica_version: version,
                    hdr,
                    message: ReplicaMessage::Io {
                        msg_type,
                        payload: payload.clone(),
                    },
                };
                attempt(inner.transport(), replica, request, inner.config.io_timeout())
            })
            .collect();
        trace!(
            "Volume group {} op {} commit {} {} to {} replicas",
            inner.volume,
            hdr.op_id,
            hdr.commit_id,
            msg_type,
            targets.len()
        );

        let request = GroupRequest::Broadcast(BroadcastRequest::new(
            msg_type, hdr, st.quorum, &targets, tx,
        ));
        let generation = st.generation;
        let generation_rx = st.generation_tx.subscribe();
        let in_flight = InFlight::new(inner, &mut st);
        drop(st);

        tokio::spawn(Arc::clone(inner).drive_broadcast(
            request,
            attempts,
            generation,
            generation_rx,
            in_flight,
        ));
        ticket
    }

    /// Read through the group
    pub async fn send_read_msg(&self, msg_type: MsgType, payload: Bytes) -> Result<Bytes> {
        self.submit_read(msg_type, payload).await
    }

    /// Replicate a write that advances the op id only
    pub async fn send_write_msg(&self, msg_type: MsgType, payload: Bytes) -> Result<Bytes> {
        self.submit_write(msg_type, payload).await
    }

    /// Replicate a write that also advances the commit id
    pub async fn send_modify_msg(&self, msg_type: MsgType, payload: Bytes) -> Result<Bytes> {
        self.submit_modify(msg_type, payload).await
    }

    /// Replicate a commit stamped with `sequence_id`
    pub async fn send_commit_msg(
        &self,
        msg_type: MsgType,
        payload: Bytes,
        sequence_id: i64,
    ) -> Result<Bytes> {
        self.submit_commit(msg_type, payload, sequence_id).await
    }

    /// Apply a replica reply received outside the coordinator's own request
    /// path; acks from functional replicas are appended to `acks`
    #[allow(clippy::too_many_arguments)]
    pub fn handle_volume_response(
        &self,
        replica: ServiceId,
        replica_version: i64,
        hdr: &VolumeIoHdr,
        msg_type: MsgType,
        is_write: bool,
        status: &Result<Bytes>,
        acks: &mut SuccessAcks,
    ) {
        let mut st = self.inner.state.lock();
        st.handle_volume_response(
            self.inner.deps.classifier.as_ref(),
            replica,
            replica_version,
            hdr,
            msg_type,
            is_write,
            status,
            acks,
        );
        self.inner.maybe_schedule_check(&mut st);
    }

    /// Replay buffered writes with op id `>= from_op_id` to `replica`
    ///
    /// Returns false if the range is no longer retained (or the replica is
    /// unknown); the replica then needs a full resync.
    pub fn replay_from_write_log(&self, replica: ServiceId, from_op_id: i64) -> bool {
        let inner = &self.inner;
        let attempts = {
            let st = inner.state.lock();
            let Some(idx) = st.index_of(replica) else {
                return false;
            };
            let Some(log) = st.write_log.as_ref() else {
                return false;
            };
            let entries: Vec<WriteLogEntry> = match log.entries_from(from_op_id) {
                Ok(entries) => entries.cloned().collect(),
                Err(e) => {
                    info!("Volume group {} cannot replay to {}: {}", inner.volume, replica.short(), e);
                    return false;
                }
            };
            st.replay_attempts(inner.transport(), idx, entries, inner.config.io_timeout())
        };
        if !attempts.is_empty() {
            tokio::spawn(settle_replays(Arc::downgrade(inner), attempts));
        }
        true
    }

    /// Handle a replica's request to (re)join the group
    pub async fn handle_add_to_volume_group(
        &self,
        msg: AddToVolumeGroupMsg,
    ) -> AddToVolumeGroupReply {
        let inner = &self.inner;
        let unknown = {
            let st = inner.state.lock();
            st.mode.can_write() && st.index_of(msg.replica).is_none()
        };
        if unknown {
            self.discover_replica(msg.replica).await;
        }

        let (status, attempts, group) = {
            let mut st = inner.state.lock();
            let (status, attempts) =
                match st.add_to_group(inner.transport(), &msg, inner.config.io_timeout()) {
                    Ok(attempts) => (Ok(()), attempts),
                    Err(e) => {
                        warn!(
                            "Volume group {} rejected {} join of {}: {}",
                            inner.volume,
                            msg.target_state,
                            msg.replica.short(),
                            e
                        );
                        (Err(e), Vec::new())
                    }
                };
            inner.maybe_schedule_check(&mut st);
            (status, attempts, st.group_info())
        };
        if !attempts.is_empty() {
            tokio::spawn(settle_replays(Arc::downgrade(inner), attempts));
        }
        AddToVolumeGroupReply { status, group }
    }

    /// Re-resolve membership and track `replica` if it was placed here
    async fn discover_replica(&self, replica: ServiceId) {
        let inner = &self.inner;
        match inner.deps.membership.resolve(inner.volume).await {
            Ok(membership) if membership.replicas.contains(&replica) => {
                let mut st = inner.state.lock();
                if st.index_of(replica).is_none() {
                    info!(
                        "Volume group {} discovered replica {}",
                        inner.volume,
                        replica.short()
                    );
                    st.replicas.push(ReplicaHandle::new(replica));
                    st.replicas.sort_by_key(|r| r.id);
                    st.epoch = membership.epoch;
                    st.group_version += 1;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(
                "Volume group {} membership lookup failed: {}",
                inner.volume, e
            ),
        }
    }
}

impl std::fmt::Debug for VolumeGroupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeGroupCoordinator")
            .field("volume", &self.inner.volume)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCluster, ReplicaBehavior};

    const VOLUME: VolumeId = VolumeId::new(7);

    fn config() -> VolumeGroupConfig {
        VolumeGroupConfig {
            io_timeout_ms: 200,
            open_timeout_ms: 200,
            ..VolumeGroupConfig::default()
        }
    }

    async fn coordinator(cluster: &Arc<MemoryCluster>, config: VolumeGroupConfig) -> VolumeGroupCoordinator {
        cluster.create_volume(VOLUME);
        let deps = GroupDeps::new(cluster.clone(), cluster.clone());
        VolumeGroupCoordinator::create(VOLUME, ServiceId::from_u128(1000), config, deps)
            .await
            .unwrap()
    }

    async fn open_cluster(
        replicas: usize,
        quorum: usize,
    ) -> (Arc<MemoryCluster>, VolumeGroupCoordinator) {
        let cluster = MemoryCluster::new(replicas, quorum);
        let group = coordinator(&cluster, config()).await;
        group.open(AccessMode::ReadWrite).await.unwrap();
        (cluster, group)
    }

    fn put(key: &str, value: &str) -> Bytes {
        Bytes::from(format!("{}={}", key, value))
    }

    #[tokio::test]
    async fn test_open_all_healthy() {
        let cluster = MemoryCluster::new(3, 2);
        let group = coordinator(&cluster, config()).await;
        assert_eq!(group.state(), ResourceState::Unknown);

        let opened = group.open(AccessMode::ReadWrite).await.unwrap();
        assert_eq!(opened.sequence_id, COMMIT_START_ID);
        assert_eq!(opened.group.functional.len(), 3);
        assert_eq!(group.state(), ResourceState::Active);
        assert_eq!(group.last_op_id(), OP_START_ID);

        let registered = cluster.coordinator(VOLUME).unwrap();
        assert_eq!(registered.id, ServiceId::from_u128(1000));
    }

    #[tokio::test]
    async fn test_open_twice_rejected() {
        let (_cluster, group) = open_cluster(3, 2).await;
        let err = group.open(AccessMode::ReadWrite).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_open_below_quorum_fails() {
        let cluster = MemoryCluster::new(3, 2);
        let ids = cluster.replica_ids();
        cluster.set_behavior(ids[0], ReplicaBehavior::Offline);
        cluster.set_behavior(ids[1], ReplicaBehavior::Offline);
        let group = coordinator(&cluster, config()).await;

        let err = group.open(AccessMode::ReadWrite).await.unwrap_err();
        assert_eq!(err, Error::GroupDown);
        assert_eq!(group.state(), ResourceState::Unknown);
        assert!(cluster.coordinator(VOLUME).is_none());

        // Recovered replicas allow a retry
        cluster.set_behavior(ids[0], ReplicaBehavior::Healthy);
        assert!(group.open(AccessMode::ReadWrite).await.is_ok());
    }

    #[tokio::test]
    async fn test_open_partitions_by_sequence() {
        let cluster = MemoryCluster::new(3, 2);
        let ids = cluster.replica_ids();
        cluster.create_volume(VOLUME);
        cluster.seed_commit(ids[0], VOLUME, 5);
        cluster.seed_commit(ids[1], VOLUME, 5);
        cluster.seed_commit(ids[2], VOLUME, 3);
        let group = coordinator(&cluster, config()).await;

        let opened = group.open(AccessMode::ReadWrite).await.unwrap();
        assert_eq!(opened.sequence_id, 5);
        assert_eq!(opened.group.functional, vec![ids[0], ids[1]]);
        assert_eq!(opened.group.syncing, vec![ids[2]]);
        assert_eq!(group.last_commit_id(), 5);

        // Syncing replicas receive writes without counting toward quorum
        group.send_modify_msg(MsgType::SetVolumeMetadata, put("k", "v")).await.unwrap();
        assert_eq!(group.last_commit_id(), 6);
        assert_eq!(cluster.applied_op_id(ids[2], VOLUME), 1);
    }

    #[tokio::test]
    async fn test_writes_are_totally_ordered() {
        let (cluster, group) = open_cluster(3, 2).await;
        let tickets: Vec<OpTicket> = (0..10)
            .map(|i| group.submit_write(MsgType::UpdateCatalogOnce, put(&format!("k{}", i), "v")))
            .collect();
        for ticket in tickets {
            ticket.await.unwrap();
        }
        assert_eq!(group.last_op_id(), 10);

        for replica in cluster.replica_ids() {
            assert_eq!(cluster.applied_op_id(replica, VOLUME), 10);
            let ops: Vec<i64> = cluster
                .dispatched()
                .into_iter()
                .filter(|d| d.replica == replica && d.msg_type == MsgType::UpdateCatalogOnce)
                .map(|d| d.hdr.op_id)
                .collect();
            assert_eq!(ops, (1..=10).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_minority_fault_keeps_group_active() {
        let (cluster, group) = open_cluster(3, 2).await;
        let faulty = cluster.replica_ids()[2];
        let version = group.replica(faulty).unwrap().version;
        cluster.set_behavior(faulty, ReplicaBehavior::FailWith(Error::transport("disk gone")));

        group.send_write_msg(MsgType::UpdateCatalog, put("a", "1")).await.unwrap();
        group.close().await.unwrap();

        let handle = group.replica(faulty).unwrap();
        assert_eq!(handle.state, ResourceState::Offline);
        assert_eq!(handle.version, version + 1);
        assert!(handle.last_error.is_some());
    }

    #[tokio::test]
    async fn test_quorum_loss_fails_write_and_takes_group_offline() {
        let (cluster, group) = open_cluster(3, 2).await;
        let ids = cluster.replica_ids();
        cluster.set_behavior(ids[1], ReplicaBehavior::Offline);
        cluster.set_behavior(ids[2], ReplicaBehavior::Offline);

        let err = group.send_write_msg(MsgType::UpdateCatalog, put("a", "1")).await.unwrap_err();
        assert!(matches!(err, Error::ReplicaUnavailable(_)));
        assert_eq!(group.state(), ResourceState::Offline);

        // Writes are refused without contacting replicas
        let before = cluster.dispatched().len();
        let err = group.send_write_msg(MsgType::UpdateCatalog, put("b", "1")).await.unwrap_err();
        assert_eq!(err, Error::GroupDown);
        assert_eq!(cluster.dispatched().len(), before);

        // Reads are still served by the remaining functional replica
        let data = group.send_read_msg(MsgType::GetBlobMetadata, Bytes::from("a")).await.unwrap();
        assert_eq!(data, Bytes::from("1"));
    }

    #[tokio::test]
    async fn test_logical_errors_do_not_fault() {
        let (cluster, group) = open_cluster(3, 2).await;
        for replica in cluster.replica_ids() {
            cluster.set_behavior(replica, ReplicaBehavior::FailWith(Error::BlobNotFound("x".into())));
        }
        let err = group.send_write_msg(MsgType::DeleteBlob, Bytes::from("x")).await.unwrap_err();
        assert_eq!(err, Error::BlobNotFound("x".into()));
        assert_eq!(group.state(), ResourceState::Active);
        assert_eq!(group.group_info().functional.len(), 3);
    }

    #[tokio::test]
    async fn test_unresponsive_replica_times_out() {
        let (cluster, group) = open_cluster(3, 2).await;
        let slow = cluster.replica_ids()[0];
        cluster.set_behavior(slow, ReplicaBehavior::Unresponsive);

        group.send_write_msg(MsgType::UpdateCatalog, put("a", "1")).await.unwrap();
        group.close().await.unwrap();
        assert_eq!(group.replica(slow).unwrap().last_error, Some(Error::Timeout));
    }

    #[tokio::test]
    async fn test_stale_response_is_ignored() {
        let (cluster, group) = open_cluster(3, 2).await;
        let replica = cluster.replica_ids()[0];
        let handle = group.replica(replica).unwrap();
        let version_before = group.group_version();

        let mut acks = Vec::new();
        let mut hdr = VolumeIoHdr::new(VOLUME, version_before);
        hdr.op_id = 1;
        group.handle_volume_response(
            replica,
            handle.version - 1,
            &hdr,
            MsgType::UpdateCatalog,
            true,
            &Err(Error::Timeout),
            &mut acks,
        );
        assert!(acks.is_empty());
        assert!(group.replica(replica).unwrap().is_functional());
        assert_eq!(group.group_version(), version_before);

        group.handle_volume_response(
            replica,
            handle.version,
            &hdr,
            MsgType::UpdateCatalog,
            true,
            &Ok(Bytes::new()),
            &mut acks,
        );
        assert_eq!(acks.len(), 1);
        assert_eq!(group.replica(replica).unwrap().applied_op_id, 1);
    }

    #[tokio::test]
    async fn test_reply_for_old_group_version_is_dropped() {
        let (cluster, group) = open_cluster(3, 2).await;
        let ids = cluster.replica_ids();
        cluster.set_behavior(ids[1], ReplicaBehavior::StaleGroupVersion);
        cluster.set_behavior(ids[2], ReplicaBehavior::StaleGroupVersion);

        // One usable ack is short of the quorum
        let err = group.send_write_msg(MsgType::UpdateCatalog, put("a", "1")).await.unwrap_err();
        assert_eq!(err, Error::GroupDown);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(group.replica(ids[0]).unwrap().applied_op_id, 1);
        for &replica in &ids[1..] {
            // Applied on the replica, but never credited by the group
            assert_eq!(cluster.applied_op_id(replica, VOLUME), 1);
            let handle = group.replica(replica).unwrap();
            assert_eq!(handle.applied_op_id, OP_START_ID);
            assert!(handle.is_functional());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_after_timeout_is_not_counted() {
        let (cluster, group) = open_cluster(3, 2).await;
        let slow = cluster.replica_ids()[2];
        let version = group.replica(slow).unwrap().version;
        cluster.set_behavior(slow, ReplicaBehavior::Delayed(Duration::from_secs(1)));

        group.send_write_msg(MsgType::UpdateCatalog, put("a", "1")).await.unwrap();
        // Past both the io timeout and the delayed reply
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(cluster.applied_op_id(slow, VOLUME), 1);
        let handle = group.replica(slow).unwrap();
        assert_eq!(handle.last_error, Some(Error::Timeout));
        assert_eq!(handle.version, version + 1);
        assert_eq!(handle.applied_op_id, OP_START_ID);
        assert!(handle.is_nonfunctional());
        assert_eq!(group.last_op_id(), 1);
    }

    #[tokio::test]
    async fn test_offline_replica_rejoins_with_replay() {
        let cluster = MemoryCluster::new(3, 2);
        let ids = cluster.replica_ids();
        let c = ids[2];
        cluster.set_behavior(c, ReplicaBehavior::Offline);
        let group = coordinator(&cluster, config()).await;

        let opened = group.open(AccessMode::ReadWrite).await.unwrap();
        assert_eq!(opened.group.nonfunctional, vec![c]);

        group.send_write_msg(MsgType::UpdateCatalog, put("w", "1")).await.unwrap();
        assert_eq!(cluster.applied_op_id(ids[0], VOLUME), 1);
        assert_eq!(cluster.applied_op_id(ids[1], VOLUME), 1);
        assert_eq!(cluster.applied_op_id(c, VOLUME), OP_START_ID);

        cluster.set_behavior(c, ReplicaBehavior::Healthy);
        cluster.rejoin(c, &group).await.unwrap();

        assert_eq!(cluster.applied_op_id(c, VOLUME), 1);
        assert_eq!(cluster.blob(c, VOLUME, "w"), Some(Bytes::from("1")));
        assert!(group.replica(c).unwrap().is_functional());
        assert_eq!(group.group_info().functional.len(), 3);
    }

    #[tokio::test]
    async fn test_undelivered_replay_blocks_activation() {
        let cluster = MemoryCluster::new(3, 2);
        let ids = cluster.replica_ids();
        let c = ids[0];
        cluster.set_behavior(c, ReplicaBehavior::Offline);
        let group = coordinator(&cluster, config()).await;
        group.open(AccessMode::ReadWrite).await.unwrap();
        group.send_write_msg(MsgType::UpdateCatalog, put("w", "1")).await.unwrap();

        let version = group.replica(c).unwrap().version + 1;
        let mut msg = AddToVolumeGroupMsg {
            group_id: VOLUME,
            replica: c,
            replica_version: version,
            target_state: ResourceState::Loading,
            last_op_id: OP_START_ID,
            last_commit_id: COMMIT_START_ID,
        };
        group.handle_add_to_volume_group(msg).await.status.unwrap();
        // Still unreachable, so the replay of op 1 never arrives
        msg.target_state = ResourceState::Syncing;
        group.handle_add_to_volume_group(msg).await.status.unwrap();
        assert!(group.replica(c).unwrap().is_syncing());

        msg.target_state = ResourceState::Active;
        let status = group.handle_add_to_volume_group(msg).await.status;
        assert!(matches!(status, Err(Error::NotReady(_))), "{:?}", status);

        // The failed replay takes the replica offline again
        tokio::time::sleep(Duration::from_millis(10)).await;
        let handle = group.replica(c).unwrap();
        assert!(handle.is_nonfunctional());
        assert_eq!(handle.version, version + 1);
        assert!(matches!(handle.last_error, Some(Error::ReplicaUnavailable(_))));
        assert_eq!(group.group_info().functional, vec![ids[1], ids[2]]);

        cluster.set_behavior(c, ReplicaBehavior::Healthy);
        let data = group.send_read_msg(MsgType::GetBlobMetadata, Bytes::from("w")).await.unwrap();
        assert_eq!(data, Bytes::from("1"));
    }

    #[tokio::test]
    async fn test_activation_requires_reported_op_id() {
        let cluster = MemoryCluster::new(3, 2);
        let c = cluster.replica_ids()[2];
        cluster.set_behavior(c, ReplicaBehavior::Offline);
        let group = coordinator(&cluster, config()).await;
        group.open(AccessMode::ReadWrite).await.unwrap();
        group.send_write_msg(MsgType::UpdateCatalog, put("a", "1")).await.unwrap();
        group.send_write_msg(MsgType::UpdateCatalog, put("b", "2")).await.unwrap();
        cluster.set_behavior(c, ReplicaBehavior::Healthy);

        let mut msg = AddToVolumeGroupMsg {
            group_id: VOLUME,
            replica: c,
            replica_version: group.replica(c).unwrap().version + 1,
            target_state: ResourceState::Loading,
            last_op_id: OP_START_ID,
            last_commit_id: COMMIT_START_ID,
        };
        group.handle_add_to_volume_group(msg).await.status.unwrap();
        msg.target_state = ResourceState::Syncing;
        group.handle_add_to_volume_group(msg).await.status.unwrap();
        assert_eq!(cluster.applied_op_id(c, VOLUME), 2);

        msg.target_state = ResourceState::Active;
        msg.last_op_id = 1;
        let status = group.handle_add_to_volume_group(msg).await.status;
        assert!(matches!(status, Err(Error::NotReady(_))), "{:?}", status);
        assert!(group.replica(c).unwrap().is_syncing());

        msg.last_op_id = 2;
        group.handle_add_to_volume_group(msg).await.status.unwrap();
        assert!(group.replica(c).unwrap().is_functional());
    }

    #[tokio::test]
    async fn test_syncing_version_never_goes_backwards() {
        let (cluster, group) = open_cluster(3, 2).await;
        let c = cluster.replica_ids()[2];
        let start = group.replica(c).unwrap().version;
        let mut msg = AddToVolumeGroupMsg {
            group_id: VOLUME,
            replica: c,
            replica_version: start,
            target_state: ResourceState::Loading,
            last_op_id: OP_START_ID,
            last_commit_id: COMMIT_START_ID,
        };
        // Reloading a working replica retires its version
        group.handle_add_to_volume_group(msg).await.status.unwrap();
        assert_eq!(group.replica(c).unwrap().version, start + 1);

        msg.target_state = ResourceState::Syncing;
        msg.replica_version = start + 1;
        group.handle_add_to_volume_group(msg).await.status.unwrap();
        msg.target_state = ResourceState::Loading;
        group.handle_add_to_volume_group(msg).await.status.unwrap();
        assert_eq!(group.replica(c).unwrap().version, start + 2);

        msg.target_state = ResourceState::Syncing;
        let status = group.handle_add_to_volume_group(msg).await.status;
        assert_eq!(
            status,
            Err(Error::InvalidVersion {
                expected: start + 2,
                actual: start + 1
            })
        );
        // Rejoining at the current version is allowed
        msg.replica_version = start + 2;
        group.handle_add_to_volume_group(msg).await.status.unwrap();
        assert!(group.replica(c).unwrap().is_syncing());
    }

    #[tokio::test]
    async fn test_rejoin_outside_window_requires_resync() {
        let cluster = MemoryCluster::new(3, 2);
        let c = cluster.replica_ids()[2];
        cluster.set_behavior(c, ReplicaBehavior::Offline);
        let group = coordinator(
            &cluster,
            VolumeGroupConfig {
                write_log_capacity: 4,
                ..config()
            },
        )
        .await;
        group.open(AccessMode::ReadWrite).await.unwrap();
        for i in 0..10 {
            group.send_write_msg(MsgType::UpdateCatalog, put(&format!("k{}", i), "v")).await.unwrap();
        }

        cluster.set_behavior(c, ReplicaBehavior::Healthy);
        let err = cluster.rejoin(c, &group).await.unwrap_err();
        assert!(matches!(err, Error::ResyncRequired { requested: 1, oldest: 7, latest: 10 }));
        assert!(group.replica(c).unwrap().is_nonfunctional());
    }

    #[tokio::test]
    async fn test_replay_window_eligibility() {
        let (cluster, group) = {
            let cluster = MemoryCluster::new(3, 2);
            let group = coordinator(
                &cluster,
                VolumeGroupConfig {
                    write_log_capacity: 4,
                    ..config()
                },
            )
            .await;
            group.open(AccessMode::ReadWrite).await.unwrap();
            (cluster, group)
        };
        for i in 0..10 {
            group.send_write_msg(MsgType::UpdateCatalog, put(&format!("k{}", i), "v")).await.unwrap();
        }
        let replica = cluster.replica_ids()[0];
        for applied in 0..=10 {
            assert_eq!(
                group.replay_from_write_log(replica, applied + 1),
                applied >= 10 - 4,
                "applied op {}",
                applied
            );
        }
    }

    #[tokio::test]
    async fn test_read_fails_over_in_replica_order() {
        let (cluster, group) = open_cluster(3, 2).await;
        let ids = cluster.replica_ids();
        group.send_write_msg(MsgType::UpdateCatalog, put("blob", "data")).await.unwrap();

        cluster.set_behavior(ids[0], ReplicaBehavior::Offline);
        let data = group.send_read_msg(MsgType::GetBlobMetadata, Bytes::from("blob")).await.unwrap();
        assert_eq!(data, Bytes::from("data"));

        let reads: Vec<ServiceId> = cluster
            .dispatched()
            .into_iter()
            .filter(|d| d.msg_type == MsgType::GetBlobMetadata)
            .map(|d| d.replica)
            .collect();
        assert_eq!(reads, vec![ids[0], ids[1]]);
        assert!(group.replica(ids[0]).unwrap().is_nonfunctional());
        assert_eq!(group.state(), ResourceState::Active);
    }

    #[tokio::test]
    async fn test_access_checks() {
        let cluster = MemoryCluster::new(3, 2);
        let group = coordinator(&cluster, config()).await;
        let err = group.send_write_msg(MsgType::UpdateCatalog, put("a", "1")).await.unwrap_err();
        assert_eq!(err, Error::GroupNotOpen);
        assert!(cluster.dispatched().is_empty());

        let reader = coordinator(&cluster, config()).await;
        // Volume has never been opened by a coordinator
        let err = reader.open(AccessMode::ReadOnly).await.unwrap_err();
        assert_eq!(err, Error::NotActivated);

        group.open(AccessMode::ReadWrite).await.unwrap();
        let opened = reader.open(AccessMode::ReadOnly).await.unwrap();
        assert_eq!(opened.group.functional.len(), 3);
        let err = reader.send_write_msg(MsgType::UpdateCatalog, put("a", "1")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let reply = reader
            .handle_add_to_volume_group(AddToVolumeGroupMsg {
                group_id: VOLUME,
                replica: cluster.replica_ids()[0],
                replica_version: VERSION_START,
                target_state: ResourceState::Loading,
                last_op_id: 0,
                last_commit_id: 0,
            })
            .await;
        assert_eq!(reply.status, Err(Error::InvalidCoordinator));
    }

    #[tokio::test]
    async fn test_add_unknown_replica_rejected() {
        let (_cluster, group) = open_cluster(3, 2).await;
        let reply = group
            .handle_add_to_volume_group(AddToVolumeGroupMsg {
                group_id: VOLUME,
                replica: ServiceId::from_u128(999),
                replica_version: VERSION_START,
                target_state: ResourceState::Syncing,
                last_op_id: 0,
                last_commit_id: 0,
            })
            .await;
        assert!(matches!(reply.status, Err(Error::InvalidArgument(_))));
        assert_eq!(reply.group.functional.len(), 3);
    }

    #[tokio::test]
    async fn test_close_drains_in_flight() {
        let (cluster, group) = open_cluster(3, 2).await;
        for replica in cluster.replica_ids() {
            cluster.set_behavior(replica, ReplicaBehavior::Delayed(Duration::from_millis(50)));
        }
        let ticket = group.submit_write(MsgType::UpdateCatalog, put("a", "1"));
        group.close().await.unwrap();

        assert!(ticket.await.is_ok());
        assert_eq!(group.state(), ResourceState::Unknown);
        assert!(cluster.coordinator(VOLUME).is_none());

        // Idempotent, and later requests are refused
        group.close().await.unwrap();
        let err = group.send_read_msg(MsgType::StatVolume, Bytes::new()).await.unwrap_err();
        assert_eq!(err, Error::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_check_pushes_group_info() {
        let cluster = MemoryCluster::new(3, 2);
        let c = cluster.replica_ids()[2];
        cluster.set_behavior(c, ReplicaBehavior::Offline);
        let group = coordinator(&cluster, config()).await;
        group.open(AccessMode::ReadWrite).await.unwrap();

        let pushes = |cluster: &MemoryCluster| {
            cluster
                .dispatched()
                .iter()
                .filter(|d| d.replica == c && d.msg_type == MsgType::GroupInfoUpdate)
                .count()
        };
        let after_open = pushes(&cluster);
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert!(pushes(&cluster) >= after_open + 2);

        cluster.set_behavior(c, ReplicaBehavior::Healthy);
        cluster.rejoin(c, &group).await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        let settled = pushes(&cluster);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(pushes(&cluster), settled);
    }

    #[tokio::test]
    async fn test_state_info_export() {
        let (_cluster, group) = open_cluster(3, 2).await;
        group.send_modify_msg(MsgType::SetVolumeMetadata, put("m", "1")).await.unwrap();

        let info = group.state_info();
        assert_eq!(info["state"], "Active");
        assert_eq!(info["quorum"], 2);
        assert_eq!(info["functional"], 3);
        assert_eq!(info["op_id"], 1);
        assert_eq!(info["sequence_id"], 1);
        assert_eq!(info["write_log"]["len"], 1);
        assert_eq!(info["replicas"].as_array().unwrap().len(), 3);
    }
}
