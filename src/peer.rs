//! Per-remote-member runtime state.

use std::any::Any;
use std::time::Duration;
use std::time::Instant;

use crate::membership::Member;
use crate::NodeId;

/// The snapshot-transfer context attached to a peer while a snapshot is being
/// shipped to it.
///
/// It owns an opaque application context that must be handed back through
/// `StateMachine::release_snapshot_ctx` by whichever path first decides the
/// peer is no longer joining. Dropping it with the context still inside is
/// reported, never silent.
pub struct SnapshotSyncContext {
    /// The byte offset the transfer has reached.
    pub offset: u64,
    user_ctx: Option<Box<dyn Any + Send>>,
}

impl SnapshotSyncContext {
    /// Create a new context owning the given application snapshot context.
    pub fn new(user_ctx: Box<dyn Any + Send>) -> Self {
        Self {
            offset: 0,
            user_ctx: Some(user_ctx),
        }
    }

    /// Take the owned application context out, leaving none behind.
    pub fn take_user_ctx(&mut self) -> Option<Box<dyn Any + Send>> {
        self.user_ctx.take()
    }
}

impl Drop for SnapshotSyncContext {
    fn drop(&mut self) {
        if self.user_ctx.is_some() {
            tracing::warn!("snapshot user context dropped without being released through the state machine");
        }
    }
}

impl std::fmt::Debug for SnapshotSyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotSyncContext")
            .field("offset", &self.offset)
            .field("has_user_ctx", &self.user_ctx.is_some())
            .finish()
    }
}

/// Runtime state for one remote cluster member.
///
/// A peer is created when a member is discovered through a configuration or a
/// join request, and destroyed only after it has been removed from the active
/// peer set. A pending-join peer is owned by the coordinator until it is
/// admitted into the peer set or abandoned.
#[derive(Debug)]
pub struct Peer {
    member: Member,
    /// The next log index expected to be sent to this peer.
    next_log_index: u64,
    /// The highest log index known to be replicated on this peer.
    matched_index: u64,
    /// Set once the peer has been instructed to leave the cluster.
    leave_pending: bool,
    heartbeat_enabled: bool,
    /// Heartbeats are slowed while a bulk transfer is in flight.
    heartbeat_slowed: bool,
    last_active: Instant,
    snapshot_ctx: Option<SnapshotSyncContext>,
}

impl Peer {
    /// Create a new peer handle for the given member.
    pub fn new(member: Member) -> Self {
        Self {
            member,
            next_log_index: 1,
            matched_index: 0,
            leave_pending: false,
            heartbeat_enabled: true,
            heartbeat_slowed: false,
            last_active: Instant::now(),
            snapshot_ctx: None,
        }
    }

    /// The peer's node ID.
    pub fn id(&self) -> NodeId {
        self.member.id
    }

    /// The peer's member descriptor.
    pub fn member(&self) -> &Member {
        &self.member
    }

    /// The peer's network endpoint.
    pub fn endpoint(&self) -> &str {
        &self.member.endpoint
    }

    /// The next log index expected to be sent to this peer.
    pub fn next_log_index(&self) -> u64 {
        self.next_log_index
    }

    pub(crate) fn set_next_log_index(&mut self, idx: u64) {
        self.next_log_index = idx;
    }

    /// The highest log index known to be replicated on this peer.
    pub fn matched_index(&self) -> u64 {
        self.matched_index
    }

    pub(crate) fn set_matched_index(&mut self, idx: u64) {
        self.matched_index = idx;
    }

    /// Mark the peer as instructed to leave the cluster.
    ///
    /// Deliberately leaves the activity clock alone: remove requests may be
    /// repeated and must not restart liveness tracking.
    pub(crate) fn mark_leaving(&mut self) {
        self.leave_pending = true;
    }

    /// Whether the peer has been instructed to leave.
    pub fn is_leaving(&self) -> bool {
        self.leave_pending
    }

    /// Stop normal replication traffic to this peer, ahead of removing it
    /// from the configuration.
    pub(crate) fn step_down(&mut self) {
        self.leave_pending = true;
        self.heartbeat_enabled = false;
    }

    pub(crate) fn enable_heartbeat(&mut self, enable: bool) {
        self.heartbeat_enabled = enable;
    }

    /// Whether the heartbeat path may talk to this peer.
    pub fn is_heartbeat_enabled(&self) -> bool {
        self.heartbeat_enabled
    }

    pub(crate) fn slow_heartbeat(&mut self) {
        self.heartbeat_slowed = true;
    }

    /// Restore the normal heartbeat cadence after a bulk transfer.
    pub(crate) fn resume_heartbeat(&mut self) {
        self.heartbeat_slowed = false;
    }

    /// Whether the heartbeat cadence is currently slowed.
    pub fn is_heartbeat_slowed(&self) -> bool {
        self.heartbeat_slowed
    }

    /// Record activity from this peer, resetting its liveness clock.
    pub(crate) fn record_activity(&mut self) {
        self.last_active = Instant::now();
    }

    /// Time elapsed since the last recorded activity from this peer.
    pub fn active_duration(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// Attach a snapshot-transfer context to this peer.
    pub fn set_snapshot_ctx(&mut self, ctx: SnapshotSyncContext) {
        self.snapshot_ctx = Some(ctx);
    }

    /// The snapshot-transfer context, if a transfer is in flight.
    pub fn snapshot_ctx(&self) -> Option<&SnapshotSyncContext> {
        self.snapshot_ctx.as_ref()
    }

    pub(crate) fn take_snapshot_ctx(&mut self) -> Option<SnapshotSyncContext> {
        self.snapshot_ctx.take()
    }

    /// Rewind the liveness clock, simulating a silent peer.
    #[cfg(test)]
    pub(crate) fn rewind_activity(&mut self, by: Duration) {
        self.last_active -= by;
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
