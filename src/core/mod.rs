//! The core logic of dynamic cluster membership change.

mod admin;
mod join_leave;
mod log_sync;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod admin_test;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::ClusterConfig;
use crate::membership::Member;
use crate::message::Entry;
use crate::metrics::ChangeKind;
use crate::metrics::MembershipMetrics;
use crate::network::RaftNetwork;
use crate::peer::Peer;
use crate::storage::RaftStorage;
use crate::storage::StateMachine;
use crate::NodeId;

/// The role of a Raft node within the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The node is replicating the log from the leader.
    Follower,
    /// The node is campaigning for leadership.
    Candidate,
    /// The node is the cluster leader.
    Leader,
    /// The node receives the log but does not vote.
    Learner,
}

/// Commit progress markers, shared with heartbeat/timer tasks.
///
/// Writes happen only on the serialized consensus message path, but auxiliary
/// tasks read these concurrently, so they are atomics.
#[derive(Debug, Default)]
pub struct CommitState {
    commit_index: AtomicU64,
    precommit_index: AtomicU64,
    applied_index: AtomicU64,
}

impl CommitState {
    /// The index of the highest log entry known to be committed cluster-wide.
    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::SeqCst)
    }

    pub(crate) fn set_commit_index(&self, idx: u64) {
        self.commit_index.store(idx, Ordering::SeqCst);
    }

    /// The index of the highest log entry accepted locally but not yet
    /// known to be committed.
    pub fn precommit_index(&self) -> u64 {
        self.precommit_index.load(Ordering::SeqCst)
    }

    pub(crate) fn set_precommit_index(&self, idx: u64) {
        self.precommit_index.store(idx, Ordering::SeqCst);
    }

    /// The index of the highest log entry applied to the state machine.
    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    pub(crate) fn set_applied_index(&self, idx: u64) {
        self.applied_index.store(idx, Ordering::SeqCst);
    }
}

/// The membership-change session of a node.
///
/// At most one change is in flight at a time; the variants make the mutual
/// exclusion of add and remove explicit.
#[derive(Debug)]
pub(crate) enum ChangeState {
    /// No membership change in flight.
    Idle,
    /// A member is being admitted. The peer handle is owned here until the
    /// member is admitted into the peer set or the attempt is abandoned.
    AddInProgress {
        /// The pending peer handle for the joining member.
        peer: Peer,
        /// The descriptor awaiting admission into the configuration.
        member: Member,
    },
    /// A member has been instructed to leave.
    RemoveInProgress {
        /// The member being removed.
        target: NodeId,
    },
}

/// The core type implementing dynamic cluster membership change.
///
/// All mutations go through `&mut self` on the serialized consensus message
/// path: request handlers, response handlers and the failure callback are
/// invoked one at a time. RPC sends are fire-and-forget; progress continues
/// when the corresponding response handler is invoked.
pub struct MembershipCore<N: RaftNetwork, S: RaftStorage, M: StateMachine> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The `RaftStorage` implementation.
    storage: Arc<S>,
    /// The `StateMachine` implementation.
    state_machine: Arc<M>,

    role: Role,
    /// Set while leadership is being transferred away; writes are rejected.
    write_paused: bool,
    current_term: u64,
    current_leader: Option<NodeId>,
    voted_for: Option<NodeId>,

    /// The last committed cluster configuration.
    cluster_config: Arc<ClusterConfig>,
    /// A proposed configuration written to the log but not yet committed.
    ///
    /// Deriving a new configuration always starts from this one when present,
    /// so a change racing with another is never lost.
    uncommitted_config: Option<Arc<ClusterConfig>>,

    /// The live peer set, keyed by node ID.
    peers: BTreeMap<NodeId, Peer>,
    /// The membership-change session.
    change: ChangeState,

    /// True while this node is receiving catch-up traffic as a
    /// not-yet-admitted member.
    catching_up: bool,
    /// Countdown armed by a leave instruction; the node terminates when it
    /// reaches zero.
    steps_to_down: u8,
    /// The commit index catch-up starts from on first join receipt.
    initial_commit_index: u64,

    commit_state: Arc<CommitState>,

    /// Wakes the external replication loop after a configuration entry is
    /// appended.
    tx_replicate: mpsc::UnboundedSender<()>,
    tx_metrics: watch::Sender<MembershipMetrics>,
}

impl<N: RaftNetwork, S: RaftStorage, M: StateMachine> MembershipCore<N, S, M> {
    /// Create a new membership core.
    ///
    /// `initial_config` is the configuration recovered from storage (or the
    /// empty configuration on a pristine node); `initial_commit_index` is the
    /// state machine's recovered commit position, which catch-up restarts
    /// from. Returns the core and a receiver for its metrics channel.
    pub fn new(
        id: NodeId,
        config: Arc<Config>,
        initial_config: ClusterConfig,
        initial_commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        state_machine: Arc<M>,
        tx_replicate: mpsc::UnboundedSender<()>,
    ) -> (Self, watch::Receiver<MembershipMetrics>) {
        let commit_state = Arc::new(CommitState::default());
        commit_state.set_commit_index(initial_commit_index);
        commit_state.set_applied_index(initial_commit_index);

        let initial_metrics = MembershipMetrics {
            id,
            role: Role::Follower,
            current_term: 0,
            commit_index: initial_commit_index,
            change: ChangeKind::Idle,
            config_changing: false,
            catching_up: false,
            config: initial_config.clone(),
        };
        let (tx_metrics, rx_metrics) = watch::channel(initial_metrics);

        let mut this = Self {
            id,
            config,
            network,
            storage,
            state_machine,
            role: Role::Follower,
            write_paused: false,
            current_term: 0,
            current_leader: None,
            voted_for: None,
            cluster_config: Arc::new(ClusterConfig::default()),
            uncommitted_config: None,
            peers: BTreeMap::new(),
            change: ChangeState::Idle,
            catching_up: false,
            steps_to_down: 0,
            initial_commit_index,
            commit_state,
            tx_replicate,
            tx_metrics,
        };
        this.install_config(initial_config);
        (this, rx_metrics)
    }

    /// This node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// This node's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The current term.
    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    /// The ID of the current cluster leader, if known.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.current_leader
    }

    /// The last committed cluster configuration.
    pub fn cluster_config(&self) -> Arc<ClusterConfig> {
        self.cluster_config.clone()
    }

    /// The uncommitted cluster configuration, if a change is in flight.
    pub fn uncommitted_config(&self) -> Option<Arc<ClusterConfig>> {
        self.uncommitted_config.clone()
    }

    /// A shared handle to the commit progress markers.
    pub fn commit_state(&self) -> Arc<CommitState> {
        self.commit_state.clone()
    }

    /// The live peer handle for the given member, if present.
    pub fn peer(&self, id: NodeId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// The IDs of all live peers.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    /// The ID of the member currently being admitted, if any.
    pub fn joining_member_id(&self) -> Option<NodeId> {
        match &self.change {
            ChangeState::AddInProgress { member, .. } => Some(member.id),
            _ => None,
        }
    }

    /// True while this node is catching up as a not-yet-admitted member.
    pub fn is_catching_up(&self) -> bool {
        self.catching_up
    }

    /// True while an uncommitted configuration exists.
    pub fn config_changing(&self) -> bool {
        self.uncommitted_config.is_some()
    }

    /// Assume cluster leadership for the given term.
    ///
    /// Called by the (external) election module once this node wins an
    /// election.
    pub fn assume_leadership(&mut self, term: u64) {
        self.role = Role::Leader;
        self.current_term = term;
        self.current_leader = Some(self.id);
        self.voted_for = Some(self.id);
        self.report_metrics();
    }

    /// Pause or resume handling of write requests, e.g. around a leadership
    /// transfer.
    pub fn set_write_paused(&mut self, paused: bool) {
        self.write_paused = paused;
    }

    /// Advance the step-down countdown by one heartbeat cycle.
    ///
    /// Returns true once the countdown armed by a leave instruction reaches
    /// zero and the node should terminate.
    pub fn tick_step_down(&mut self) -> bool {
        if self.steps_to_down == 0 {
            return false;
        }
        self.steps_to_down -= 1;
        if self.steps_to_down == 0 {
            tracing::info!(id = self.id, "step-down countdown elapsed, leaving the cluster");
            true
        } else {
            tracing::debug!(steps_to_down = self.steps_to_down, "step-down countdown ticked");
            false
        }
    }

    /// Install a committed configuration.
    ///
    /// Invoked by the (external) commit path when a configuration log entry
    /// commits. Clears the uncommitted configuration, admits a fully-synced
    /// joining member into the peer set or erases a removed one, and resets
    /// the change session.
    #[tracing::instrument(level = "debug", skip(self, config), fields(id = self.id, log_index = config.log_index()))]
    pub fn commit_config(&mut self, config: ClusterConfig) {
        tracing::info!("cluster configuration committed: {}", config);

        if let Some(uncommitted) = &self.uncommitted_config {
            if uncommitted.log_index() <= config.log_index() {
                self.uncommitted_config = None;
            }
        }

        let prev = std::mem::replace(&mut self.change, ChangeState::Idle);
        match prev {
            ChangeState::AddInProgress { mut peer, member } => {
                if config.contains(member.id) {
                    tracing::info!(peer_id = member.id, "new member admitted into the cluster");
                    // Catch-up is over; a leftover snapshot context goes back
                    // to the application before the peer joins the live set.
                    if let Some(mut ctx) = peer.take_snapshot_ctx() {
                        if let Some(user_ctx) = ctx.take_user_ctx() {
                            self.state_machine.release_snapshot_ctx(user_ctx);
                        }
                    }
                    peer.record_activity();
                    self.peers.insert(member.id, peer);
                } else {
                    tracing::warn!(peer_id = member.id, "committed configuration does not contain the joining member, abandoning");
                    self.release_pending_member(peer);
                }
            }
            ChangeState::RemoveInProgress { target } => {
                if !config.contains(target) {
                    if let Some(peer) = self.peers.get_mut(&target) {
                        peer.enable_heartbeat(false);
                    }
                    if self.peers.remove(&target).is_some() {
                        tracing::info!(peer_id = target, "member removed from the cluster");
                    }
                }
            }
            ChangeState::Idle => {}
        }

        if self.catching_up && config.contains(self.id) {
            tracing::info!(id = self.id, "catch-up complete, this node is now a cluster member");
            self.catching_up = false;
        }

        self.install_config(config);
        self.report_metrics();
    }

    /// Set the given configuration as current and reconcile the peer set
    /// with it.
    pub(crate) fn install_config(&mut self, config: ClusterConfig) {
        for member in config.members() {
            if member.id != self.id && !self.peers.contains_key(&member.id) {
                self.peers.insert(member.id, Peer::new(member.clone()));
            }
        }
        let gone: Vec<NodeId> = self.peers.keys().copied().filter(|id| !config.contains(*id)).collect();
        for id in gone {
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.enable_heartbeat(false);
            }
            self.peers.remove(&id);
        }
        self.cluster_config = Arc::new(config);
    }

    /// The configuration new versions are derived from: the uncommitted one
    /// when it exists, else the last committed one.
    pub(crate) fn current_or_uncommitted_config(&self) -> Arc<ClusterConfig> {
        match &self.uncommitted_config {
            Some(uncommitted) => {
                tracing::info!(
                    log_index = uncommitted.log_index(),
                    prev_log_index = uncommitted.prev_log_index(),
                    "uncommitted configuration exists, deriving from it"
                );
                uncommitted.clone()
            }
            None => self.cluster_config.clone(),
        }
    }

    /// Hand a pending peer's snapshot context back to the application and
    /// drop the peer.
    pub(crate) fn release_pending_member(&self, mut peer: Peer) {
        if let Some(mut ctx) = peer.take_snapshot_ctx() {
            if let Some(user_ctx) = ctx.take_user_ctx() {
                self.state_machine.release_snapshot_ctx(user_ctx);
            }
        }
    }

    /// Append a derived configuration to the log as a configuration entry,
    /// record it as the uncommitted configuration and hand it to the normal
    /// replication path to be committed through consensus.
    pub(crate) async fn append_config_entry(&mut self, new_config: ClusterConfig) -> RaftResult<()> {
        let entry = Entry::new_config(self.current_term, new_config.clone());
        let slot = self.storage.append_entry(entry).await.map_err(RaftError::Storage)?;
        tracing::info!(
            slot,
            config = %new_config,
            "configuration entry appended to the log"
        );
        self.uncommitted_config = Some(Arc::new(new_config));
        self.trigger_replication();
        self.report_metrics();
        Ok(())
    }

    /// Wake the external replication loop.
    pub(crate) fn trigger_replication(&self) {
        let _ = self.tx_replicate.send(());
    }

    pub(crate) fn change_kind(&self) -> ChangeKind {
        match &self.change {
            ChangeState::Idle => ChangeKind::Idle,
            ChangeState::AddInProgress { member, .. } => ChangeKind::Adding(member.id),
            ChangeState::RemoveInProgress { target } => ChangeKind::Removing(*target),
        }
    }

    /// Report a metrics payload on the current state of the membership core.
    pub(crate) fn report_metrics(&self) {
        let res = self.tx_metrics.send(MembershipMetrics {
            id: self.id,
            role: self.role,
            current_term: self.current_term,
            commit_index: self.commit_state.commit_index(),
            change: self.change_kind(),
            config_changing: self.config_changing(),
            catching_up: self.catching_up,
            config: (*self.cluster_config).clone(),
        });
        if let Err(err) = res {
            tracing::debug!(error = %err, id = self.id, "no metrics receivers attached");
        }
    }
}
