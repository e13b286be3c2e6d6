//! The join/leave protocol handlers and RPC failure recovery.

use crate::core::ChangeState;
use crate::core::MembershipCore;
use crate::core::Role;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::message::Entry;
use crate::message::EntryPayload;
use crate::message::JoinClusterRequest;
use crate::message::JoinClusterResponse;
use crate::message::LeaveClusterRequest;
use crate::message::LeaveClusterResponse;
use crate::message::MessageKind;
use crate::network::RaftNetwork;
use crate::storage::HardState;
use crate::storage::RaftStorage;
use crate::storage::StateMachine;
use crate::NodeId;

impl<N: RaftNetwork, S: RaftStorage, M: StateMachine> MembershipCore<N, S, M> {
    /// Handle a join invitation from a cluster leader.
    ///
    /// Adopts the sender as leader, installs the received configuration and
    /// enters catch-up mode. Invitations may be repeated while a previous
    /// admission attempt is still in progress; commit progress is only reset
    /// on the first receipt and never regresses afterwards.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id = self.id))]
    pub async fn handle_join_cluster_request(&mut self, req: JoinClusterRequest) -> RaftResult<JoinClusterResponse> {
        let mut resp = JoinClusterResponse {
            term: self.current_term,
            src: self.id,
            accepted: false,
            next_index: 0,
        };

        let config = match req.entries.into_iter().next() {
            Some(Entry {
                payload: EntryPayload::Config(config),
                ..
            }) => config,
            _ => {
                tracing::info!("invalid JoinClusterRequest, expecting one entry holding a configuration");
                return Ok(resp);
            }
        };

        let reset_commit_index = !self.catching_up;
        if self.catching_up {
            tracing::warn!(
                applied_index = self.commit_state.applied_index(),
                commit_index = self.commit_state.commit_index(),
                "this server is already in log syncing mode, doing it again without resetting the commit index"
            );
        }

        tracing::info!(leader = req.leader_id, "got join cluster request from leader");
        self.catching_up = true;
        self.role = Role::Follower;
        self.current_leader = Some(req.leader_id);

        if reset_commit_index {
            self.commit_state.set_applied_index(self.initial_commit_index);
            self.commit_state.set_commit_index(self.initial_commit_index);
        }

        self.voted_for = None;
        self.current_term = req.term;
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(RaftError::Storage)?;
        self.install_config(config);

        resp.term = self.current_term;
        resp.accepted = true;
        resp.next_index = self.commit_state.commit_index() + 1;
        self.report_metrics();
        Ok(resp)
    }

    /// Handle a candidate member's response to a join invitation.
    ///
    /// On acceptance the log synchronization engine starts at the reported
    /// position; on rejection the admission attempt is abandoned.
    #[tracing::instrument(level = "debug", skip(self, resp), fields(id = self.id))]
    pub async fn handle_join_cluster_response(&mut self, resp: JoinClusterResponse) -> RaftResult<()> {
        if !matches!(self.change, ChangeState::AddInProgress { .. }) {
            tracing::warn!("no server to join, dropping the message");
            return Ok(());
        }

        if resp.accepted {
            if let ChangeState::AddInProgress { peer, .. } = &mut self.change {
                tracing::info!(
                    peer_id = peer.id(),
                    next_index = resp.next_index,
                    "new server confirms it will join, start syncing logs to it"
                );
                peer.record_activity();
            }
            self.sync_log_to_member(resp.next_index).await
        } else {
            if let ChangeState::AddInProgress { peer, .. } = std::mem::replace(&mut self.change, ChangeState::Idle) {
                tracing::warn!(peer_id = peer.id(), "new server cannot accept the invitation, giving up");
                self.release_pending_member(peer);
            }
            self.report_metrics();
            Ok(())
        }
    }

    /// Handle a leave instruction from the cluster leader.
    ///
    /// Arms a two-cycle step-down countdown unless a configuration change is
    /// currently uncommitted locally, in which case the leader must retry
    /// later.
    #[tracing::instrument(level = "debug", skip(self, _req), fields(id = self.id))]
    pub async fn handle_leave_cluster_request(&mut self, _req: LeaveClusterRequest) -> RaftResult<LeaveClusterResponse> {
        let next_slot = self.storage.next_slot().await.map_err(RaftError::Storage)?;
        let mut resp = LeaveClusterResponse {
            term: self.current_term,
            src: self.id,
            accepted: false,
            next_index: next_slot,
        };

        if !self.config_changing() {
            tracing::debug!("leaving cluster, stepping down after 2 heartbeat cycles");
            self.steps_to_down = 2;
            resp.accepted = true;
        }

        Ok(resp)
    }

    /// Handle the target member's response to a leave instruction.
    ///
    /// On acceptance the member is removed from the configuration; on
    /// rejection nothing happens and the remove request must be retried.
    #[tracing::instrument(level = "debug", skip(self, resp), fields(id = self.id))]
    pub async fn handle_leave_cluster_response(&mut self, resp: LeaveClusterResponse) -> RaftResult<()> {
        if !resp.accepted {
            tracing::debug!(peer_id = resp.src, "peer does not accept stepping down, stop proceeding");
            return Ok(());
        }

        tracing::debug!(peer_id = resp.src, "peer accepted stepping down, removing it from the cluster");
        self.remove_member_from_config(resp.src).await
    }

    /// Handle a membership RPC whose delivery has failed persistently.
    ///
    /// A failed leave degrades to forced removal: in a two-member cluster it
    /// is safe to erase the peer from the live set immediately, because no
    /// other configuration change can be in flight (a leader cannot be
    /// elected with the only other member offline); the configuration entry
    /// is appended regardless of cluster size. A failed join is abandoned.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id))]
    pub async fn handle_rpc_failure(&mut self, kind: MessageKind, target: NodeId) -> RaftResult<()> {
        match kind {
            MessageKind::LeaveCluster => {
                tracing::info!(peer_id = target, "rpc failed again for the removing server, will remove it directly");

                if self.peers.len() == 1 {
                    if let Some(peer) = self.peers.get_mut(&target) {
                        peer.enable_heartbeat(false);
                    }
                    if self.peers.remove(&target).is_some() {
                        tracing::info!(peer_id = target, "server is removed from cluster");
                    } else {
                        tracing::info!(peer_id = target, "peer cannot be found, no action for removing");
                    }
                }

                self.remove_member_from_config(target).await
            }
            MessageKind::JoinCluster | MessageKind::SyncLog | MessageKind::SnapshotSync => {
                tracing::info!(peer_id = target, "rpc failed again for the new coming server, will stop retrying");
                match std::mem::replace(&mut self.change, ChangeState::Idle) {
                    ChangeState::AddInProgress { peer, .. } => {
                        self.release_pending_member(peer);
                        self.report_metrics();
                    }
                    other => {
                        // Not an admission failure; leave the session as it was.
                        self.change = other;
                    }
                }
                Ok(())
            }
            MessageKind::AddServer | MessageKind::RemoveServer => {
                tracing::debug!(peer_id = target, "client-facing request kinds carry no retry state");
                Ok(())
            }
        }
    }
}
