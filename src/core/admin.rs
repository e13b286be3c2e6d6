//! Leader-side coordination of AddServer / RemoveServer requests.

use std::time::Duration;

use crate::core::ChangeState;
use crate::core::MembershipCore;
use crate::core::Role;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::message::AddServerRequest;
use crate::message::AddServerResponse;
use crate::message::Entry;
use crate::message::EntryPayload;
use crate::message::JoinClusterRequest;
use crate::message::LeaveClusterRequest;
use crate::message::RemoveServerRequest;
use crate::message::RemoveServerResponse;
use crate::message::ResultCode;
use crate::network::RaftNetwork;
use crate::peer::Peer;
use crate::storage::RaftStorage;
use crate::storage::StateMachine;
use crate::NodeId;

impl<N: RaftNetwork, S: RaftStorage, M: StateMachine> MembershipCore<N, S, M> {
    /// Handle a client request to admit a new member into the cluster.
    ///
    /// On acceptance a peer handle is created for the candidate, owned by the
    /// change session until the member is admitted, and a direct
    /// `JoinClusterRequest` carrying the current configuration is sent to it.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id = self.id))]
    pub async fn handle_add_server_request(&mut self, req: AddServerRequest) -> RaftResult<AddServerResponse> {
        let term = self.current_term;

        let member = match req.entries.as_slice() {
            [Entry {
                payload: EntryPayload::Member(member),
                ..
            }] => member.clone(),
            _ => {
                tracing::debug!("bad add server request, expecting one entry holding a member descriptor");
                return Ok(AddServerResponse::reject(term, ResultCode::BadRequest));
            }
        };

        if self.role != Role::Leader || self.write_paused {
            tracing::error!("this node is not a leader, cannot handle AddServerRequest");
            return Ok(AddServerResponse::reject(term, ResultCode::NotLeader));
        }

        if self.peers.contains_key(&member.id) || member.id == self.id {
            tracing::warn!(
                peer_id = member.id,
                "the server to be added has a duplicated id with an existing member"
            );
            return Ok(AddServerResponse::reject(term, ResultCode::ServerAlreadyExists));
        }

        if self.config_changing() || matches!(self.change, ChangeState::RemoveInProgress { .. }) {
            tracing::warn!("previous configuration change has not committed yet");
            return Ok(AddServerResponse::reject(term, ResultCode::ConfigChanging));
        }

        // An add may already be in progress. Supersede it only once the
        // joining member has been silent for longer than the liveness window.
        let liveness_window = Duration::from_millis(self.config.join_liveness_window());
        let stale = match &self.change {
            ChangeState::AddInProgress { peer, .. } => {
                let last_active = peer.active_duration();
                tracing::warn!(
                    peer_id = peer.id(),
                    last_active_ms = last_active.as_millis() as u64,
                    "previous add is in progress"
                );
                if last_active <= liveness_window {
                    return Ok(AddServerResponse::reject(term, ResultCode::ServerIsJoining));
                }
                true
            }
            _ => false,
        };
        if stale {
            tracing::warn!("joining member activity timed out, starting over");
            if let ChangeState::AddInProgress { peer, .. } = std::mem::replace(&mut self.change, ChangeState::Idle) {
                self.release_pending_member(peer);
            }
        }

        let peer = Peer::new(member.clone());
        self.change = ChangeState::AddInProgress { peer, member };
        self.invite_member_to_cluster().await?;

        let next_slot = self.storage.next_slot().await.map_err(RaftError::Storage)?;
        self.report_metrics();
        Ok(AddServerResponse::accept(term, next_slot))
    }

    /// Send a direct join invitation, bypassing the committed log, to the
    /// member currently being admitted.
    pub(crate) async fn invite_member_to_cluster(&mut self) -> RaftResult<()> {
        let target = match &self.change {
            ChangeState::AddInProgress { peer, .. } => peer.id(),
            _ => {
                tracing::warn!("no member is joining, nothing to invite");
                return Ok(());
            }
        };

        let next_slot = self.storage.next_slot().await.map_err(RaftError::Storage)?;
        let req = JoinClusterRequest {
            term: self.current_term,
            leader_id: self.id,
            last_log_index: next_slot - 1,
            commit_index: self.commit_state.commit_index(),
            entries: vec![Entry::new_config(self.current_term, (*self.cluster_config).clone())],
        };

        tracing::info!(peer_id = target, "sending join invitation");
        if let Err(err) = self.network.send_join_cluster(target, req).await {
            tracing::error!(error = %err, peer_id = target, "failed to hand join invitation to the transport");
        }
        Ok(())
    }

    /// Handle a client request to remove a member from the cluster.
    ///
    /// On acceptance a direct `LeaveClusterRequest` is sent to the target;
    /// the configuration entry is only appended once the target confirms (or
    /// once the leave RPC fails persistently).
    #[tracing::instrument(level = "debug", skip(self, req), fields(id = self.id))]
    pub async fn handle_remove_server_request(&mut self, req: RemoveServerRequest) -> RaftResult<RemoveServerResponse> {
        let term = self.current_term;

        let target = match req.entries.as_slice() {
            [Entry {
                payload: EntryPayload::RemoveMember(id),
                ..
            }] => *id,
            _ => {
                tracing::warn!("bad remove server request, expecting one entry naming a member");
                return Ok(RemoveServerResponse::reject(term, ResultCode::BadRequest));
            }
        };

        if self.role != Role::Leader || self.write_paused {
            tracing::warn!("this node is not a leader, cannot handle RemoveServerRequest");
            return Ok(RemoveServerResponse::reject(term, ResultCode::NotLeader));
        }

        if self.config_changing() {
            tracing::warn!("previous configuration change has not committed yet");
            return Ok(RemoveServerResponse::reject(term, ResultCode::ConfigChanging));
        }

        // A remove may be retried for the same target while the leave
        // instruction is still in flight; anything else must wait.
        match &self.change {
            ChangeState::AddInProgress { .. } => {
                tracing::warn!("a member is being admitted, cannot remove concurrently");
                return Ok(RemoveServerResponse::reject(term, ResultCode::ConfigChanging));
            }
            ChangeState::RemoveInProgress { target: in_flight } if *in_flight != target => {
                tracing::warn!(in_flight = *in_flight, "another member is already being removed");
                return Ok(RemoveServerResponse::reject(term, ResultCode::ConfigChanging));
            }
            _ => {}
        }

        if target == self.id {
            tracing::warn!("cannot request to remove the leader");
            return Ok(RemoveServerResponse::reject(term, ResultCode::CannotRemoveLeader));
        }

        if !self.peers.contains_key(&target) {
            tracing::warn!(peer_id = target, "server does not exist");
            return Ok(RemoveServerResponse::reject(term, ResultCode::ServerNotFound));
        }

        let next_slot = self.storage.next_slot().await.map_err(RaftError::Storage)?;
        let req = LeaveClusterRequest {
            term,
            leader_id: self.id,
            last_log_index: next_slot - 1,
            commit_index: self.commit_state.commit_index(),
        };
        if let Err(err) = self.network.send_leave_cluster(target, req).await {
            tracing::error!(error = %err, peer_id = target, "failed to hand leave instruction to the transport");
        }

        // Leave the activity clock alone: repeated remove requests must stay
        // idempotent and must not restart liveness tracking.
        if let Some(peer) = self.peers.get_mut(&target) {
            peer.mark_leaving();
        }
        self.change = ChangeState::RemoveInProgress { target };

        tracing::info!(peer_id = target, "sent leave instruction");
        self.report_metrics();
        Ok(RemoveServerResponse::accept(term, next_slot))
    }

    /// Remove a member from the cluster configuration.
    ///
    /// The peer is stepped down before the configuration is touched, so the
    /// heartbeat path cannot race with the removal. The derived configuration
    /// is appended as a log entry and committed through consensus like any
    /// other entry.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id))]
    pub(crate) async fn remove_member_from_config(&mut self, target: NodeId) -> RaftResult<()> {
        match self.peers.get_mut(&target) {
            Some(peer) => peer.step_down(),
            None => tracing::error!(peer_id = target, "trying to remove a server that does not exist now"),
        }

        let base = self.current_or_uncommitted_config();
        let next_slot = self.storage.next_slot().await.map_err(RaftError::Storage)?;
        let new_config = base.with_member_removed(next_slot, target);

        tracing::info!(
            peer_id = target,
            log_index = new_config.log_index(),
            "removed server from configuration, proposing it through the log"
        );
        self.change = ChangeState::RemoveInProgress { target };
        self.append_config_entry(new_config).await
    }
}
