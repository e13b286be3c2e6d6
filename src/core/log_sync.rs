//! The log synchronization engine: drives a joining member from an unknown
//! log position to caught-up.
//!
//! Each round ships at most one network message and returns; the next round
//! runs when the member's response arrives and re-invokes the engine with the
//! newly reported position. The gap to the leader's commit index strictly
//! decreases on each successful round, so the iteration terminates through
//! the completion branch.

use crate::core::ChangeState;
use crate::core::MembershipCore;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::message::Entry;
use crate::message::EntryPayload;
use crate::message::SnapshotSyncRequest;
use crate::message::SyncLogRequest;
use crate::message::SyncLogResponse;
use crate::network::RaftNetwork;
use crate::storage::RaftStorage;
use crate::storage::StateMachine;

impl<N: RaftNetwork, S: RaftStorage, M: StateMachine> MembershipCore<N, S, M> {
    /// Run one round of log catch-up for the member being admitted, starting
    /// at its reported log position.
    ///
    /// Only committed entries are shipped. Once the gap to the commit index
    /// falls below the configured stop gap, the member is proposed into the
    /// cluster configuration and the engine terminates for this peer.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id))]
    pub(crate) async fn sync_log_to_member(&mut self, start_index: u64) -> RaftResult<()> {
        let (target, member) = match &self.change {
            ChangeState::AddInProgress { peer, member } => (peer.id(), member.clone()),
            _ => {
                tracing::warn!("no member is joining, dropping the log sync round");
                return Ok(());
            }
        };

        let commit_index = self.commit_state.commit_index();
        let gap = commit_index.saturating_sub(start_index);

        if gap < self.config.log_sync_stop_gap {
            tracing::info!(
                peer_id = target,
                gap,
                commit_index,
                start_index,
                limit = self.config.log_sync_stop_gap,
                "log sync is done, now put the server into the cluster"
            );

            // An uncommitted configuration may exist here when another change
            // raced with this one; the new configuration must be derived from
            // it, or that change would be lost.
            let base = self.current_or_uncommitted_config();
            let next_slot = self.storage.next_slot().await.map_err(RaftError::Storage)?;
            let new_config = base.with_member_added(next_slot, member);
            return self.append_config_entry(new_config).await;
        }

        let log_start = self.storage.start_index().await.map_err(RaftError::Storage)?;
        if start_index < log_start {
            // The log has been compacted past what the member needs; fall
            // back to a snapshot transfer. While a snapshot transmission is
            // in progress the reported start index can be 0, which is
            // valid-but-incomplete.
            let req = SnapshotSyncRequest {
                term: self.current_term,
                target,
                start_index,
                commit_index,
            };
            tracing::info!(peer_id = target, start_index, log_start, "member is behind the retained log, requesting snapshot transfer");
            if let Err(err) = self.network.send_snapshot_sync(target, req).await {
                tracing::error!(error = %err, peer_id = target, "failed to hand snapshot request to the transport");
            }
            return Ok(());
        }

        let batch = std::cmp::min(gap, self.config.log_sync_batch_size);
        let pack = self
            .storage
            .pack_entries(start_index, batch)
            .await
            .map_err(RaftError::Storage)?;
        tracing::debug!(peer_id = target, start_index, batch, pack_len = pack.len(), "shipping packed log entries");

        let req = SyncLogRequest {
            term: self.current_term,
            leader_id: self.id,
            last_log_index: start_index - 1,
            commit_index,
            entries: vec![Entry::new_log_pack(self.current_term, pack)],
        };
        if let Err(err) = self.network.send_sync_log(target, req).await {
            tracing::error!(error = %err, peer_id = target, "failed to hand log sync round to the transport");
        }
        Ok(())
    }

    /// Handle one round of packed log entries received while catching up.
    ///
    /// A node that is not catching up ignores the payload and reports its
    /// current position unchanged: the request is stale or misdirected, and
    /// commit progress must never regress.
    #[tracing::instrument(level = "debug", skip(self, req), fields(id = self.id))]
    pub async fn handle_sync_log_request(&mut self, req: SyncLogRequest) -> RaftResult<SyncLogResponse> {
        let next_slot = self.storage.next_slot().await.map_err(RaftError::Storage)?;
        let mut resp = SyncLogResponse {
            term: self.current_term,
            src: self.id,
            accepted: false,
            next_index: next_slot,
        };

        let pack = match req.entries.into_iter().next() {
            Some(Entry {
                payload: EntryPayload::LogPack(pack),
                ..
            }) => pack,
            _ => {
                tracing::warn!("invalid SyncLogRequest, expecting one entry holding a log pack");
                return Ok(resp);
            }
        };

        if !self.catching_up {
            tracing::warn!(next_index = resp.next_index, "this server is ready for the cluster, ignoring the request");
            return Ok(resp);
        }

        self.storage
            .apply_pack(req.last_log_index + 1, pack)
            .await
            .map_err(RaftError::Storage)?;

        let log_end = self.storage.next_slot().await.map_err(RaftError::Storage)? - 1;
        self.commit_state.set_precommit_index(log_end);
        self.commit_state.set_commit_index(log_end);
        tracing::debug!(log_end, "applied packed entries, advanced commit markers");

        resp.accepted = true;
        resp.next_index = log_end + 1;
        self.report_metrics();
        Ok(resp)
    }

    /// Handle a joining member's response to a log sync round: restore its
    /// heartbeat cadence, update its replication cursors and run the next
    /// round from its newly reported position.
    #[tracing::instrument(level = "debug", skip(self, resp), fields(id = self.id))]
    pub async fn handle_sync_log_response(&mut self, resp: SyncLogResponse) -> RaftResult<()> {
        let next_index = resp.next_index;
        match &mut self.change {
            ChangeState::AddInProgress { peer, .. } => {
                tracing::debug!(peer_id = peer.id(), next_index, "log sync response");
                peer.resume_heartbeat();
                peer.set_next_log_index(next_index);
                peer.set_matched_index(next_index.saturating_sub(1));
                peer.record_activity();
            }
            _ => {
                tracing::warn!("got log sync response while no member is joining");
                return Ok(());
            }
        }
        self.sync_log_to_member(next_index).await
    }
}
