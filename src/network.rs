//! The membership network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::message::JoinClusterRequest;
use crate::message::LeaveClusterRequest;
use crate::message::SnapshotSyncRequest;
use crate::message::SyncLogRequest;
use crate::NodeId;

/// A trait defining the interface for sending membership RPCs to cluster
/// members.
///
/// Sends are fire-and-forget: a returned `Ok` only means the message was
/// handed to the transport. Responses arrive later through the corresponding
/// `MembershipCore::handle_*_response` entry point, and persistent delivery
/// failure is reported through `MembershipCore::handle_rpc_failure`.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    /// Send a JoinCluster invitation to a candidate member.
    async fn send_join_cluster(&self, target: NodeId, rpc: JoinClusterRequest) -> Result<()>;

    /// Send one round of packed log entries to a catching-up member.
    async fn send_sync_log(&self, target: NodeId, rpc: SyncLogRequest) -> Result<()>;

    /// Ask the snapshot-transfer collaborator to ship a snapshot to a
    /// catching-up member.
    async fn send_snapshot_sync(&self, target: NodeId, rpc: SnapshotSyncRequest) -> Result<()>;

    /// Send a LeaveCluster instruction to a member being removed.
    async fn send_leave_cluster(&self, target: NodeId, rpc: LeaveClusterRequest) -> Result<()>;
}
