//! The membership-change wire messages and log entry payloads.

use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

use crate::membership::ClusterConfig;
use crate::membership::Member;
use crate::NodeId;

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The term in which the entry was created.
    pub term: u64,
    /// This entry's payload.
    pub payload: EntryPayload,
}

impl Entry {
    /// Create a new application-data entry.
    pub fn new_normal(term: u64, data: Vec<u8>) -> Self {
        Self {
            term,
            payload: EntryPayload::Normal(data),
        }
    }

    /// Create a new entry holding a member descriptor.
    pub fn new_member(term: u64, member: Member) -> Self {
        Self {
            term,
            payload: EntryPayload::Member(member),
        }
    }

    /// Create a new entry holding a cluster configuration.
    pub fn new_config(term: u64, config: ClusterConfig) -> Self {
        Self {
            term,
            payload: EntryPayload::Config(config),
        }
    }

    /// Create a new entry holding a packed batch of log entries.
    pub fn new_log_pack(term: u64, pack: Vec<u8>) -> Self {
        Self {
            term,
            payload: EntryPayload::LogPack(pack),
        }
    }

    /// Create a new entry naming a member to remove.
    pub fn new_remove_member(term: u64, id: NodeId) -> Self {
        Self {
            term,
            payload: EntryPayload::RemoveMember(id),
        }
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// A normal application-data entry.
    Normal(Vec<u8>),
    /// A member descriptor, carried by `AddServerRequest`.
    Member(Member),
    /// A cluster configuration.
    Config(ClusterConfig),
    /// An opaque packed batch of consecutive log entries, produced by
    /// `RaftStorage::pack_entries`.
    LogPack(Vec<u8>),
    /// The ID of a member to remove, carried by `RemoveServerRequest`.
    RemoveMember(NodeId),
}

/// Result codes surfaced to the client layer on `AddServer` / `RemoveServer`
/// responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// The request was accepted.
    Ok,
    /// The request payload does not have the expected shape.
    BadRequest,
    /// This node is not the leader, or writes are paused.
    NotLeader,
    /// The id of the server to add collides with an existing member.
    ServerAlreadyExists,
    /// A configuration change is already uncommitted.
    ConfigChanging,
    /// A different server is being added and is still live.
    ServerIsJoining,
    /// The leader cannot be asked to remove itself.
    CannotRemoveLeader,
    /// The server to remove is not part of the cluster.
    ServerNotFound,
}

impl Display for ResultCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultCode::Ok => "Ok",
            ResultCode::BadRequest => "BadRequest",
            ResultCode::NotLeader => "NotLeader",
            ResultCode::ServerAlreadyExists => "ServerAlreadyExists",
            ResultCode::ConfigChanging => "ConfigChanging",
            ResultCode::ServerIsJoining => "ServerIsJoining",
            ResultCode::CannotRemoveLeader => "CannotRemoveLeader",
            ResultCode::ServerNotFound => "ServerNotFound",
        };
        write!(f, "{}", s)
    }
}

/// The kind of a membership RPC, used when reporting delivery failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// `AddServerRequest`.
    AddServer,
    /// `JoinClusterRequest`.
    JoinCluster,
    /// `SyncLogRequest`.
    SyncLog,
    /// `SnapshotSyncRequest`.
    SnapshotSync,
    /// `RemoveServerRequest`.
    RemoveServer,
    /// `LeaveClusterRequest`.
    LeaveCluster,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A client request asking the leader to admit a new member.
///
/// Valid requests carry exactly one entry with an [`EntryPayload::Member`]
/// payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddServerRequest {
    /// The payload entries; exactly one member descriptor.
    pub entries: Vec<Entry>,
}

/// The response to an `AddServerRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddServerResponse {
    /// The responding node's current term.
    pub term: u64,
    /// True if the request was accepted.
    pub accepted: bool,
    /// On acceptance, the leader's next log slot as an optimistic marker.
    pub next_index: u64,
    /// The result code surfaced to the client.
    pub result: ResultCode,
}

impl AddServerResponse {
    pub(crate) fn accept(term: u64, next_index: u64) -> Self {
        Self {
            term,
            accepted: true,
            next_index,
            result: ResultCode::Ok,
        }
    }

    pub(crate) fn reject(term: u64, result: ResultCode) -> Self {
        Self {
            term,
            accepted: false,
            next_index: 0,
            result,
        }
    }
}

/// A direct invitation from the leader to a joining member, bypassing the
/// replicated log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinClusterRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader_id: NodeId,
    /// The index of the last entry in the leader's log.
    pub last_log_index: u64,
    /// The leader's commit index.
    pub commit_index: u64,
    /// The payload entries; exactly one cluster configuration.
    pub entries: Vec<Entry>,
}

/// The response to a `JoinClusterRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JoinClusterResponse {
    /// The responding node's current term.
    pub term: u64,
    /// The responding node's ID.
    pub src: NodeId,
    /// True if the invitation was accepted.
    pub accepted: bool,
    /// The next log index the joining member expects.
    pub next_index: u64,
}

/// One round of log catch-up: a packed batch of committed entries shipped
/// directly to a joining member.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncLogRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader_id: NodeId,
    /// The index immediately before the first packed entry.
    pub last_log_index: u64,
    /// The leader's commit index.
    pub commit_index: u64,
    /// The payload entries; exactly one log pack.
    pub entries: Vec<Entry>,
}

/// The response to a `SyncLogRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncLogResponse {
    /// The responding node's current term.
    pub term: u64,
    /// The responding node's ID.
    pub src: NodeId,
    /// True if the packed entries were applied.
    pub accepted: bool,
    /// The next log index the joining member expects.
    pub next_index: u64,
}

/// A client request asking the leader to remove a member.
///
/// Valid requests carry exactly one entry with an
/// [`EntryPayload::RemoveMember`] payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoveServerRequest {
    /// The payload entries; exactly one remove-member id.
    pub entries: Vec<Entry>,
}

/// The response to a `RemoveServerRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoveServerResponse {
    /// The responding node's current term.
    pub term: u64,
    /// True if the request was accepted.
    pub accepted: bool,
    /// On acceptance, the leader's next log slot as an optimistic marker.
    pub next_index: u64,
    /// The result code surfaced to the client.
    pub result: ResultCode,
}

impl RemoveServerResponse {
    pub(crate) fn accept(term: u64, next_index: u64) -> Self {
        Self {
            term,
            accepted: true,
            next_index,
            result: ResultCode::Ok,
        }
    }

    pub(crate) fn reject(term: u64, result: ResultCode) -> Self {
        Self {
            term,
            accepted: false,
            next_index: 0,
            result,
        }
    }
}

/// A direct instruction from the leader telling a member to leave the cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveClusterRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID.
    pub leader_id: NodeId,
    /// The index of the last entry in the leader's log.
    pub last_log_index: u64,
    /// The leader's commit index.
    pub commit_index: u64,
}

/// The response to a `LeaveClusterRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaveClusterResponse {
    /// The responding node's current term.
    pub term: u64,
    /// The responding node's ID.
    pub src: NodeId,
    /// True if the member accepted to step down.
    pub accepted: bool,
    /// The responding node's next log slot.
    pub next_index: u64,
}

/// The trigger for a snapshot transfer to a joining member whose starting
/// position precedes the log store's earliest retained index.
///
/// The transfer protocol itself is an external collaborator; only the request
/// identity is defined here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSyncRequest {
    /// The leader's current term.
    pub term: u64,
    /// The joining member the snapshot is for.
    pub target: NodeId,
    /// The joining member's reported log position.
    ///
    /// May be 0 while a snapshot transmission is still in progress; that is
    /// valid-but-incomplete, not an error.
    pub start_index: u64,
    /// The leader's commit index.
    pub commit_index: u64,
}
