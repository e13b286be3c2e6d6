//! Dynamic cluster membership change for a Raft node.
//!
//! This crate implements the leader- and follower-side protocol that admits a
//! new voting member into a running Raft cluster and removes an existing one,
//! while preserving the single-leader, single-committed-configuration
//! invariants of Raft (§6 of the Raft spec).
//!
//! Admission is a three-step flow driven by [`MembershipCore`]:
//!
//! 1. a client sends an `AddServerRequest` to the leader, which invites the
//!    candidate with a direct `JoinClusterRequest` that bypasses the
//!    replicated log;
//! 2. the leader ships committed log entries (or a snapshot, when the log has
//!    been compacted past the candidate's position) in `SyncLogRequest`
//!    rounds until the candidate is close enough to the leader's commit
//!    index;
//! 3. the leader appends a configuration log entry containing the candidate
//!    and lets normal replication commit it.
//!
//! Removal mirrors this with `RemoveServerRequest` / `LeaveClusterRequest`
//! and a configuration entry that filters the target out.
//!
//! The replication/heartbeat loop, leader election, the durable log store,
//! the state machine and the wire transport are external collaborators,
//! consumed through the [`RaftStorage`], [`StateMachine`] and [`RaftNetwork`]
//! traits.

pub mod config;
mod core;
pub mod error;
pub mod membership;
pub mod message;
pub mod metrics;
pub mod network;
pub mod peer;
pub mod storage;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::core::CommitState;
pub use crate::core::MembershipCore;
pub use crate::core::Role;
pub use crate::error::ConfigError;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::membership::ClusterConfig;
pub use crate::membership::Member;
pub use crate::message::ResultCode;
pub use crate::metrics::ChangeKind;
pub use crate::metrics::MembershipMetrics;
pub use crate::network::RaftNetwork;
pub use crate::peer::Peer;
pub use crate::peer::SnapshotSyncContext;
pub use crate::storage::HardState;
pub use crate::storage::RaftStorage;
pub use crate::storage::StateMachine;

/// A Raft node's ID.
pub type NodeId = u64;
