//! Observability of the membership core.
//!
//! A membership metrics payload is published on a `watch` channel after every
//! state mutation, so auxiliary tasks (admin APIs, health checks) can observe
//! progress of a membership change without touching the core.

use crate::core::Role;
use crate::membership::ClusterConfig;
use crate::NodeId;

/// The kind of membership change currently in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// No change in flight.
    Idle,
    /// The given member is being admitted.
    Adding(NodeId),
    /// The given member is being removed.
    Removing(NodeId),
}

/// A set of metrics describing the current state of the membership core.
#[derive(Clone, Debug, PartialEq)]
pub struct MembershipMetrics {
    /// The ID of this Raft node.
    pub id: NodeId,
    /// The role of this node in the cluster.
    pub role: Role,
    /// The current term.
    pub current_term: u64,
    /// The commit index.
    pub commit_index: u64,
    /// The membership change currently in flight, if any.
    pub change: ChangeKind,
    /// True while an uncommitted configuration exists.
    pub config_changing: bool,
    /// True while this node is catching up as a not-yet-admitted member.
    pub catching_up: bool,
    /// The cluster configuration this node currently considers current.
    pub config: ClusterConfig,
}
