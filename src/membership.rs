//! The cluster membership configuration and its member descriptors.

use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;

/// Descriptor of one cluster participant.
///
/// The most common usage is to carry the connecting address of a node so that
/// an application does not need an additional store to support its
/// `RaftNetwork` implementation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The node's ID.
    pub id: NodeId,
    /// The network endpoint other members connect to.
    pub endpoint: String,
    /// A learner receives the log but does not vote.
    pub learner: bool,
}

impl Member {
    /// Create a new voting member descriptor.
    pub fn new(id: NodeId, endpoint: impl ToString) -> Self {
        Self {
            id,
            endpoint: endpoint.to_string(),
            learner: false,
        }
    }

    /// Create a new learner descriptor.
    pub fn new_learner(id: NodeId, endpoint: impl ToString) -> Self {
        Self {
            id,
            endpoint: endpoint.to_string(),
            learner: true,
        }
    }
}

impl Display for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.endpoint)?;
        if self.learner {
            write!(f, "(learner)")?;
        }
        Ok(())
    }
}

/// A versioned, ordered list of member descriptors plus metadata, replicated
/// like a log entry.
///
/// A configuration is immutable once published: new versions are derived with
/// [`ClusterConfig::with_member_added`] / [`ClusterConfig::with_member_removed`],
/// never mutated in place. A node holds at most two of these at a time — the
/// last committed one and, while a change is in flight, one uncommitted
/// successor. Deriving always starts from the uncommitted one when it exists,
/// so a change racing with another is never lost.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// The log index at which this configuration was proposed.
    log_index: u64,
    /// The log index of the previous configuration version.
    prev_log_index: u64,
    /// All members of the cluster, in insertion order.
    members: Vec<Member>,
    /// Opaque application context carried along with the configuration.
    user_ctx: Vec<u8>,
    /// Whether replication to followers is asynchronous.
    async_replication: bool,
}

impl ClusterConfig {
    /// Create a new, empty configuration version.
    pub fn new(log_index: u64, prev_log_index: u64) -> Self {
        Self {
            log_index,
            prev_log_index,
            members: Vec::new(),
            user_ctx: Vec::new(),
            async_replication: false,
        }
    }

    /// Set the member list during construction.
    pub fn with_members(mut self, members: Vec<Member>) -> Self {
        self.members = members;
        self
    }

    /// Set the opaque application context during construction.
    pub fn with_user_ctx(mut self, user_ctx: Vec<u8>) -> Self {
        self.user_ctx = user_ctx;
        self
    }

    /// Set the async-replication flag during construction.
    pub fn with_async_replication(mut self, async_replication: bool) -> Self {
        self.async_replication = async_replication;
        self
    }

    /// The log index at which this configuration was proposed.
    pub fn log_index(&self) -> u64 {
        self.log_index
    }

    /// The log index of the previous configuration version.
    pub fn prev_log_index(&self) -> u64 {
        self.prev_log_index
    }

    /// All members of the cluster.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// The opaque application context.
    pub fn user_ctx(&self) -> &[u8] {
        &self.user_ctx
    }

    /// Whether replication to followers is asynchronous.
    pub fn is_async_replication(&self) -> bool {
        self.async_replication
    }

    /// Check if the given node ID is part of this configuration.
    pub fn contains(&self, id: NodeId) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    /// Get the descriptor of the given node, if present.
    pub fn get(&self, id: NodeId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Derive the successor configuration with `member` appended.
    ///
    /// `log_index` is the log slot the derived configuration will be proposed
    /// at; the previous-version pointer, the user context and the
    /// async-replication flag are carried over from `self`.
    pub fn with_member_added(&self, log_index: u64, member: Member) -> ClusterConfig {
        let mut members = self.members.clone();
        members.push(member);
        ClusterConfig {
            log_index,
            prev_log_index: self.log_index,
            members,
            user_ctx: self.user_ctx.clone(),
            async_replication: self.async_replication,
        }
    }

    /// Derive the successor configuration with the member `id` filtered out.
    pub fn with_member_removed(&self, log_index: u64, id: NodeId) -> ClusterConfig {
        let members = self.members.iter().filter(|m| m.id != id).cloned().collect();
        ClusterConfig {
            log_index,
            prev_log_index: self.log_index,
            members,
            user_ctx: self.user_ctx.clone(),
            async_replication: self.async_replication,
        }
    }
}

impl Display for ClusterConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "log_index={} prev={} members=[", self.log_index, self.prev_log_index)?;
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", m)?;
        }
        write!(f, "]")
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
