//! The durable log store and state machine interfaces consumed by the
//! membership core.

use std::any::Any;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::message::Entry;
use crate::NodeId;

/// A record holding the hard state of a Raft node.
///
/// This model derives serde's traits for easily (de)serializing this
/// model for storage & retrieval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// A trait defining the interface to the durable log store.
///
/// Log indices are 1-based and contiguous. `start_index` moves forward as the
/// log is compacted; entries below it are only reachable through a snapshot.
#[async_trait]
pub trait RaftStorage: Send + Sync + 'static {
    /// Append a new entry at the next free slot, returning the slot it was
    /// written to.
    async fn append_entry(&self, entry: Entry) -> Result<u64>;

    /// Pack up to `max_entries` consecutive entries starting at `start` into
    /// one opaque payload for shipping to a catching-up member.
    async fn pack_entries(&self, start: u64, max_entries: u64) -> Result<Vec<u8>>;

    /// Unpack a payload produced by `pack_entries` and write its entries into
    /// the log starting at `start`, overwriting any existing entries there.
    async fn apply_pack(&self, start: u64, pack: Vec<u8>) -> Result<()>;

    /// The earliest log index still retained by the store.
    async fn start_index(&self) -> Result<u64>;

    /// The index one past the last entry in the log.
    async fn next_slot(&self) -> Result<u64>;

    /// Persist the node's hard state.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;
}

/// The slice of the application state machine the membership core talks to.
pub trait StateMachine: Send + Sync + 'static {
    /// Release an opaque snapshot context previously created by the
    /// application for a snapshot transfer.
    ///
    /// The membership core guarantees this is called exactly once per
    /// context, on whichever path first decides the owning peer is no longer
    /// joining.
    fn release_snapshot_ctx(&self, ctx: Box<dyn Any + Send>);
}
