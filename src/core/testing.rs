//! Test fixtures for the membership core: an in-memory log store, a
//! recording network and a recording state machine.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::config::Config;
use crate::core::MembershipCore;
use crate::membership::ClusterConfig;
use crate::membership::Member;
use crate::message::AddServerRequest;
use crate::message::Entry;
use crate::message::JoinClusterRequest;
use crate::message::LeaveClusterRequest;
use crate::message::RemoveServerRequest;
use crate::message::SnapshotSyncRequest;
use crate::message::SyncLogRequest;
use crate::metrics::MembershipMetrics;
use crate::network::RaftNetwork;
use crate::storage::HardState;
use crate::storage::RaftStorage;
use crate::storage::StateMachine;
use crate::NodeId;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn member(id: NodeId) -> Member {
    Member::new(id, format!("h{}:9000", id))
}

pub(crate) fn add_req(member: Member) -> AddServerRequest {
    AddServerRequest {
        entries: vec![Entry::new_member(1, member)],
    }
}

pub(crate) fn remove_req(id: NodeId) -> RemoveServerRequest {
    RemoveServerRequest {
        entries: vec![Entry::new_remove_member(1, id)],
    }
}

#[derive(Default)]
struct MemStoreInner {
    start: u64,
    entries: BTreeMap<u64, Entry>,
}

/// An in-memory log store. Packs are serialized entry batches.
pub(crate) struct MemStore {
    inner: Mutex<MemStoreInner>,
    hard_state: Mutex<Option<HardState>>,
}

impl MemStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(MemStoreInner {
                start: 1,
                entries: BTreeMap::new(),
            }),
            hard_state: Mutex::new(None),
        }
    }

    /// Append `n` normal entries of the given term.
    pub(crate) async fn seed(&self, term: u64, n: u64) {
        for i in 0..n {
            self.append_entry(Entry::new_normal(term, format!("payload-{}", i).into_bytes()))
                .await
                .unwrap();
        }
    }

    /// Simulate log compaction up to (but excluding) `start`.
    pub(crate) fn compact_to(&self, start: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries = inner.entries.split_off(&start);
        inner.start = start;
    }

    pub(crate) fn entry(&self, idx: u64) -> Option<Entry> {
        self.inner.lock().unwrap().entries.get(&idx).cloned()
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub(crate) fn hard_state(&self) -> Option<HardState> {
        self.hard_state.lock().unwrap().clone()
    }
}

#[async_trait]
impl RaftStorage for MemStore {
    async fn append_entry(&self, entry: Entry) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.entries.keys().next_back().map(|k| k + 1).unwrap_or(inner.start);
        inner.entries.insert(slot, entry);
        Ok(slot)
    }

    async fn pack_entries(&self, start: u64, max_entries: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let mut batch = Vec::new();
        for idx in start.. {
            if batch.len() as u64 >= max_entries {
                break;
            }
            match inner.entries.get(&idx) {
                Some(entry) => batch.push(entry.clone()),
                None => break,
            }
        }
        Ok(serde_json::to_vec(&batch)?)
    }

    async fn apply_pack(&self, start: u64, pack: Vec<u8>) -> Result<()> {
        let batch: Vec<Entry> = serde_json::from_slice(&pack)?;
        let mut inner = self.inner.lock().unwrap();
        for (i, entry) in batch.into_iter().enumerate() {
            inner.entries.insert(start + i as u64, entry);
        }
        Ok(())
    }

    async fn start_index(&self) -> Result<u64> {
        Ok(self.inner.lock().unwrap().start)
    }

    async fn next_slot(&self) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.keys().next_back().map(|k| k + 1).unwrap_or(inner.start))
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hard_state.lock().unwrap() = Some(hs.clone());
        Ok(())
    }
}

/// An RPC recorded by the mock network.
#[derive(Debug)]
pub(crate) enum SentRpc {
    Join(NodeId, JoinClusterRequest),
    SyncLog(NodeId, SyncLogRequest),
    Snapshot(NodeId, SnapshotSyncRequest),
    Leave(NodeId, LeaveClusterRequest),
}

/// A network that records every RPC handed to it.
#[derive(Default)]
pub(crate) struct MockNetwork {
    sent: Mutex<Vec<SentRpc>>,
}

impl MockNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn take_sent(&self) -> Vec<SentRpc> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl RaftNetwork for MockNetwork {
    async fn send_join_cluster(&self, target: NodeId, rpc: JoinClusterRequest) -> Result<()> {
        self.sent.lock().unwrap().push(SentRpc::Join(target, rpc));
        Ok(())
    }

    async fn send_sync_log(&self, target: NodeId, rpc: SyncLogRequest) -> Result<()> {
        self.sent.lock().unwrap().push(SentRpc::SyncLog(target, rpc));
        Ok(())
    }

    async fn send_snapshot_sync(&self, target: NodeId, rpc: SnapshotSyncRequest) -> Result<()> {
        self.sent.lock().unwrap().push(SentRpc::Snapshot(target, rpc));
        Ok(())
    }

    async fn send_leave_cluster(&self, target: NodeId, rpc: LeaveClusterRequest) -> Result<()> {
        self.sent.lock().unwrap().push(SentRpc::Leave(target, rpc));
        Ok(())
    }
}

/// A state machine that records released snapshot contexts.
#[derive(Default)]
pub(crate) struct RecordingStateMachine {
    released: Mutex<Vec<Box<dyn Any + Send>>>,
}

impl RecordingStateMachine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn released_count(&self) -> usize {
        self.released.lock().unwrap().len()
    }
}

impl StateMachine for RecordingStateMachine {
    fn release_snapshot_ctx(&self, ctx: Box<dyn Any + Send>) {
        self.released.lock().unwrap().push(ctx);
    }
}

/// A membership core wired to recording collaborators.
pub(crate) struct Fixture {
    pub(crate) core: MembershipCore<MockNetwork, MemStore, RecordingStateMachine>,
    pub(crate) network: Arc<MockNetwork>,
    pub(crate) storage: Arc<MemStore>,
    pub(crate) state_machine: Arc<RecordingStateMachine>,
    pub(crate) rx_replicate: mpsc::UnboundedReceiver<()>,
    pub(crate) rx_metrics: watch::Receiver<MembershipMetrics>,
}

pub(crate) fn default_config() -> Config {
    Config::build("test-cluster".into()).validate().unwrap()
}

/// A node with the given initial members, not yet leader.
pub(crate) fn node_with_config(id: NodeId, member_ids: &[NodeId], config: Config) -> Fixture {
    init_tracing();
    let members = member_ids.iter().map(|&m| member(m)).collect::<Vec<_>>();
    let initial = if members.is_empty() {
        ClusterConfig::default()
    } else {
        ClusterConfig::new(1, 0).with_members(members)
    };

    let (tx_replicate, rx_replicate) = mpsc::unbounded_channel();
    let network = Arc::new(MockNetwork::new());
    let storage = Arc::new(MemStore::new());
    let state_machine = Arc::new(RecordingStateMachine::new());
    let (core, rx_metrics) = MembershipCore::new(
        id,
        Arc::new(config),
        initial,
        0,
        network.clone(),
        storage.clone(),
        state_machine.clone(),
        tx_replicate,
    );
    Fixture {
        core,
        network,
        storage,
        state_machine,
        rx_replicate,
        rx_metrics,
    }
}

/// A three-member cluster `{1, 2, 3}` with node 1 as leader in term 1.
pub(crate) fn three_member_leader() -> Fixture {
    let mut f = node_with_config(1, &[1, 2, 3], default_config());
    f.core.assume_leadership(1);
    f
}

/// A two-member cluster `{1, 2}` with node 1 as leader in term 1.
pub(crate) fn two_member_leader() -> Fixture {
    let mut f = node_with_config(1, &[1, 2], default_config());
    f.core.assume_leadership(1);
    f
}

/// A pristine node with an empty configuration.
pub(crate) fn fresh_node(id: NodeId) -> Fixture {
    node_with_config(id, &[], default_config())
}
