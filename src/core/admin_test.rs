use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::core::testing;
use crate::core::testing::add_req;
use crate::core::testing::member;
use crate::core::testing::remove_req;
use crate::core::testing::SentRpc;
use crate::core::ChangeState;
use crate::membership::ClusterConfig;
use crate::message::AddServerRequest;
use crate::message::Entry;
use crate::message::EntryPayload;
use crate::message::RemoveServerRequest;
use crate::message::ResultCode;
use crate::metrics::ChangeKind;
use crate::peer::SnapshotSyncContext;

#[tokio::test]
async fn test_add_server_accepts_and_invites() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();
    f.storage.seed(1, 5).await;
    f.core.commit_state().set_commit_index(5);

    let resp = f.core.handle_add_server_request(add_req(member(4))).await?;

    assert!(resp.accepted);
    assert_eq!(resp.result, ResultCode::Ok);
    assert_eq!(resp.next_index, 6);
    assert_eq!(f.core.joining_member_id(), Some(4));
    assert_eq!(f.rx_metrics.borrow().change, ChangeKind::Adding(4));

    let sent = f.network.take_sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        SentRpc::Join(target, req) => {
            assert_eq!(*target, 4);
            assert_eq!(req.leader_id, 1);
            assert_eq!(req.term, 1);
            assert_eq!(req.last_log_index, 5);
            assert_eq!(req.commit_index, 5);
            assert_eq!(req.entries.len(), 1);
            match &req.entries[0].payload {
                EntryPayload::Config(config) => {
                    assert_eq!(config.members().len(), 3);
                    assert!(config.contains(1) && config.contains(2) && config.contains(3));
                }
                other => panic!("expected a config entry, got {:?}", other),
            }
        }
        other => panic!("expected a join rpc, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_add_server_rejects_malformed_payload() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();

    let resp = f.core.handle_add_server_request(AddServerRequest { entries: vec![] }).await?;
    assert!(!resp.accepted);
    assert_eq!(resp.result, ResultCode::BadRequest);

    let resp = f
        .core
        .handle_add_server_request(AddServerRequest {
            entries: vec![Entry::new_member(1, member(4)), Entry::new_member(1, member(5))],
        })
        .await?;
    assert_eq!(resp.result, ResultCode::BadRequest);

    let resp = f
        .core
        .handle_add_server_request(AddServerRequest {
            entries: vec![Entry::new_normal(1, b"nope".to_vec())],
        })
        .await?;
    assert_eq!(resp.result, ResultCode::BadRequest);

    assert_eq!(f.network.sent_count(), 0);
    assert_eq!(f.core.joining_member_id(), None);
    Ok(())
}

#[tokio::test]
async fn test_add_server_rejects_non_leader() -> anyhow::Result<()> {
    let mut f = testing::node_with_config(1, &[1, 2, 3], testing::default_config());

    let resp = f.core.handle_add_server_request(add_req(member(4))).await?;
    assert_eq!(resp.result, ResultCode::NotLeader);
    assert_eq!(f.network.sent_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_add_server_rejects_when_writes_paused() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();
    f.core.set_write_paused(true);

    let resp = f.core.handle_add_server_request(add_req(member(4))).await?;
    assert_eq!(resp.result, ResultCode::NotLeader);
    Ok(())
}

#[tokio::test]
async fn test_add_server_rejects_duplicate_id() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();

    // an existing peer
    let resp = f.core.handle_add_server_request(add_req(member(2))).await?;
    assert_eq!(resp.result, ResultCode::ServerAlreadyExists);

    // the leader itself
    let resp = f.core.handle_add_server_request(add_req(member(1))).await?;
    assert_eq!(resp.result, ResultCode::ServerAlreadyExists);

    assert_eq!(f.core.peer_ids(), vec![2, 3]);
    assert_eq!(f.core.cluster_config().members().len(), 3);
    assert_eq!(f.network.sent_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_add_server_rejects_while_config_changing() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();
    f.core.uncommitted_config = Some(Arc::new(
        ClusterConfig::new(4, 1).with_members(vec![member(1), member(2)]),
    ));

    let resp = f.core.handle_add_server_request(add_req(member(4))).await?;
    assert_eq!(resp.result, ResultCode::ConfigChanging);
    assert_eq!(f.network.sent_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_add_server_rejects_while_remove_in_progress() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();
    let resp = f.core.handle_remove_server_request(remove_req(3)).await?;
    assert!(resp.accepted);
    f.network.take_sent();

    let resp = f.core.handle_add_server_request(add_req(member(4))).await?;
    assert_eq!(resp.result, ResultCode::ConfigChanging);
    assert_eq!(f.network.sent_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_add_server_rejects_while_recent_join_in_progress() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();
    let resp = f.core.handle_add_server_request(add_req(member(4))).await?;
    assert!(resp.accepted);
    f.network.take_sent();

    let resp = f.core.handle_add_server_request(add_req(member(5))).await?;
    assert_eq!(resp.result, ResultCode::ServerIsJoining);
    assert_eq!(f.core.joining_member_id(), Some(4));
    assert_eq!(f.network.sent_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_add_server_supersedes_stale_join() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();
    let resp = f.core.handle_add_server_request(add_req(member(4))).await?;
    assert!(resp.accepted);
    f.network.take_sent();

    // the joining member goes silent past the liveness window, holding a
    // snapshot context
    if let ChangeState::AddInProgress { peer, .. } = &mut f.core.change {
        peer.set_snapshot_ctx(SnapshotSyncContext::new(Box::new(42u32)));
        peer.rewind_activity(Duration::from_secs(60));
    } else {
        panic!("expected an add in progress");
    }

    let resp = f.core.handle_add_server_request(add_req(member(5))).await?;
    assert!(resp.accepted);
    assert_eq!(f.core.joining_member_id(), Some(5));
    // the stale attempt released its snapshot context exactly once
    assert_eq!(f.state_machine.released_count(), 1);

    let sent = f.network.take_sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], SentRpc::Join(5, _)));
    Ok(())
}

#[tokio::test]
async fn test_remove_server_accepts_and_instructs_leave() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();
    f.storage.seed(1, 5).await;
    f.core.commit_state().set_commit_index(5);

    let resp = f.core.handle_remove_server_request(remove_req(3)).await?;

    assert!(resp.accepted);
    assert_eq!(resp.result, ResultCode::Ok);
    assert_eq!(resp.next_index, 6);
    assert!(f.core.peer(3).unwrap().is_leaving());
    // a leave instruction does not stop heartbeats; step-down happens only
    // when the configuration is actually derived
    assert!(f.core.peer(3).unwrap().is_heartbeat_enabled());
    assert_eq!(f.rx_metrics.borrow().change, ChangeKind::Removing(3));

    let sent = f.network.take_sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        SentRpc::Leave(target, req) => {
            assert_eq!(*target, 3);
            assert_eq!(req.leader_id, 1);
            assert_eq!(req.last_log_index, 5);
            assert_eq!(req.commit_index, 5);
        }
        other => panic!("expected a leave rpc, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_remove_server_rejects_malformed_payload() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();

    let resp = f
        .core
        .handle_remove_server_request(RemoveServerRequest { entries: vec![] })
        .await?;
    assert_eq!(resp.result, ResultCode::BadRequest);

    let resp = f
        .core
        .handle_remove_server_request(RemoveServerRequest {
            entries: vec![Entry::new_member(1, member(3))],
        })
        .await?;
    assert_eq!(resp.result, ResultCode::BadRequest);
    Ok(())
}

#[tokio::test]
async fn test_remove_server_rejects_non_leader() -> anyhow::Result<()> {
    let mut f = testing::node_with_config(1, &[1, 2, 3], testing::default_config());

    let resp = f.core.handle_remove_server_request(remove_req(3)).await?;
    assert_eq!(resp.result, ResultCode::NotLeader);
    Ok(())
}

#[tokio::test]
async fn test_remove_server_rejects_while_config_changing() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();
    f.core.uncommitted_config = Some(Arc::new(
        ClusterConfig::new(4, 1).with_members(vec![member(1), member(2), member(3), member(4)]),
    ));

    let resp = f.core.handle_remove_server_request(remove_req(3)).await?;
    assert_eq!(resp.result, ResultCode::ConfigChanging);
    Ok(())
}

#[tokio::test]
async fn test_remove_server_rejects_while_add_in_progress() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();
    let resp = f.core.handle_add_server_request(add_req(member(4))).await?;
    assert!(resp.accepted);
    f.network.take_sent();

    let resp = f.core.handle_remove_server_request(remove_req(3)).await?;
    assert_eq!(resp.result, ResultCode::ConfigChanging);
    assert_eq!(f.network.sent_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_remove_server_rejects_leader_itself() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();

    let resp = f.core.handle_remove_server_request(remove_req(1)).await?;
    assert_eq!(resp.result, ResultCode::CannotRemoveLeader);
    assert_eq!(f.core.peer_ids(), vec![2, 3]);
    assert_eq!(f.network.sent_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_remove_server_rejects_unknown_target() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();

    let resp = f.core.handle_remove_server_request(remove_req(9)).await?;
    assert_eq!(resp.result, ResultCode::ServerNotFound);
    Ok(())
}

#[tokio::test]
async fn test_remove_server_repeat_is_idempotent() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();

    let resp = f.core.handle_remove_server_request(remove_req(3)).await?;
    assert!(resp.accepted);

    // the target stays silent; a repeated remove re-sends the instruction
    // without restarting liveness tracking
    if let Some(peer) = f.core.peers.get_mut(&3) {
        peer.rewind_activity(Duration::from_secs(5));
    }

    let resp = f.core.handle_remove_server_request(remove_req(3)).await?;
    assert!(resp.accepted);
    assert!(f.core.peer(3).unwrap().is_leaving());
    assert!(f.core.peer(3).unwrap().active_duration() >= Duration::from_secs(5));

    let sent = f.network.take_sent();
    assert_eq!(sent.len(), 2);
    assert!(matches!(&sent[0], SentRpc::Leave(3, _)));
    assert!(matches!(&sent[1], SentRpc::Leave(3, _)));
    Ok(())
}

#[tokio::test]
async fn test_remove_server_rejects_second_target_while_removing() -> anyhow::Result<()> {
    let mut f = testing::three_member_leader();

    let resp = f.core.handle_remove_server_request(remove_req(3)).await?;
    assert!(resp.accepted);
    f.network.take_sent();

    let resp = f.core.handle_remove_server_request(remove_req(2)).await?;
    assert_eq!(resp.result, ResultCode::ConfigChanging);
    assert!(!f.core.peer(2).unwrap().is_leaving());
    assert_eq!(f.network.sent_count(), 0);
    Ok(())
}
