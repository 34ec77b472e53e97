//! Cross-component scenarios.

use crate::capped::{CappedCursor, Direction, InMemoryCappedStore};
use crate::config::{CommitConfig, CoreConfig, TopologyConfig};
use crate::error::{CoordinatorError, Error, ExecutorError};
use crate::metrics::CoreMetrics;
use crate::node::ShardNode;
use crate::sharding::{ChunkMetadata, ChunkVersion, InMemoryConfigMetadata, ShardKey, ShardKeyPattern};
use crate::testing::ScriptedExecutor;
use crate::txn::{
    CommitDecision, CoordinatorState, CoordinatorStore, InMemoryCoordinatorStore,
    TransactionCoordinator,
};
use crate::types::{ShardId, Timestamp, TxnId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NS: &str = "db.orders";

fn fast_commit() -> CommitConfig {
    CommitConfig::default()
        .with_initial_backoff(Duration::from_millis(1))
        .with_max_backoff(Duration::from_millis(2))
        .with_max_send_attempts(3)
}

fn node_with_chunks(
    shard: &str,
    executor: Arc<ScriptedExecutor>,
    store: Arc<InMemoryCoordinatorStore>,
) -> ShardNode {
    let config = CoreConfig::new(shard)
        .with_commit_config(fast_commit())
        .with_topology_config(TopologyConfig::new(vec!["cfg:27019".into()]));
    let node = ShardNode::new(config, executor, store).unwrap();

    let source = InMemoryConfigMetadata::new();
    source.shard_collection(NS, ShardKeyPattern::new(["order_id"]));
    for start in (0..100i64).step_by(10) {
        source.add_chunk(
            NS,
            ChunkMetadata::new(
                ShardKey::from(start),
                ShardKey::from(start + 10),
                ShardId::from(shard),
                ChunkVersion::new(1, start as u32),
            ),
        );
    }
    node.load_collection(NS, &source).unwrap();
    node
}

/// Routers keep reading while chunks are donated; every answer comes from a
/// complete table.
#[test_log::test]
fn test_routing_during_donations() {
    let node = Arc::new(node_with_chunks(
        "shard0",
        Arc::new(ScriptedExecutor::new()),
        Arc::new(InMemoryCoordinatorStore::new()),
    ));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let node = node.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut routed = 0u64;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    let table = node.sharding().table(NS).unwrap();
                    // Owned chunks stay a contiguous prefix of the key space.
                    let owned: Vec<bool> = (0..100i64)
                        .map(|k| table.belongs_to_me(&ShardKey::from(k)))
                        .collect();
                    let boundary = owned.iter().position(|o| !o).unwrap_or(100);
                    assert!(owned[boundary..].iter().all(|o| !o));
                    routed += 1;
                    if finished {
                        break;
                    }
                }
                routed
            })
        })
        .collect();

    for (i, start) in (0..10i64).rev().map(|c| c * 10).enumerate() {
        node.donate_chunk(
            NS,
            &ShardKey::from(start),
            &ShardKey::from(start + 10),
            ChunkVersion::new(2 + i as u32, 0),
        )
        .unwrap();
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert!(node.sharding().table(NS).unwrap().is_empty());
    assert_eq!(node.metrics().snapshot().chunk_tables_installed, 11);
}

/// A coordinator that gave up delivering its decision leaves the decision
/// durable; recovery on a fresh coordinator finishes the commit.
#[tokio::test]
async fn test_recovery_after_broken_coordinator() {
    let executor = Arc::new(ScriptedExecutor::new());
    let store = Arc::new(InMemoryCoordinatorStore::new());
    let metrics = Arc::new(CoreMetrics::new());
    let shard_b = ShardId::from("b");
    let txn = TxnId::generate(42);

    executor.set_prepare_timestamp(&shard_b, Timestamp::new(50, 3));
    executor.script_commit(
        &shard_b,
        (0..3)
            .map(|_| Err(ExecutorError::Retryable("primary stepped down".into())))
            .collect(),
    );

    let first = TransactionCoordinator::new(
        txn,
        fast_commit(),
        executor.clone(),
        store.clone(),
        metrics.clone(),
    );
    let err = first
        .run_commit(vec![ShardId::from("a"), shard_b.clone()])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Coordinator(CoordinatorError::RetriesExhausted { .. })
    ));
    assert_eq!(first.state_machine().state(), CoordinatorState::Broken);
    assert_eq!(store.len(), 1);

    let outcomes =
        TransactionCoordinator::recover_all(&fast_commit(), executor.clone(), store.clone(), metrics.clone())
            .await
            .unwrap();
    assert_eq!(outcomes.len(), 1);
    let (recovered, decision) = &outcomes[0];
    assert_eq!(*recovered, txn);
    assert_eq!(
        *decision.as_ref().unwrap(),
        CommitDecision::Commit(Timestamp::new(50, 3))
    );
    assert!(store.read_all().await.unwrap().is_empty());

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.txn_broken, 1);
    assert_eq!(snapshot.txn_committed, 1);
}

/// Two nodes coordinate against the same participants and store.
#[tokio::test]
async fn test_independent_transactions_share_store() {
    let executor = Arc::new(ScriptedExecutor::new());
    let store = Arc::new(InMemoryCoordinatorStore::new());
    let node_a = node_with_chunks("a", executor.clone(), store.clone());
    let node_b = node_with_chunks("b", executor.clone(), store.clone());
    let participants = vec![ShardId::from("a"), ShardId::from("b")];

    let (first, second) = tokio::join!(
        node_a.commit_transaction(TxnId::generate(1), participants.clone()),
        node_b.commit_transaction(TxnId::generate(1), participants.clone()),
    );
    assert!(first.unwrap().is_commit());
    assert!(second.unwrap().is_commit());
    assert_eq!(executor.commits(), 4);
    assert!(store.is_empty());
}

/// Readers of a capped collection see each record once, oldest first,
/// even after the collection wrapped several times.
#[test]
fn test_capped_reader_across_wraparound() {
    let mut store = InMemoryCappedStore::with_extents(&[2, 3, 2]).unwrap();
    for i in 0..25u32 {
        store.insert(i.to_be_bytes().to_vec());

        let forward: Vec<u32> = CappedCursor::new(Direction::Forward)
            .iter(&store)
            .map(|id| {
                let bytes = store.get(id).unwrap();
                u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            })
            .collect();

        let oldest = (i + 1).saturating_sub(store.capacity() as u32);
        let expected: Vec<u32> = (oldest..=i).collect();
        assert_eq!(forward, expected);
    }
}
