//! End-to-end behavior of a single chain: local writes, replication through
//! proofs, and reorganization onto new forks.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chainge_log::core::ReorgHint;
use chainge_log::{
    Chain, ChainConfig, ChainError, ChainEvent, Ed25519Signature, PeerId, ProofRequest, Raw,
    Update, UpdateRange, UpdateStatus, Utf8,
};
use chainge_log_testkit::{apply_ops, sync_block, sync_upgrade, ChainOp, TestFixture};
use proptest::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Record every update the chain reports.
fn record<E: chainge_log::Encoding>(chain: &Chain<E>) -> Arc<Mutex<Vec<Update>>> {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    chain.on_update(Some(Arc::new(move |update: &Update| {
        sink.lock().unwrap().push(update.clone());
    })));
    updates
}

fn last(updates: &Arc<Mutex<Vec<Update>>>) -> Update {
    updates.lock().unwrap().last().cloned().expect("no update recorded")
}

fn range(drop: bool, start: u64, length: u64) -> Option<UpdateRange> {
    Some(UpdateRange {
        drop,
        start,
        length,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Local writes
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_append_and_get() -> anyhow::Result<()> {
    init_tracing();
    let fixture = TestFixture::new();
    let chain = fixture.open_writer::<Utf8>().await?;

    assert_eq!(chain.append(&strings(&["hello", "world"])).await?, 0);
    assert_eq!(chain.append(&strings(&["fo", "ooo"])).await?, 2);

    let info = chain.info().await?;
    assert_eq!(info.length, 4);
    assert_eq!(info.byte_length, 14);
    assert_eq!(info.fork, 0);
    assert!(info.writable);

    assert_eq!(chain.get(1).await?, "world");
    assert_eq!(chain.get_range(1, 4).await?, strings(&["world", "fo", "ooo"]));
    assert!(chain.has(3).await?);
    Ok(())
}

#[tokio::test]
async fn test_empty_append_is_a_no_op() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let chain = fixture.open_writer::<Raw>().await?;
    let mut events = chain.subscribe();

    assert_eq!(chain.append(&[]).await?, 0);
    assert_eq!(chain.info().await?.length, 0);
    assert!(events.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_get_out_of_range() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let chain = fixture.open_writer::<Raw>().await?;
    chain.append(&[b"a".to_vec()]).await?;

    assert!(matches!(
        chain.get(5).await,
        Err(ChainError::OutOfRange { index: 5, .. })
    ));
    assert!(matches!(
        chain.get_range(0, 2).await,
        Err(ChainError::OutOfRange { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_info_before_open_is_not_ready() {
    let fixture = TestFixture::new();
    let chain: Chain<Raw> = Chain::new(fixture.writer_config());

    assert!(matches!(chain.try_info(), Err(ChainError::NotReady)));
    assert!(!chain.writable());

    chain.ready().await.unwrap();
    assert_eq!(chain.try_info().unwrap().length, 0);
}

#[tokio::test]
async fn test_replica_cannot_append() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let replica = fixture.open_replica::<Raw>().await?;

    assert!(!replica.writable());
    assert!(matches!(
        replica.append(&[b"a".to_vec()]).await,
        Err(ChainError::NotWritable)
    ));
    assert!(matches!(
        replica.truncate(0, 1).await,
        Err(ChainError::NotWritable)
    ));
    Ok(())
}

#[tokio::test]
async fn test_fresh_chain_without_key_generates_one() -> anyhow::Result<()> {
    let storage = Arc::new(chainge_log::store::MemoryStorage::new());
    let chain: Chain<Utf8> = Chain::open(ChainConfig::new().storage(storage.clone())).await?;
    chain.append(&strings(&["hello"])).await?;
    let public_key = chain.info().await?.public_key;
    chain.close().await?;

    let reopened: Chain<Utf8> = Chain::open(ChainConfig::new().storage(storage)).await?;
    let info = reopened.info().await?;
    assert_eq!(info.public_key, public_key);
    assert!(info.writable);
    assert_eq!(reopened.get(0).await?, "hello");
    Ok(())
}

#[tokio::test]
async fn test_reopen_with_other_key_fails() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let chain = fixture.open_writer::<Raw>().await?;
    chain.close().await?;

    let other = TestFixture::new();
    let result: chainge_log::Result<Chain<Raw>> = Chain::open(
        ChainConfig::new()
            .storage(fixture.writer_storage.clone())
            .public_key(other.public_key()),
    )
    .await;
    assert!(matches!(result, Err(ChainError::InvalidKey)));
    Ok(())
}

#[tokio::test]
async fn test_truncate_records_hints() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let chain = fixture.open_writer::<Utf8>().await?;
    chain
        .append(&strings(&["hello", "world", "fo", "ooo"]))
        .await?;

    chain.truncate(3, 1).await?;
    let info = chain.info().await?;
    assert_eq!((info.length, info.byte_length, info.fork), (3, 12, 1));
    assert_eq!(
        chain.header().await?.hints.reorgs,
        vec![ReorgHint {
            from: 0,
            to: 1,
            ancestors: 3
        }]
    );

    chain.append(&strings(&["a"])).await?;
    assert_eq!(chain.get(3).await?, "a");
    assert_eq!(chain.info().await?.byte_length, 13);
    Ok(())
}

#[tokio::test]
async fn test_repeated_truncates_survive_reopen() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let chain = fixture.open_writer::<Utf8>().await?;
    chain.append(&strings(&["a", "b", "c", "d", "e"])).await?;

    chain.truncate(4, 1).await?;
    chain.truncate(3, 2).await?;
    chain.truncate(2, 2).await?;
    chain.truncate(1, 3).await?;

    let expected = vec![
        ReorgHint {
            from: 0,
            to: 1,
            ancestors: 4,
        },
        ReorgHint {
            from: 1,
            to: 2,
            ancestors: 3,
        },
        ReorgHint {
            from: 2,
            to: 3,
            ancestors: 1,
        },
    ];
    assert_eq!(chain.header().await?.hints.reorgs, expected);
    let tree_hash = chain.tree_hash(1).await?;
    chain.close().await?;

    let reopened = fixture.open_writer::<Utf8>().await?;
    let info = reopened.info().await?;
    assert_eq!((info.length, info.fork), (1, 3));
    assert_eq!(reopened.header().await?.hints.reorgs, expected);
    assert_eq!(reopened.tree_hash(1).await?, tree_hash);
    assert_eq!(reopened.get(0).await?, "a");
    Ok(())
}

#[tokio::test]
async fn test_user_data() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let chain = fixture.open_writer::<Raw>().await?;

    chain.user_data("hello", Some(Bytes::from("world"))).await?;
    chain.user_data("hej", Some(Bytes::from("verden"))).await?;
    chain.user_data("hello", Some(Bytes::from("welt"))).await?;
    assert_eq!(chain.get_user_data("hello").await?, Some(Bytes::from("welt")));

    chain.user_data("hello", None).await?;
    assert_eq!(chain.get_user_data("hello").await?, None);
    chain.user_data("hello", Some(Bytes::from("world"))).await?;
    chain.close().await?;

    let reopened = fixture.open_writer::<Raw>().await?;
    let keys: Vec<String> = reopened
        .header()
        .await?
        .user_data
        .into_iter()
        .map(|entry| entry.key)
        .collect();
    assert_eq!(keys, vec!["hej".to_string(), "hello".to_string()]);
    assert_eq!(
        reopened.get_user_data("hej").await?,
        Some(Bytes::from("verden"))
    );
    Ok(())
}

#[tokio::test]
async fn test_concurrent_appends_are_totally_ordered() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let chain = fixture.open_writer::<Raw>().await?;

    let mut tasks = Vec::new();
    for i in 0..16u8 {
        let chain = chain.clone();
        tasks.push(tokio::spawn(async move {
            let first = chain.append(&[vec![i], vec![i]]).await?;
            Ok::<_, ChainError>((i, first))
        }));
    }

    let mut firsts = Vec::new();
    for task in tasks {
        let (i, first) = task.await??;
        assert_eq!(chain.get(first).await?, vec![i]);
        assert_eq!(chain.get(first + 1).await?, vec![i]);
        firsts.push(first);
    }

    firsts.sort_unstable();
    assert_eq!(firsts, (0..16).map(|i| i * 2).collect::<Vec<u64>>());
    assert_eq!(chain.info().await?.length, 32);
    Ok(())
}

#[tokio::test]
async fn test_snapshot_is_frozen() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let chain = fixture.open_writer::<Utf8>().await?;
    chain.append(&strings(&["a", "b"])).await?;

    let snapshot = chain.snapshot().await?;
    chain.append(&strings(&["c"])).await?;

    assert_eq!(snapshot.length(), 2);
    assert_eq!(snapshot.root_hash(), chain.tree_hash(2).await?);
    assert_eq!(snapshot.get(1).await?, "b");
    assert!(matches!(
        snapshot.get(2).await,
        Err(ChainError::OutOfRange { index: 2, length: 2 })
    ));
    Ok(())
}

#[tokio::test]
async fn test_events_follow_mutations() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let chain = fixture.open_writer::<Utf8>().await?;
    let mut events = chain.subscribe();

    chain.append(&strings(&["hello", "world"])).await?;
    assert_eq!(
        events.recv().await?,
        ChainEvent::Append {
            length: 2,
            byte_length: 10
        }
    );

    chain.truncate(1, 1).await?;
    assert_eq!(
        events.recv().await?,
        ChainEvent::Truncate {
            ancestors: 1,
            fork: 1
        }
    );

    chain.close().await?;
    assert_eq!(events.recv().await?, ChainEvent::Close { last: true });
    assert!(matches!(chain.info().await, Err(ChainError::Closed)));
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Replication
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_verify_replicates_signed_head() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let writer = fixture.open_writer::<Utf8>().await?;
    let replica = fixture.open_replica::<Utf8>().await?;

    writer.append(&strings(&["a", "b", "c", "d", "e"])).await?;
    let status = sync_upgrade(&writer, &replica).await?;
    assert_eq!(status.status(), 0b01);

    let head = writer.header().await?.tree;
    assert_eq!(replica.header().await?.tree, head);
    assert!(!replica.has(2).await?);
    assert!(matches!(
        replica.get(2).await,
        Err(ChainError::Store(chainge_log::store::StoreError::NotFound(_)))
    ));

    for index in 0..5 {
        sync_block(&writer, &replica, index).await?;
    }
    assert_eq!(
        replica.get_range(0, 5).await?,
        strings(&["a", "b", "c", "d", "e"])
    );
    assert_eq!(replica.info().await?.byte_length, 5);
    Ok(())
}

#[tokio::test]
async fn test_verify_parallel_upgrades_converge() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let writer = fixture.open_writer::<Raw>().await?;
    let replica = fixture.open_replica::<Raw>().await?;

    writer
        .append(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()])
        .await?;
    let first = writer.proof(&ProofRequest::upgrade(0, 2)).await?;
    let second = writer.proof(&ProofRequest::upgrade(0, 3)).await?;

    let (a, b) = tokio::join!(replica.verify(&first, None), replica.verify(&second, None));
    let outcomes = [a?, b?];
    assert_eq!(outcomes.iter().filter(|s| !s.is_stale()).count(), 1);

    assert_eq!(replica.header().await?.tree, writer.header().await?.tree);
    Ok(())
}

#[tokio::test]
async fn test_verify_rejects_tampered_value() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let writer = fixture.open_writer::<Raw>().await?;
    let replica = fixture.open_replica::<Raw>().await?;
    writer
        .append(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()])
        .await?;

    let mut proof = writer
        .proof(&ProofRequest::block(1, 0, true).with_upgrade(0, 4))
        .await?;
    if let Some(block) = proof.block.as_mut() {
        block.value = Some(Bytes::from("x"));
    }

    assert!(matches!(
        replica.verify(&proof, None).await,
        Err(ChainError::Verification(_))
    ));
    assert_eq!(replica.info().await?.length, 0);
    Ok(())
}

#[tokio::test]
async fn test_verify_rejects_forged_signature() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let writer = fixture.open_writer::<Raw>().await?;
    let replica = fixture.open_replica::<Raw>().await?;
    writer.append(&[b"a".to_vec(), b"b".to_vec()]).await?;

    let mut proof = writer.proof(&ProofRequest::upgrade(0, 2)).await?;
    if let Some(upgrade) = proof.upgrade.as_mut() {
        upgrade.signature = Ed25519Signature::from_bytes([1; 64]);
    }
    assert!(matches!(
        replica.verify(&proof, None).await,
        Err(ChainError::Verification(_))
    ));

    let stranger = TestFixture::new().open_writer::<Raw>().await?;
    stranger.append(&[b"a".to_vec(), b"b".to_vec()]).await?;
    let foreign = stranger.proof(&ProofRequest::upgrade(0, 2)).await?;
    assert!(matches!(
        replica.verify(&foreign, None).await,
        Err(ChainError::Verification(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_proof_round_trips_through_bytes() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let writer = fixture.open_writer::<Raw>().await?;
    let replica = fixture.open_replica::<Raw>().await?;
    writer.append(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]).await?;

    let proof = writer
        .proof(&ProofRequest::block(2, 0, true).with_upgrade(0, 3))
        .await?;
    let decoded = chainge_log::Proof::from_bytes(&proof.to_bytes()?)?;
    replica.verify(&decoded, None).await?;

    assert_eq!(replica.get(2).await?, b"c".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_update_hook_sequence() -> anyhow::Result<()> {
    init_tracing();
    let fixture = TestFixture::new();
    let writer = fixture.open_writer::<Utf8>().await?;
    let clone = fixture.open_replica::<Utf8>().await?;
    let writer_updates = record(&writer);
    let clone_updates = record(&clone);
    let peer = PeerId::from_bytes([7; 32]);

    writer.append(&strings(&["a", "b", "c", "d"])).await?;
    assert_eq!(
        last(&writer_updates),
        Update {
            status: 0b01,
            range: range(false, 0, 4),
            value: None,
            from: None,
        }
    );

    // Block 1 with an upgrade to the head.
    let proof = writer
        .proof(&ProofRequest::block(1, 0, true).with_upgrade(0, 2))
        .await?;
    let status = clone.verify(&proof, Some(peer)).await?;
    assert_eq!(status.status(), 0b01);
    assert_eq!(
        last(&clone_updates),
        Update {
            status: 0b01,
            range: range(false, 1, 1),
            value: Some(Bytes::from("b")),
            from: Some(peer),
        }
    );

    // Block 3 with only the nodes the clone lacks.
    let nodes = clone.missing_nodes(6).await?;
    let proof = writer
        .proof(&ProofRequest::block(3, nodes as u32, true))
        .await?;
    clone.verify(&proof, Some(peer)).await?;
    assert_eq!(
        last(&clone_updates),
        Update {
            status: 0b00,
            range: range(false, 3, 1),
            value: Some(Bytes::from("d")),
            from: Some(peer),
        }
    );

    writer.truncate(1, 1).await?;
    assert_eq!(
        last(&writer_updates),
        Update {
            status: 0b10,
            range: range(true, 1, 3),
            value: None,
            from: None,
        }
    );

    writer.append(&strings(&["e"])).await?;
    assert_eq!(
        last(&writer_updates),
        Update {
            status: 0b01,
            range: range(false, 1, 1),
            value: None,
            from: None,
        }
    );

    let proof = writer
        .proof(&ProofRequest::block(0, 0, false).with_upgrade(0, 2))
        .await?;
    let descriptor = clone
        .compute_reorg(&proof)
        .await?
        .expect("proof from a newer fork");
    clone.reorg(&descriptor, Some(peer)).await?;
    assert_eq!(
        last(&clone_updates),
        Update {
            status: 0b11,
            range: range(true, 1, 3),
            value: None,
            from: Some(peer),
        }
    );

    writer.truncate(1, 2).await?;
    assert_eq!(
        last(&writer_updates),
        Update {
            status: 0b10,
            range: range(true, 1, 1),
            value: None,
            from: None,
        }
    );

    let proof = writer
        .proof(&ProofRequest::block(0, 0, false).with_upgrade(0, 1))
        .await?;
    let descriptor = clone
        .compute_reorg(&proof)
        .await?
        .expect("proof from a newer fork");
    clone.reorg(&descriptor, Some(peer)).await?;
    assert_eq!(
        last(&clone_updates),
        Update {
            status: 0b10,
            range: range(true, 1, 1),
            value: None,
            from: Some(peer),
        }
    );

    let info = clone.info().await?;
    assert_eq!((info.length, info.fork), (1, 2));
    assert_eq!(clone.tree_hash(1).await?, writer.tree_hash(1).await?);
    assert_eq!(clone.header().await?.hints.reorgs.len(), 2);
    assert_eq!(writer_updates.lock().unwrap().len(), 4);
    assert_eq!(clone_updates.lock().unwrap().len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_verify_reorganizes_onto_new_fork() -> anyhow::Result<()> {
    let fixture = TestFixture::new();
    let writer = fixture.open_writer::<Utf8>().await?;
    let replica = fixture.open_replica::<Utf8>().await?;
    let mut events = replica.subscribe();

    writer.append(&strings(&["a", "b", "c"])).await?;
    sync_upgrade(&writer, &replica).await?;
    for index in 0..3 {
        sync_block(&writer, &replica, index).await?;
    }
    events.recv().await?;

    writer.truncate(2, 1).await?;
    writer.append(&strings(&["x", "y"])).await?;

    // The block path lets the replica see that blocks 0 and 1 are shared.
    let proof = writer
        .proof(&ProofRequest::block(0, 0, false).with_upgrade(0, 4))
        .await?;
    let status = replica.verify(&proof, None).await?;

    assert!(matches!(status, UpdateStatus::Applied { .. }));
    assert_eq!(status.status(), 0b11);
    assert_eq!(
        events.recv().await?,
        ChainEvent::Truncate {
            ancestors: 2,
            fork: 1
        }
    );
    assert_eq!(replica.header().await?.tree, writer.header().await?.tree);

    assert_eq!(replica.get(1).await?, "b");
    assert!(!replica.has(2).await?);

    sync_block(&writer, &replica, 3).await?;
    assert_eq!(replica.get(3).await?, "y");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_blocks_read_back_after_reopen(ops in prop::collection::vec(any::<ChainOp>(), 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let fixture = TestFixture::new();
            let chain = fixture.open_writer::<Raw>().await.unwrap();
            let expected = apply_ops(&chain, &ops).await.unwrap();

            let info = chain.info().await.unwrap();
            assert_eq!(info.length, expected.len() as u64);
            assert_eq!(
                info.byte_length,
                expected.iter().map(|b| b.len() as u64).sum::<u64>()
            );
            for (index, block) in expected.iter().enumerate() {
                assert_eq!(&chain.get(index as u64).await.unwrap(), block);
            }
            let head = chain.header().await.unwrap().tree;
            chain.close().await.unwrap();

            let reopened = fixture.open_writer::<Raw>().await.unwrap();
            assert_eq!(reopened.header().await.unwrap().tree, head);
            assert_eq!(
                reopened.get_range(0, expected.len() as u64).await.unwrap(),
                expected
            );
        });
    }

    #[test]
    fn prop_replica_matches_writer(ops in prop::collection::vec(any::<ChainOp>(), 1..8)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let fixture = TestFixture::new();
            let writer = fixture.open_writer::<Raw>().await.unwrap();
            let replica = fixture.open_replica::<Raw>().await.unwrap();

            let expected = apply_ops(&writer, &ops).await.unwrap();
            if expected.is_empty() {
                return;
            }
            sync_upgrade(&writer, &replica).await.unwrap();
            for index in 0..expected.len() as u64 {
                sync_block(&writer, &replica, index).await.unwrap();
            }

            assert_eq!(replica.header().await.unwrap().tree, writer.header().await.unwrap().tree);
            assert_eq!(
                replica.get_range(0, expected.len() as u64).await.unwrap(),
                expected
            );
        });
    }
}
