//! Fork database integration tests.

use instafin_chain::{ForkDatabase, ForkDbError};
use instafin_types::{
    BlockHeader, BlockHeaderState, BlockHeaderStateInput, BlockId, BlockNum, BlockTimestamp,
    BlsKeyPair, Digest, FinalityCore, FinalizerAuthority, FinalizerPolicy, IncrementalMerkle,
    ProducerId, ProposerPolicy,
};
use std::sync::{Arc, Mutex};

fn genesis_state() -> BlockHeaderState {
    let keypairs: Vec<_> = (0..4u8).map(|i| BlsKeyPair::from_seed(&[i + 1; 32])).collect();
    let header = BlockHeader {
        timestamp: BlockTimestamp(0),
        producer: ProducerId(1),
        previous: BlockId::ZERO,
        transaction_mroot: Digest::ZERO,
        action_mroot: Digest::ZERO,
        schedule_version: 1,
        header_extensions: vec![],
    };
    BlockHeaderState {
        id: header.calculate_id(),
        header,
        core: FinalityCore::default(),
        proposal_mtree: IncrementalMerkle::new(),
        finality_mtree: IncrementalMerkle::new(),
        finalizer_policy: FinalizerPolicy {
            generation: 1,
            threshold: 3,
            finalizers: keypairs
                .iter()
                .enumerate()
                .map(|(i, kp)| FinalizerAuthority {
                    description: format!("f{i}"),
                    weight: 1,
                    public_key: kp.public_key(),
                })
                .collect(),
        },
        proposer_policy: ProposerPolicy {
            schedule_version: 1,
            proposer_schedule: vec![ProducerId(1), ProducerId(2)],
        },
    }
}

/// Build a child state; `slot` differentiates competing forks.
fn child(parent: &BlockHeaderState, slot: u64, producer: u64) -> Arc<BlockHeaderState> {
    Arc::new(
        parent
            .next(BlockHeaderStateInput {
                parent_id: parent.id,
                timestamp: BlockTimestamp(slot),
                producer: ProducerId(producer),
                transaction_mroot: Digest::ZERO,
                action_mroot: Digest::ZERO,
                new_proposer_policy: None,
                new_finalizer_policy: None,
                qc_info: None,
            })
            .unwrap(),
    )
}

fn new_db() -> (ForkDatabase, tempfile::TempDir, Arc<BlockHeaderState>) {
    let dir = tempfile::tempdir().unwrap();
    let db = ForkDatabase::new(dir.path());
    let root = genesis_state();
    db.reset(root.clone());
    let root = db.root().unwrap();
    (db, dir, root)
}

#[test]
fn test_add_requires_known_parent() {
    let (db, _dir, root) = new_db();

    let a1 = child(&root, 1, 1);
    let a2 = child(&a1, 2, 2);

    // Grandchild before child: parent is missing.
    match db.add(a2.clone(), false) {
        Err(ForkDbError::BlockNotFound(id)) => assert_eq!(id, a1.id),
        other => panic!("expected BlockNotFound, got {other:?}"),
    }

    db.add(a1, false).unwrap();
    db.add(a2, false).unwrap();
}

#[test]
fn test_duplicate_add() {
    let (db, _dir, root) = new_db();
    let a1 = child(&root, 1, 1);

    db.add(a1.clone(), false).unwrap();
    assert!(matches!(
        db.add(a1.clone(), false),
        Err(ForkDbError::Duplicate(_))
    ));
    // Identical duplicate is tolerated when requested.
    db.add(a1, true).unwrap();
}

#[test]
fn test_head_tracks_validated_nodes_only() {
    let (db, _dir, root) = new_db();
    let a1 = child(&root, 1, 1);
    let a2 = child(&a1, 2, 2);

    db.add(a1.clone(), false).unwrap();
    db.add(a2.clone(), false).unwrap();

    // Nothing validated yet: head is the root, pending head is the tip.
    assert_eq!(db.head().unwrap().id, root.id);
    assert_eq!(db.pending_head().unwrap().id, a2.id);

    db.mark_valid(&a1).unwrap();
    assert_eq!(db.head().unwrap().id, a1.id);

    db.mark_valid(&a2).unwrap();
    assert_eq!(db.head().unwrap().id, a2.id);
}

#[test]
fn test_head_tie_break_prefers_earliest_timestamp() {
    let (db, _dir, root) = new_db();
    let early = child(&root, 1, 1);
    let late = child(&root, 5, 2);

    db.add(late.clone(), false).unwrap();
    db.add(early.clone(), false).unwrap();
    db.mark_valid(&late).unwrap();
    db.mark_valid(&early).unwrap();

    assert_eq!(db.head().unwrap().id, early.id);
}

#[test]
fn test_head_tie_break_falls_back_to_id() {
    let (db, _dir, root) = new_db();
    // Same slot, different producers: same height and timestamp.
    let a = child(&root, 1, 1);
    let b = child(&root, 1, 2);

    db.add(a.clone(), false).unwrap();
    db.add(b.clone(), false).unwrap();
    db.mark_valid(&a).unwrap();
    db.mark_valid(&b).unwrap();

    let expected = if a.id < b.id { a.id } else { b.id };
    assert_eq!(db.head().unwrap().id, expected);
}

#[test]
fn test_fetch_branch_descending_with_trim() {
    let (db, _dir, root) = new_db();
    let a1 = child(&root, 1, 1);
    let a2 = child(&a1, 2, 1);
    let a3 = child(&a2, 3, 1);

    for state in [&a1, &a2, &a3] {
        db.add(state.clone(), false).unwrap();
    }

    let branch = db.fetch_branch(&a3.id, BlockNum(u32::MAX)).unwrap();
    let ids: Vec<_> = branch.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![a3.id, a2.id, a1.id]);

    let trimmed = db.fetch_branch(&a3.id, a2.block_num()).unwrap();
    let ids: Vec<_> = trimmed.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![a2.id, a1.id]);

    let missing = child(&a3, 9, 9);
    assert!(matches!(
        db.fetch_branch(&missing.id, BlockNum(u32::MAX)),
        Err(ForkDbError::BlockNotFound(_))
    ));
}

#[test]
fn test_search_on_branch() {
    let (db, _dir, root) = new_db();
    let a1 = child(&root, 1, 1);
    let a2 = child(&a1, 2, 1);
    let b1 = child(&root, 3, 2);

    for state in [&a1, &a2, &b1] {
        db.add(state.clone(), false).unwrap();
    }

    let found = db.search_on_branch(&a2.id, a1.block_num()).unwrap();
    assert_eq!(found.id, a1.id);

    // b1 is at the same height as a1 but on another branch.
    let found = db.search_on_branch(&b1.id, b1.block_num()).unwrap();
    assert_eq!(found.id, b1.id);

    // The a-branch never contains b1's sibling beyond its height.
    assert!(db.search_on_branch(&a1.id, a2.block_num()).is_none());
}

#[test]
fn test_fetch_branch_from_common_ancestor() {
    let (db, _dir, root) = new_db();
    let a1 = child(&root, 1, 1);
    let a2 = child(&a1, 2, 1);
    let a3 = child(&a2, 3, 1);
    let b1 = child(&root, 4, 2);
    let b2 = child(&b1, 5, 2);

    for state in [&a1, &a2, &a3, &b1, &b2] {
        db.add(state.clone(), false).unwrap();
    }

    let (first, second) = db.fetch_branch_from(&a3.id, &b2.id).unwrap();
    let first_ids: Vec<_> = first.iter().map(|s| s.id).collect();
    let second_ids: Vec<_> = second.iter().map(|s| s.id).collect();

    assert_eq!(first_ids, vec![a3.id, a2.id, a1.id]);
    assert_eq!(second_ids, vec![b2.id, b1.id]);

    // Both deepest entries share the same parent (the common ancestor).
    assert_eq!(
        first.last().unwrap().previous(),
        second.last().unwrap().previous()
    );
}

#[test]
fn test_advance_root_signals_ascending_and_prunes() {
    let (db, _dir, root) = new_db();
    let a1 = child(&root, 1, 1);
    let a2 = child(&a1, 2, 1);
    let a3 = child(&a2, 3, 1);
    let b1 = child(&root, 4, 2);
    let b2 = child(&b1, 5, 2);

    for state in [&a1, &a2, &a3, &b1, &b2] {
        db.add(state.clone(), false).unwrap();
    }

    let seen: Arc<Mutex<Vec<BlockNum>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_by_signal = seen.clone();
    db.on_irreversible(Box::new(move |state| {
        seen_by_signal.lock().unwrap().push(state.block_num());
    }));

    db.advance_root(&a2.id).unwrap();

    // Signal fired oldest-first for (root, a2].
    assert_eq!(
        *seen.lock().unwrap(),
        vec![a1.block_num(), a2.block_num()]
    );

    // The b-branch is gone; only descendants of a2 (and a2 as root) remain.
    assert_eq!(db.root().unwrap().id, a2.id);
    assert!(db.get_block(&b1.id).is_none());
    assert!(db.get_block(&b2.id).is_none());
    assert!(db.get_block(&a1.id).is_none());
    assert!(db.get_block(&a3.id).is_some());

    assert!(matches!(
        db.advance_root(&b2.id),
        Err(ForkDbError::BlockNotFound(_))
    ));
}

#[test]
fn test_remove_deletes_subtree() {
    let (db, _dir, root) = new_db();
    let a1 = child(&root, 1, 1);
    let a2 = child(&a1, 2, 1);
    let a3 = child(&a2, 3, 1);

    for state in [&a1, &a2, &a3] {
        db.add(state.clone(), false).unwrap();
    }

    db.remove(&a2.id).unwrap();
    assert!(db.get_block(&a1.id).is_some());
    assert!(db.get_block(&a2.id).is_none());
    assert!(db.get_block(&a3.id).is_none());

    assert!(matches!(
        db.remove(&root.id),
        Err(ForkDbError::RemoveRoot(_))
    ));
}

#[test]
fn test_rollback_head_to_root() {
    let (db, _dir, root) = new_db();
    let a1 = child(&root, 1, 1);
    let a2 = child(&a1, 2, 1);

    db.add(a1.clone(), false).unwrap();
    db.add(a2.clone(), false).unwrap();
    db.mark_valid(&a1).unwrap();
    db.mark_valid(&a2).unwrap();
    assert_eq!(db.head().unwrap().id, a2.id);

    db.rollback_head_to_root();
    assert_eq!(db.head().unwrap().id, root.id);
    // The nodes themselves are retained.
    assert_eq!(db.pending_head().unwrap().id, a2.id);
}

#[test]
fn test_persistence_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let root = genesis_state();
    let a1;
    let a2;

    {
        let db = ForkDatabase::new(dir.path());
        db.reset(root.clone());
        let root = db.root().unwrap();
        a1 = child(&root, 1, 1);
        a2 = child(&a1, 2, 1);
        db.add(a1.clone(), false).unwrap();
        db.add(a2.clone(), false).unwrap();
        db.mark_valid(&a1).unwrap();
        db.mark_valid(&a2).unwrap();
        db.close().unwrap();
    }

    let db = ForkDatabase::new(dir.path());
    let validated = Arc::new(Mutex::new(0usize));
    let validated_by_cb = validated.clone();
    db.open(move |_state| {
        *validated_by_cb.lock().unwrap() += 1;
        Ok(())
    })
    .unwrap();

    // Both non-root blocks went through the validator callback.
    assert_eq!(*validated.lock().unwrap(), 2);
    assert_eq!(db.root().unwrap().id, root.id);
    assert_eq!(db.head().unwrap().id, a2.id);
    assert_eq!(db.pending_head().unwrap().id, a2.id);
}

#[test]
fn test_open_rejects_foreign_and_future_files() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fork_db.dat");

    // Wrong magic.
    {
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        file.write_all(&1u32.to_le_bytes()).unwrap();
    }
    let db = ForkDatabase::new(dir.path());
    assert!(db.open(|_| Ok(())).is_err());

    // Future version.
    {
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&instafin_chain::FORK_DB_MAGIC.to_le_bytes())
            .unwrap();
        file.write_all(&(instafin_chain::MAX_SUPPORTED_VERSION + 1).to_le_bytes())
            .unwrap();
    }
    let db = ForkDatabase::new(dir.path());
    assert!(db.open(|_| Ok(())).is_err());
}
