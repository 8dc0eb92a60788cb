// This file is part of Wicker.

// Copyright (C) Wicker contributors.
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use super::*;
use crate::block_store::columns;
use assert_matches::assert_matches;
use codec::Encode;
use parking_lot::Mutex as PlMutex;
use wp_core::{
	crypto::{VrfOutput, VrfProof},
	digests::PreDigest,
	header::{DigestItem, BABE_ENGINE_ID},
	Block, Digest, OpaqueExtrinsic,
};

fn genesis_header() -> BlockHeader {
	BlockHeader {
		parent_hash: H256::zero(),
		number: 0,
		state_root: H256::zero(),
		extrinsics_root: H256::zero(),
		digest: Digest::default(),
	}
}

fn child_header(parent: &BlockHeader, primary: bool, salt: u8) -> BlockHeader {
	let pre = if primary {
		PreDigest::Primary {
			authority_index: 0,
			slot: parent.number + 1,
			vrf_output: VrfOutput([salt; 32]),
			vrf_proof: VrfProof([salt; 64]),
		}
	} else {
		PreDigest::SecondaryPlain { authority_index: 0, slot: parent.number + 1 }
	};
	BlockHeader {
		parent_hash: parent.hash(),
		number: parent.number + 1,
		state_root: H256::repeat_byte(salt),
		extrinsics_root: H256::zero(),
		digest: Digest { logs: vec![DigestItem::PreRuntime(BABE_ENGINE_ID, pre.encode())] },
	}
}

fn block(header: BlockHeader) -> Block {
	Block { header, body: vec![OpaqueExtrinsic(vec![0])] }
}

fn new_tree() -> (BlockTree, Arc<BlockStore>, Arc<ChainEvents>) {
	let store = Arc::new(BlockStore::new(Arc::new(kvdb_memorydb::create(columns::NUM_COLUMNS))));
	let events = Arc::new(ChainEvents::new());
	let tree = BlockTree::from_genesis(store.clone(), events.clone(), genesis_header()).unwrap();
	(tree, store, events)
}

fn just(tag: u8) -> EncodedJustification {
	EncodedJustification(vec![tag])
}

#[test]
fn starts_with_genesis_only() {
	let (tree, _, _) = new_tree();
	let genesis = BlockInfo::new(0, genesis_header().hash());

	assert_eq!(tree.best_leaf(), genesis);
	assert_eq!(tree.get_last_finalized(), genesis);
	assert_eq!(tree.get_leaves(), vec![genesis.hash]);
	assert_eq!(tree.genesis_hash().unwrap(), genesis.hash);
}

#[test]
fn simple_extension_moves_best() {
	let (tree, _, _) = new_tree();
	let b1 = block(child_header(&genesis_header(), false, 1));
	let b1_info = b1.header.block_info();

	tree.add_block(b1).unwrap();
	assert_eq!(tree.get_leaves(), vec![b1_info.hash]);
	assert_eq!(tree.best_leaf(), b1_info);
	assert_eq!(tree.get_last_finalized().number, 0);
}

#[test]
fn fork_resolution_prefers_primary_weight() {
	let (tree, _, _) = new_tree();
	let b1a = block(child_header(&genesis_header(), true, 0xa));
	let b1b = block(child_header(&genesis_header(), false, 0xb));
	let b1a_info = b1a.header.block_info();
	let b1b_info = b1b.header.block_info();

	tree.add_block(b1a).unwrap();
	tree.add_block(b1b).unwrap();

	assert_eq!(tree.best_leaf(), b1a_info);
	assert_eq!(tree.get_leaves().len(), 2);

	// Finalizing the non-best fork prunes the heavier sibling.
	let discarded = Arc::new(PlMutex::new(Vec::new()));
	let sink = discarded.clone();
	tree.register_discard_hook(Box::new(move |info| sink.lock().push(info)));

	tree.finalize(&b1b_info.hash, just(1)).unwrap();
	assert_eq!(tree.get_last_finalized(), b1b_info);
	assert_eq!(tree.get_leaves(), vec![b1b_info.hash]);
	assert_eq!(tree.best_leaf(), b1b_info);
	assert_eq!(*discarded.lock(), vec![b1a_info]);
	assert!(!tree.has_block_header(&b1a_info.hash).unwrap());
}

#[test]
fn double_insert_reports_block_exists_and_leaves_tree_unchanged() {
	let (tree, _, _) = new_tree();
	let b1 = block(child_header(&genesis_header(), false, 1));
	let b1_info = b1.header.block_info();

	tree.add_block(b1.clone()).unwrap();
	assert_matches!(tree.add_block(b1), Err(Error::BlockExists(hash)) if hash == b1_info.hash);
	assert_eq!(tree.get_leaves(), vec![b1_info.hash]);
	assert_eq!(tree.best_leaf(), b1_info);
}

#[test]
fn orphan_block_is_rejected() {
	let (tree, _, _) = new_tree();
	let b1 = child_header(&genesis_header(), false, 1);
	let b2 = block(child_header(&b1, false, 2));
	assert_matches!(tree.add_block(b2), Err(Error::ParentNotFound(_)));
}

#[test]
fn finalize_is_idempotent() {
	let (tree, store, _) = new_tree();
	let b1 = block(child_header(&genesis_header(), false, 1));
	let b1_info = b1.header.block_info();

	tree.add_block(b1).unwrap();
	tree.finalize(&b1_info.hash, just(1)).unwrap();
	tree.finalize(&b1_info.hash, just(2)).unwrap();

	assert_eq!(tree.get_last_finalized(), b1_info);
	// The no-op second call must not overwrite the stored justification.
	assert_eq!(store.justification(&b1_info.hash).unwrap(), Some(just(1)));
}

#[test]
fn finalization_is_monotonic_and_canonicalizes() {
	let (tree, store, _) = new_tree();
	let h1 = child_header(&genesis_header(), false, 1);
	let h2 = child_header(&h1, false, 2);
	let h3 = child_header(&h2, false, 3);
	for header in [&h1, &h2, &h3] {
		tree.add_block(block(header.clone())).unwrap();
	}

	tree.finalize(&h3.hash(), just(3)).unwrap();
	assert_eq!(tree.get_last_finalized(), h3.block_info());

	// Retired ancestors became canonical.
	assert_eq!(store.hash_by_number(1).unwrap(), Some(h1.hash()));
	assert_eq!(store.hash_by_number(2).unwrap(), Some(h2.hash()));
	assert_eq!(store.hash_by_number(3).unwrap(), Some(h3.hash()));

	// A finalized predecessor is gone from the tree but not from storage.
	assert!(tree.has_block_header(&h1.hash()).unwrap());
	assert_eq!(tree.get_leaves(), vec![h3.hash()]);

	// Finalizing an unknown (pruned or never-seen) block fails.
	assert_matches!(tree.finalize(&H256::repeat_byte(0xee), just(9)), Err(Error::BlockNotFound(_)));
}

#[test]
fn non_milestone_justifications_are_dropped_on_next_finalize() {
	let (tree, store, _) = new_tree();
	let h1 = child_header(&genesis_header(), false, 1);
	let h2 = child_header(&h1, false, 2);
	tree.add_block(block(h1.clone())).unwrap();
	tree.add_block(block(h2.clone())).unwrap();

	tree.finalize(&h1.hash(), just(1)).unwrap();
	assert_eq!(store.justification(&h1.hash()).unwrap(), Some(just(1)));

	tree.finalize(&h2.hash(), just(2)).unwrap();
	// Height 1 is not a milestone, so its justification was pruned.
	assert_eq!(store.justification(&h1.hash()).unwrap(), None);
	assert_eq!(store.justification(&h2.hash()).unwrap(), Some(just(2)));
}

#[test]
fn remove_leaf_only_removes_leaves() {
	let (tree, _, _) = new_tree();
	let h1 = child_header(&genesis_header(), false, 1);
	let h2 = child_header(&h1, false, 2);
	tree.add_block(block(h1.clone())).unwrap();
	tree.add_block(block(h2.clone())).unwrap();

	assert_matches!(tree.remove_leaf(&h1.hash()), Err(Error::NotALeaf(_)));
	tree.remove_leaf(&h2.hash()).unwrap();
	assert_eq!(tree.get_leaves(), vec![h1.hash()]);
	assert!(!tree.has_block_header(&h2.hash()).unwrap());
}

#[test]
fn best_containing_respects_branch_and_cap() {
	let (tree, _, _) = new_tree();
	let genesis = genesis_header();
	let a1 = child_header(&genesis, true, 0xa1);
	let a2 = child_header(&a1, false, 0xa2);
	let b1 = child_header(&genesis, false, 0xb1);
	for header in [&a1, &a2, &b1] {
		tree.add_block(block(header.clone())).unwrap();
	}

	// The a-branch is best (primary claim at a1).
	assert_eq!(tree.best_leaf(), a2.block_info());
	assert_eq!(tree.get_best_containing(&a1.hash(), None).unwrap(), a2.block_info());
	assert_eq!(tree.get_best_containing(&b1.hash(), None).unwrap(), b1.block_info());

	// Capping below the leaf walks back down the branch.
	assert_eq!(tree.get_best_containing(&a1.hash(), Some(1)).unwrap(), a1.block_info());
	assert_matches!(
		tree.get_best_containing(&a2.hash(), Some(1)),
		Err(Error::TargetIsPastMax)
	);

	// A finalized canonical target is contained by the best leaf.
	assert_eq!(
		tree.get_best_containing(&genesis.hash(), None).unwrap(),
		a2.block_info()
	);
}

#[test]
fn chains_and_direct_chain_queries() {
	let (tree, _, _) = new_tree();
	let genesis = genesis_header();
	let a1 = child_header(&genesis, false, 0xa1);
	let a2 = child_header(&a1, false, 0xa2);
	let b1 = child_header(&genesis, false, 0xb1);
	for header in [&a1, &a2, &b1] {
		tree.add_block(block(header.clone())).unwrap();
	}

	assert_eq!(
		tree.get_chain_by_blocks(&genesis.hash(), &a2.hash()).unwrap(),
		vec![a1.hash(), a2.hash()],
	);
	assert_matches!(
		tree.get_chain_by_blocks(&b1.hash(), &a2.hash()),
		Err(Error::NoChainBetweenBlocks { .. })
	);

	assert!(tree.has_direct_chain(&genesis.hash(), &a2.hash()));
	assert!(tree.has_direct_chain(&a2.hash(), &a2.hash()));
	assert!(!tree.has_direct_chain(&b1.hash(), &a2.hash()));

	// Crossing the finalized boundary still works through storage.
	tree.finalize(&a1.hash(), just(1)).unwrap();
	assert!(tree.has_direct_chain(&genesis.hash(), &a2.hash()));
}

#[test]
fn header_only_blocks_are_tracked_without_body() {
	let (tree, store, _) = new_tree();
	let h1 = child_header(&genesis_header(), false, 1);
	tree.add_header(h1.clone()).unwrap();

	assert_eq!(tree.best_leaf(), h1.block_info());
	assert!(store.has_header(&h1.hash()).unwrap());
	assert_eq!(store.body(&h1.hash()).unwrap(), None);
	assert!(!tree.has_block_body(&h1.hash()).unwrap());

	let h2 = block(child_header(&h1, false, 2));
	let h2_info = h2.header.block_info();
	tree.add_block(h2).unwrap();
	assert!(tree.has_block_body(&h2_info.hash).unwrap());
}

#[test]
fn finalized_chain_membership_and_justifications_are_queryable() {
	let (tree, _, _) = new_tree();
	let genesis = genesis_header();
	let h1 = child_header(&genesis, false, 1);
	let h2 = child_header(&h1, false, 2);
	tree.add_block(block(h1.clone())).unwrap();
	tree.add_block(block(h2.clone())).unwrap();

	assert!(!tree.is_finalized(&h1.block_info()));
	tree.finalize(&h2.hash(), just(2)).unwrap();

	assert!(tree.is_finalized(&h1.block_info()));
	assert!(tree.is_finalized(&h2.block_info()));
	assert!(tree.is_finalized(&genesis.block_info()));
	assert!(!tree.is_finalized(&BlockInfo::new(1, H256::repeat_byte(0xcc))));

	assert!(tree.has_justification(&h2.hash()).unwrap());
	assert_eq!(tree.get_block_justification(&h2.hash()).unwrap(), Some(just(2)));
	assert!(!tree.has_justification(&h1.hash()).unwrap());
}

#[test]
fn existing_blocks_reattach_with_recomputed_weight() {
	let (tree, store, _) = new_tree();
	let primary = child_header(&genesis_header(), true, 0xa1);
	let secondary = child_header(&genesis_header(), false, 0xb1);

	// Persisted earlier, e.g. before a restart, but not in the tree.
	store.put_block(&block(primary.clone())).unwrap();
	store.put_header(&secondary).unwrap();

	tree.add_existing_block(secondary.hash(), secondary.clone()).unwrap();
	tree.add_existing_block(primary.hash(), primary.clone()).unwrap();

	// The primary claim was recovered from the stored header and wins.
	assert_eq!(tree.best_leaf(), primary.block_info());
	assert!(tree.has_block_body(&primary.hash()).unwrap());
	assert!(!tree.has_block_body(&secondary.hash()).unwrap());

	assert_matches!(
		tree.add_existing_block(primary.hash(), primary),
		Err(Error::BlockExists(_))
	);
}

#[test]
fn reload_restores_forks_and_best() {
	let store = Arc::new(BlockStore::new(Arc::new(kvdb_memorydb::create(columns::NUM_COLUMNS))));
	let events = Arc::new(ChainEvents::new());
	let tree =
		BlockTree::from_genesis(store.clone(), events.clone(), genesis_header()).unwrap();

	let genesis = genesis_header();
	let a1 = child_header(&genesis, true, 0xa1);
	let a2 = child_header(&a1, false, 0xa2);
	let b1 = child_header(&genesis, false, 0xb1);
	for header in [&a1, &a2, &b1] {
		tree.add_block(block(header.clone())).unwrap();
	}
	let best = tree.best_leaf();
	let leaves = tree.get_leaves();
	drop(tree);

	let reloaded = BlockTree::load(store, events).unwrap();
	assert_eq!(reloaded.best_leaf(), best);
	assert_eq!(reloaded.get_leaves(), leaves);
	assert_eq!(reloaded.get_last_finalized().number, 0);
}

#[test]
fn events_follow_best_and_finalized() {
	let (tree, _, events) = new_tree();
	let mut stream = events.subscribe();

	let h1 = child_header(&genesis_header(), false, 1);
	tree.add_block(block(h1.clone())).unwrap();
	assert_eq!(
		stream.try_next().unwrap(),
		Some(ChainEvent::NewBestBlock(h1.block_info())),
	);

	tree.finalize(&h1.hash(), just(1)).unwrap();
	assert_eq!(stream.try_next().unwrap(), Some(ChainEvent::Finalized(h1.block_info())));
}
