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

//! The fork-aware block tree.

mod cached_tree;

use crate::{
	block_store::BlockStore,
	error::Error,
	justification_policy::JustificationStoragePolicy,
	notifications::{ChainEvent, ChainEvents},
	LOG_TARGET,
};
use cached_tree::CachedTree;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use wp_core::{
	digests::babe_pre_digest, Block, BlockHeader, BlockInfo, BlockNumber, EncodedJustification,
	H256,
};

/// Called for every queued-elsewhere block that a finalization pruned;
/// the synchronizer uses this to drop matching import-queue entries.
pub type DiscardHook = Box<dyn Fn(BlockInfo) + Send + Sync>;

/// In-memory tree of all unfinalized blocks on top of the persistent
/// store. The root is always the last finalized block; every operation
/// takes the single exclusive lock.
pub struct BlockTree {
	store: Arc<BlockStore>,
	tree: Mutex<CachedTree>,
	policy: JustificationStoragePolicy,
	events: Arc<ChainEvents>,
	discard_hooks: Mutex<Vec<DiscardHook>>,
}

impl BlockTree {
	/// Initialize storage with `genesis` and build a tree rooted there.
	pub fn from_genesis(
		store: Arc<BlockStore>,
		events: Arc<ChainEvents>,
		genesis: BlockHeader,
	) -> Result<Self, Error> {
		let hash = store.put_header(&genesis)?;
		let info = BlockInfo::new(genesis.number, hash);
		store.set_genesis_hash(&hash)?;
		store.assign_number_to_hash(info)?;
		store.set_last_finalized(info)?;
		store.set_leaves(&[hash])?;
		debug!(target: LOG_TARGET, "Initialized block tree at genesis {info}");
		Ok(Self {
			store,
			tree: Mutex::new(CachedTree::new(info)),
			policy: JustificationStoragePolicy::default(),
			events,
			discard_hooks: Mutex::new(Vec::new()),
		})
	}

	/// Rebuild the tree from a previously initialized store: root at the
	/// recorded last finalized block, leaves re-attached from the leaf
	/// set. Leaves that no longer descend from the root are dropped.
	pub fn load(store: Arc<BlockStore>, events: Arc<ChainEvents>) -> Result<Self, Error> {
		let finalized = store.last_finalized()?.ok_or(Error::UninitializedStorage)?;
		let mut tree = CachedTree::new(finalized);

		for leaf in store.leaves()? {
			if tree.contains(&leaf) {
				continue
			}
			// Walk towards the root collecting the branch, then re-insert
			// top-down.
			let mut branch = Vec::new();
			let mut cursor = leaf;
			let connected = loop {
				let Some(header) = store.header(&cursor)? else { break false };
				if header.number <= finalized.number {
					break false
				}
				let parent = header.parent_hash;
				branch.push(header);
				if tree.contains(&parent) {
					break true
				}
				cursor = parent;
			};
			if !connected {
				warn!(
					target: LOG_TARGET,
					"Dropping stored leaf 0x{leaf:x}: no longer descends from the finalized block",
				);
				continue
			}
			for header in branch.into_iter().rev() {
				let hash = header.hash();
				let has_body = store.body(&hash)?.is_some();
				let has_justification = store.justification(&hash)?.is_some();
				let primary = babe_pre_digest(&header).is_some_and(|pre| pre.is_primary());
				tree.add(
					BlockInfo::new(header.number, hash),
					&header.parent_hash,
					primary,
					has_body,
					has_justification,
				)?;
			}
		}

		debug!(
			target: LOG_TARGET,
			"Loaded block tree: finalized {finalized}, {} blocks in memory",
			tree.len(),
		);
		Ok(Self {
			store,
			tree: Mutex::new(tree),
			policy: JustificationStoragePolicy::default(),
			events,
			discard_hooks: Mutex::new(Vec::new()),
		})
	}

	/// Register a hook fired for every block removed by pruning.
	pub fn register_discard_hook(&self, hook: DiscardHook) {
		self.discard_hooks.lock().push(hook);
	}

	pub fn store(&self) -> &Arc<BlockStore> {
		&self.store
	}

	pub fn genesis_hash(&self) -> Result<H256, Error> {
		self.store.genesis_hash()?.ok_or(Error::UninitializedStorage)
	}

	pub fn get_last_finalized(&self) -> BlockInfo {
		self.tree.lock().root_info()
	}

	pub fn best_leaf(&self) -> BlockInfo {
		self.tree.lock().best_info()
	}

	/// Leaves sorted by height descending.
	pub fn get_leaves(&self) -> Vec<H256> {
		self.tree.lock().leaf_hashes()
	}

	/// Whether the block is part of the tree or of the finalized chain in
	/// storage.
	pub fn has_block_header(&self, hash: &H256) -> Result<bool, Error> {
		if self.tree.lock().contains(hash) {
			return Ok(true)
		}
		self.store.has_header(hash)
	}

	pub fn get_block_header(&self, hash: &H256) -> Result<Option<BlockHeader>, Error> {
		self.store.header(hash)
	}

	/// Whether the block's body is available.
	pub fn has_block_body(&self, hash: &H256) -> Result<bool, Error> {
		if let Some(has_body) = self.tree.lock().get(hash).map(|node| node.has_body) {
			return Ok(has_body)
		}
		Ok(self.store.body(hash)?.is_some())
	}

	/// Whether a justification for the block is stored.
	pub fn has_justification(&self, hash: &H256) -> Result<bool, Error> {
		if self.tree.lock().get(hash).is_some_and(|node| node.has_justification) {
			return Ok(true)
		}
		Ok(self.store.justification(hash)?.is_some())
	}

	pub fn get_block_justification(
		&self,
		hash: &H256,
	) -> Result<Option<EncodedJustification>, Error> {
		self.store.justification(hash)
	}

	/// Whether the block belongs to the finalized chain.
	pub fn is_finalized(&self, block: &BlockInfo) -> bool {
		if self.tree.lock().is_finalized(&block.hash) {
			return true
		}
		block.number < self.get_last_finalized().number &&
			self.store.hash_by_number(block.number).ok().flatten() == Some(block.hash)
	}

	pub fn get_block_hash(&self, number: BlockNumber) -> Result<Option<H256>, Error> {
		self.store.hash_by_number(number)
	}

	/// Insert a header-only block. The parent must already be in the tree.
	pub fn add_header(&self, header: BlockHeader) -> Result<(), Error> {
		let hash = header.hash();
		let info = BlockInfo::new(header.number, hash);
		let primary = babe_pre_digest(&header).is_some_and(|pre| pre.is_primary());

		let mut tree = self.tree.lock();
		let prev_best = tree.best_info();
		tree.add(info, &header.parent_hash, primary, false, false)?;
		self.store.put_header(&header)?;
		self.persist_tree_state(&tree)?;
		let new_best = tree.best_info();
		drop(tree);

		trace!(target: LOG_TARGET, "Added header-only block {info}");
		self.notify_best(prev_best, new_best);
		Ok(())
	}

	/// Insert a full block. The parent must already be in the tree.
	pub fn add_block(&self, block: Block) -> Result<(), Error> {
		let hash = block.hash();
		let info = BlockInfo::new(block.header.number, hash);
		let primary = babe_pre_digest(&block.header).is_some_and(|pre| pre.is_primary());

		let mut tree = self.tree.lock();
		let prev_best = tree.best_info();
		tree.add(info, &block.header.parent_hash, primary, true, false)?;
		self.store.put_block(&block)?;
		self.persist_tree_state(&tree)?;
		let new_best = tree.best_info();
		drop(tree);

		trace!(target: LOG_TARGET, "Added block {info}");
		self.notify_best(prev_best, new_best);
		Ok(())
	}

	/// Re-attach a block that is already persisted, e.g. during recovery.
	/// Weights are recomputed from the stored header.
	pub fn add_existing_block(&self, hash: H256, header: BlockHeader) -> Result<(), Error> {
		let info = BlockInfo::new(header.number, hash);
		let primary = babe_pre_digest(&header).is_some_and(|pre| pre.is_primary());
		let has_body = self.store.body(&hash)?.is_some();
		let has_justification = self.store.justification(&hash)?.is_some();

		let mut tree = self.tree.lock();
		let prev_best = tree.best_info();
		tree.add(info, &header.parent_hash, primary, has_body, has_justification)?;
		self.persist_tree_state(&tree)?;
		let new_best = tree.best_info();
		drop(tree);

		trace!(target: LOG_TARGET, "Re-attached existing block {info}");
		self.notify_best(prev_best, new_best);
		Ok(())
	}

	/// Drop a leaf of an abandoned fork, from memory and storage both.
	pub fn remove_leaf(&self, hash: &H256) -> Result<(), Error> {
		let mut tree = self.tree.lock();
		let prev_best = tree.best_info();
		let info = tree.remove_leaf(hash)?;
		self.store.remove_block(&info)?;
		self.persist_tree_state(&tree)?;
		let new_best = tree.best_info();
		drop(tree);

		debug!(target: LOG_TARGET, "Removed leaf {info}");
		self.notify_best(prev_best, new_best);
		Ok(())
	}

	/// Finalize an in-tree descendant of the current finalized block.
	///
	/// Writes the justification (subject to the storage policy for the
	/// predecessor), makes the finalized branch canonical, prunes every
	/// branch not containing it and re-roots the tree. Finalizing the
	/// current finalized block again is a no-op.
	pub fn finalize(
		&self,
		hash: &H256,
		justification: EncodedJustification,
	) -> Result<(), Error> {
		let mut tree = self.tree.lock();
		let previous = tree.root_info();
		if previous.hash == *hash {
			trace!(target: LOG_TARGET, "Block {previous} is finalized already");
			return Ok(())
		}
		let prev_best = tree.best_info();
		let outcome = tree.finalize(hash)?;
		let finalized = tree.root_info();

		self.store.put_justification(hash, &justification)?;
		for info in outcome.retired.iter().chain(std::iter::once(&finalized)) {
			self.store.assign_number_to_hash(*info)?;
		}
		// The predecessor's justification is kept only at milestone
		// heights or around authority-set changes.
		let previous_header = self.store.require_header(&previous.hash)?;
		if !self.policy.should_retain(&previous_header) {
			self.store.remove_justification(&previous.hash)?;
		}
		for info in &outcome.pruned {
			self.store.remove_block(info)?;
		}
		self.store.set_last_finalized(finalized)?;
		self.persist_tree_state(&tree)?;
		let new_best = tree.best_info();
		drop(tree);

		debug!(
			target: LOG_TARGET,
			"Finalized block {finalized}; pruned {} blocks of abandoned forks",
			outcome.pruned.len(),
		);
		let hooks = self.discard_hooks.lock();
		for info in &outcome.pruned {
			for hook in hooks.iter() {
				hook(*info);
			}
		}
		drop(hooks);

		self.events.notify(ChainEvent::Finalized(finalized));
		self.notify_best(prev_best, new_best);
		Ok(())
	}

	/// The best leaf whose branch contains `target`, optionally walked
	/// back to `max_number`. Used by consensus to pick the parent of a
	/// new block.
	pub fn get_best_containing(
		&self,
		target: &H256,
		max_number: Option<BlockNumber>,
	) -> Result<BlockInfo, Error> {
		let tree = self.tree.lock();
		if let Some(best) = tree.best_containing(target, max_number)? {
			return Ok(best)
		}
		let best = tree.best_info();
		let root = tree.root_info();
		drop(tree);

		// Not in the tree: the target is acceptable only as a canonical
		// finalized block, in which case every leaf contains it.
		let header = self.store.header(target)?.ok_or(Error::BlockNotFound(*target))?;
		if header.number > root.number ||
			self.store.hash_by_number(header.number)? != Some(*target)
		{
			return Err(Error::BlockNotFound(*target))
		}
		match max_number {
			Some(max) if max < header.number => Err(Error::TargetIsPastMax),
			Some(max) if max < best.number => self.walk_back_until(best, max),
			_ => Ok(best),
		}
	}

	/// Hashes from `ancestor` (exclusive) down to `descendant`
	/// (inclusive), following parent links through memory and storage.
	pub fn get_chain_by_blocks(
		&self,
		ancestor: &H256,
		descendant: &H256,
	) -> Result<Vec<H256>, Error> {
		let ancestor_header = self.store.header(ancestor)?.ok_or(Error::BlockNotFound(*ancestor))?;
		let mut chain = Vec::new();
		let mut cursor = *descendant;
		loop {
			if cursor == *ancestor {
				chain.reverse();
				return Ok(chain)
			}
			let header = self.store.header(&cursor)?.ok_or(Error::BlockNotFound(cursor))?;
			if header.number <= ancestor_header.number {
				return Err(Error::NoChainBetweenBlocks {
					ancestor: *ancestor,
					descendant: *descendant,
				})
			}
			chain.push(cursor);
			cursor = header.parent_hash;
		}
	}

	/// Whether `descendant` sits on the branch through `ancestor`, in the
	/// tree or along the finalized chain in storage.
	pub fn has_direct_chain(&self, ancestor: &H256, descendant: &H256) -> bool {
		if ancestor == descendant {
			return true
		}
		{
			let tree = self.tree.lock();
			if tree.contains(ancestor) && tree.contains(descendant) {
				return tree.is_descendant(ancestor, descendant)
			}
		}
		self.get_chain_by_blocks(ancestor, descendant).map(|_| true).unwrap_or(false)
	}

	fn walk_back_until(&self, from: BlockInfo, max: BlockNumber) -> Result<BlockInfo, Error> {
		let mut cursor = from;
		while cursor.number > max {
			let header = self.store.require_header(&cursor.hash)?;
			cursor = BlockInfo::new(header.number - 1, header.parent_hash);
		}
		Ok(cursor)
	}

	fn persist_tree_state(&self, tree: &CachedTree) -> Result<(), Error> {
		self.store.set_leaves(&tree.leaf_hashes())
	}

	fn notify_best(&self, previous: BlockInfo, current: BlockInfo) {
		if previous != current {
			self.events.notify(ChainEvent::NewBestBlock(current));
		}
	}
}

#[cfg(test)]
mod tests;
