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

//! Observation of consensus digests during import, with rollback.

use crate::{config::BabeConfigRepository, LOG_TARGET};
use log::trace;
use std::sync::Arc;
use wc_consensus_grandpa::AuthorityManager;
use wp_core::{
	digests::{next_epoch_digest, scheduled_change_digest},
	BlockHeader, BlockInfo,
};

/// Feeds epoch and authority-set digests of imported blocks into the
/// configuration repositories.
pub struct DigestTracker {
	babe_config: Arc<BabeConfigRepository>,
	grandpa_authorities: Arc<AuthorityManager>,
}

impl DigestTracker {
	pub fn new(
		babe_config: Arc<BabeConfigRepository>,
		grandpa_authorities: Arc<AuthorityManager>,
	) -> Self {
		Self { babe_config, grandpa_authorities }
	}

	/// Record every digest of `header`. The returned guard must be
	/// committed once the block has fully entered the tree; dropping it
	/// uncommitted rolls the recorded state back, so a failed import
	/// leaves no partial digest application behind.
	pub fn observe(self: &Arc<Self>, block: BlockInfo, header: &BlockHeader) -> ConsistencyGuard {
		if let Some(descriptor) = next_epoch_digest(header) {
			self.babe_config.on_next_epoch(block.hash, descriptor);
		}
		if let Some(change) = scheduled_change_digest(header) {
			self.grandpa_authorities.on_scheduled_change(block, &change);
		}
		ConsistencyGuard { tracker: self.clone(), block, committed: false }
	}

	/// Drop the pruned block's recorded digests.
	pub fn on_pruned(&self, block: &BlockInfo) {
		self.babe_config.forget(&block.hash);
		self.grandpa_authorities.cancel(&block.hash);
	}

	fn cancel(&self, block: &BlockInfo) {
		trace!(target: LOG_TARGET, "Rolling back digests of block {block}");
		self.babe_config.forget(&block.hash);
		self.grandpa_authorities.cancel(&block.hash);
	}
}

/// Scoped commit/rollback handle over one block's digest observation.
#[must_use = "dropping the guard without `commit` rolls the digests back"]
pub struct ConsistencyGuard {
	tracker: Arc<DigestTracker>,
	block: BlockInfo,
	committed: bool,
}

impl ConsistencyGuard {
	pub fn commit(mut self) {
		self.committed = true;
	}
}

impl Drop for ConsistencyGuard {
	fn drop(&mut self) {
		if !self.committed {
			self.tracker.cancel(&self.block);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{AllowedSlots, BabeConfiguration};
	use codec::Encode;
	use wc_blockchain::{block_store::columns, BlockStore, BlockTree, ChainEvents};
	use wp_core::{
		crypto::Sr25519Public,
		digests::{BabeConsensusLog, NextEpochDescriptor},
		header::{DigestItem, BABE_ENGINE_ID},
		Digest, H256,
	};

	fn tracker() -> (Arc<DigestTracker>, Arc<BabeConfigRepository>, Arc<BlockTree>) {
		let genesis = BlockHeader {
			parent_hash: H256::zero(),
			number: 0,
			state_root: H256::zero(),
			extrinsics_root: H256::zero(),
			digest: Digest::default(),
		};
		let store =
			Arc::new(BlockStore::new(Arc::new(kvdb_memorydb::create(columns::NUM_COLUMNS))));
		let tree = Arc::new(
			BlockTree::from_genesis(store, Arc::new(ChainEvents::new()), genesis).unwrap(),
		);
		let config = Arc::new(BabeConfigRepository::new(
			BabeConfiguration {
				epoch_length: 600,
				c: (1, 4),
				authorities: vec![(Sr25519Public([1; 32]), 1)],
				randomness: [0; 32],
				allowed_slots: AllowedSlots::PrimaryAndSecondaryPlainSlots,
			},
			tree.clone(),
		));
		let authorities = Arc::new(AuthorityManager::new(vec![]));
		(Arc::new(DigestTracker::new(config.clone(), authorities)), config, tree)
	}

	#[test]
	fn uncommitted_guard_rolls_back_epoch_digest() {
		let (tracker, config, tree) = tracker();
		let genesis_hash = tree.genesis_hash().unwrap();

		let descriptor = NextEpochDescriptor {
			authorities: vec![(Sr25519Public([9; 32]), 1)],
			randomness: [9; 32],
		};
		let header = BlockHeader {
			parent_hash: genesis_hash,
			number: 1,
			state_root: H256::zero(),
			extrinsics_root: H256::zero(),
			digest: Digest {
				logs: vec![DigestItem::Consensus(
					BABE_ENGINE_ID,
					BabeConsensusLog::NextEpochData(descriptor).encode(),
				)],
			},
		};
		let info = header.block_info();

		// Rolled back on drop.
		let guard = tracker.observe(info, &header);
		drop(guard);
		tree.add_block(wp_core::Block { header: header.clone(), body: vec![] }).unwrap();
		let data = config.config_for(&info.hash, 1).unwrap();
		assert_eq!(data.authorities, vec![(Sr25519Public([1; 32]), 1)]);

		// Committed guards persist the observation.
		tracker.observe(info, &header).commit();
		let data = config.config_for(&info.hash, 1).unwrap();
		assert_eq!(data.authorities, vec![(Sr25519Public([9; 32]), 1)]);
	}
}
