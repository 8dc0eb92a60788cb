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

//! Per-block BABE configuration derived from epoch digests.

use crate::{epoch_index, EpochIndex, EpochLength, VerificationError, LOG_TARGET, MAX_EPOCH_WALK};
use log::trace;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use wc_blockchain::BlockTree;
use wp_core::{
	crypto::Randomness,
	digests::{BabeAuthority, NextEpochDescriptor},
	H256, Slot,
};

/// Which secondary slot claims an epoch admits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllowedSlots {
	PrimarySlots,
	PrimaryAndSecondaryPlainSlots,
	PrimaryAndSecondaryVrfSlots,
}

impl AllowedSlots {
	pub fn allows_secondary(&self) -> bool {
		!matches!(self, Self::PrimarySlots)
	}
}

/// Genesis BABE parameters; everything later epochs change arrives via
/// digests.
#[derive(Clone, Debug)]
pub struct BabeConfiguration {
	pub epoch_length: EpochLength,
	/// Probability of a slot having at least one primary leader, as the
	/// rational `c.0 / c.1`.
	pub c: (u64, u64),
	pub authorities: Vec<BabeAuthority>,
	pub randomness: Randomness,
	pub allowed_slots: AllowedSlots,
}

/// The configuration a single block is validated under.
#[derive(Clone, Debug)]
pub struct EpochData {
	pub epoch: EpochIndex,
	pub authorities: Vec<BabeAuthority>,
	pub randomness: Randomness,
	pub c: (u64, u64),
	pub allowed_slots: AllowedSlots,
}

/// Supplies the epoch configuration for any block, resolved along its
/// ancestry: the most recent next-epoch digest below it, the genesis
/// configuration otherwise. Descriptors are recorded as blocks are
/// imported and forgotten when their block is rolled back or pruned.
pub struct BabeConfigRepository {
	genesis: BabeConfiguration,
	tree: Arc<BlockTree>,
	announced: Mutex<HashMap<H256, NextEpochDescriptor>>,
}

impl BabeConfigRepository {
	pub fn new(genesis: BabeConfiguration, tree: Arc<BlockTree>) -> Self {
		Self { genesis, tree, announced: Mutex::new(HashMap::new()) }
	}

	pub fn epoch_length(&self) -> EpochLength {
		self.genesis.epoch_length
	}

	/// Record the descriptor announced by `block`.
	pub fn on_next_epoch(&self, block: H256, descriptor: NextEpochDescriptor) {
		trace!(target: LOG_TARGET, "Recorded next-epoch digest of 0x{block:x}");
		self.announced.lock().insert(block, descriptor);
	}

	/// Forget whatever `block` announced; rollback and pruning path.
	pub fn forget(&self, block: &H256) {
		self.announced.lock().remove(block);
	}

	/// Configuration for a block built on `parent` and claiming `slot`.
	///
	/// Walks the ancestry from `parent` down looking for the nearest
	/// next-epoch descriptor; headers are resolved through the tree and
	/// the finalized chain in storage.
	pub fn config_for(
		&self,
		parent: &H256,
		slot: Slot,
	) -> Result<EpochData, VerificationError> {
		let epoch = epoch_index(slot, self.genesis.epoch_length);
		let announced = self.announced.lock();

		let mut cursor = *parent;
		let mut walked = 0;
		loop {
			if let Some(descriptor) = announced.get(&cursor) {
				return Ok(EpochData {
					epoch,
					authorities: descriptor.authorities.clone(),
					randomness: descriptor.randomness,
					c: self.genesis.c,
					allowed_slots: self.genesis.allowed_slots,
				})
			}
			let header = self
				.tree
				.get_block_header(&cursor)?
				.ok_or(VerificationError::ConfigUnavailable(*parent))?;
			if header.number == 0 {
				break
			}
			cursor = header.parent_hash;
			walked += 1;
			if walked > MAX_EPOCH_WALK {
				return Err(VerificationError::ConfigUnavailable(*parent))
			}
		}

		Ok(EpochData {
			epoch,
			authorities: self.genesis.authorities.clone(),
			randomness: self.genesis.randomness,
			c: self.genesis.c,
			allowed_slots: self.genesis.allowed_slots,
		})
	}
}
