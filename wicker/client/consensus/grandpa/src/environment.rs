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

//! Application of justifications to the block tree.

use crate::{
	authorities::AuthorityManager, justification::GrandpaJustification, ApplyOutcome,
	JustificationError, LOG_TARGET,
};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use wc_blockchain::{BlockTree, ImportError, ImportResultCallback, JustificationApplier};
use wp_core::{crypto::Ed25519Verifier, BlockInfo, EncodedJustification};

/// Verifies justifications against the active authority set and moves the
/// finalized cursor forward.
///
/// A justification may arrive before its target block (finality gossip is
/// not ordered with block download); such justifications are parked in
/// `postponed` and retried deterministically after every import and every
/// finalization.
pub struct GrandpaEnvironment {
	tree: Arc<BlockTree>,
	authorities: Arc<AuthorityManager>,
	verifier: Arc<dyn Ed25519Verifier>,
	postponed: Mutex<BTreeMap<BlockInfo, EncodedJustification>>,
}

impl GrandpaEnvironment {
	pub fn new(
		tree: Arc<BlockTree>,
		authorities: Arc<AuthorityManager>,
		verifier: Arc<dyn Ed25519Verifier>,
	) -> Self {
		Self { tree, authorities, verifier, postponed: Mutex::new(BTreeMap::new()) }
	}

	pub fn authorities(&self) -> &Arc<AuthorityManager> {
		&self.authorities
	}

	fn try_apply(
		&self,
		block: BlockInfo,
		raw: &EncodedJustification,
	) -> Result<ApplyOutcome, JustificationError> {
		let finalized = self.tree.get_last_finalized();
		if block == finalized {
			return Ok(ApplyOutcome::Applied)
		}
		if block.number <= finalized.number {
			return Err(JustificationError::ForBlockInPast(block))
		}
		if !self.tree.has_block_header(&block.hash)? {
			trace!(
				target: LOG_TARGET,
				"Justification for not yet imported block {block} postponed",
			);
			self.postponed.lock().insert(block, raw.clone());
			return Ok(ApplyOutcome::Postponed(block.hash))
		}

		let justification = GrandpaJustification::decode_from(raw)?;
		if justification.target() != block {
			return Err(JustificationError::TargetMismatch {
				expected: block,
				actual: justification.target(),
			})
		}
		let set = self.authorities.current();
		justification.verify(&set, &*self.verifier)?;

		if !self.tree.has_direct_chain(&finalized.hash, &block.hash) {
			return Err(JustificationError::NotDescendant(block))
		}

		self.tree.finalize(&block.hash, raw.clone())?;
		self.authorities.on_finalized(&self.tree, block);
		// Anything parked at or below the new finalized height can no
		// longer be applied.
		self.postponed.lock().retain(|info, _| info.number > block.number);

		debug!(target: LOG_TARGET, "Applied justification for block {block} (set {})", set.id);
		Ok(ApplyOutcome::Applied)
	}

	/// Retry parked justifications whose target has been imported since.
	/// Returns how many were applied.
	pub fn retry_postponed(&self) -> usize {
		let mut applied = 0;
		let mut progressed = true;
		while progressed {
			progressed = false;
			let candidates: Vec<(BlockInfo, EncodedJustification)> = self
				.postponed
				.lock()
				.iter()
				.filter(|(info, _)| {
					self.tree.has_block_header(&info.hash).unwrap_or(false)
				})
				.map(|(info, raw)| (*info, raw.clone()))
				.collect();

			for (info, raw) in candidates {
				if self.postponed.lock().remove(&info).is_none() {
					continue
				}
				match self.try_apply(info, &raw) {
					Ok(ApplyOutcome::Applied) => {
						applied += 1;
						progressed = true;
					},
					Ok(ApplyOutcome::Postponed(_)) => {},
					Err(error) => {
						warn!(
							target: LOG_TARGET,
							"Dropping postponed justification for block {info}: {error}",
						);
					},
				}
			}
		}
		applied
	}
}

impl JustificationApplier for GrandpaEnvironment {
	fn apply_justification(
		&self,
		block: BlockInfo,
		justification: EncodedJustification,
		callback: ImportResultCallback,
	) {
		let result = match self.try_apply(block, &justification) {
			Ok(ApplyOutcome::Applied) => {
				self.retry_postponed();
				Ok(())
			},
			// Parked for later; not a failure of the caller's operation.
			Ok(ApplyOutcome::Postponed(_)) => Ok(()),
			Err(error) => {
				warn!(
					target: LOG_TARGET,
					"Justification for block {block} was not applied: {error}",
				);
				Err(ImportError::Justification(error.to_string()))
			},
		};
		callback(result);
	}
}
