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

//! Tracking of the GRANDPA authority set across scheduled changes.

use crate::LOG_TARGET;
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use wc_blockchain::BlockTree;
use wp_core::{
	digests::{GrandpaAuthority, ScheduledChange},
	BlockInfo, BlockNumber, H256,
};

/// Monotonically increasing identifier of an authority set.
pub type AuthoritySetId = u64;

/// The set of keys entitled to vote in the current finality epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthoritySet {
	pub id: AuthoritySetId,
	pub authorities: Vec<GrandpaAuthority>,
}

impl AuthoritySet {
	pub fn genesis(authorities: Vec<GrandpaAuthority>) -> Self {
		Self { id: 0, authorities }
	}

	pub fn total_weight(&self) -> u64 {
		self.authorities.iter().map(|(_, weight)| weight).sum()
	}

	/// Smallest weight a valid commit must reach: strictly more than two
	/// thirds of the total.
	pub fn threshold(&self) -> u64 {
		self.total_weight() - self.total_weight() / 3
	}

	pub fn weight_of(&self, voter: &wp_core::crypto::Ed25519Public) -> Option<u64> {
		self.authorities
			.iter()
			.find(|(public, _)| public == voter)
			.map(|(_, weight)| *weight)
	}
}

#[derive(Debug)]
struct PendingChange {
	announced_at: BlockInfo,
	activates_at: BlockNumber,
	next_authorities: Vec<GrandpaAuthority>,
}

/// Follows authority-set change digests as blocks are imported and
/// finalized. A scheduled change becomes active once a block at or above
/// its activation height is finalized on the announcing branch; changes
/// announced on pruned branches are forgotten.
pub struct AuthorityManager {
	inner: Mutex<Inner>,
}

struct Inner {
	current: AuthoritySet,
	pending: HashMap<H256, PendingChange>,
}

impl AuthorityManager {
	pub fn new(genesis_authorities: Vec<GrandpaAuthority>) -> Self {
		Self {
			inner: Mutex::new(Inner {
				current: AuthoritySet::genesis(genesis_authorities),
				pending: HashMap::new(),
			}),
		}
	}

	pub fn current(&self) -> AuthoritySet {
		self.inner.lock().current.clone()
	}

	/// Record a scheduled change announced by `block`.
	pub fn on_scheduled_change(&self, block: BlockInfo, change: &ScheduledChange) {
		let activates_at = block.number.saturating_add(change.delay);
		trace!(
			target: LOG_TARGET,
			"Authority set change announced at {block}, activates at #{activates_at}",
		);
		self.inner.lock().pending.insert(
			block.hash,
			PendingChange {
				announced_at: block,
				activates_at,
				next_authorities: change.next_authorities.clone(),
			},
		);
	}

	/// Forget a change announced by `block`; used to roll back a failed
	/// import.
	pub fn cancel(&self, block: &H256) {
		if self.inner.lock().pending.remove(block).is_some() {
			trace!(target: LOG_TARGET, "Rolled back authority set change of 0x{block:x}");
		}
	}

	/// Apply or drop pending changes in reaction to `finalized`.
	pub fn on_finalized(&self, tree: &BlockTree, finalized: BlockInfo) {
		let mut inner = self.inner.lock();
		let mut due: Vec<H256> = inner
			.pending
			.iter()
			.filter(|(_, change)| change.activates_at <= finalized.number)
			.map(|(hash, _)| *hash)
			.collect();
		// Activate in announcement order so consecutive changes bump the
		// set id deterministically.
		due.sort_by_key(|hash| inner.pending[hash].announced_at.number);

		for hash in due {
			let on_canonical_chain = tree.has_direct_chain(&hash, &finalized.hash);
			let Some(change) = inner.pending.remove(&hash) else { continue };
			if on_canonical_chain {
				inner.current = AuthoritySet {
					id: inner.current.id + 1,
					authorities: change.next_authorities,
				};
				debug!(
					target: LOG_TARGET,
					"Authority set changed to id {} at finalization of {finalized} \
					 (announced at {})",
					inner.current.id,
					change.announced_at,
				);
			} else {
				debug!(
					target: LOG_TARGET,
					"Dropping authority set change announced on pruned branch at {}",
					change.announced_at,
				);
			}
		}
	}
}
