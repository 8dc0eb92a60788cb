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

//! State snapshot download for fast sync.
//!
//! The remote state trie is paged with a resumable key cursor, entries
//! accumulate per trie (top and child), and on completion everything is
//! committed through the trie engine, verifying that the recomputed root
//! equals the target header's state root.

use crate::{
	error::SyncError,
	message::{KeyValueStateEntry, StateRequest, StateResponse},
	LOG_TARGET,
};
use log::{debug, trace};
use smallvec::SmallVec;
use std::collections::HashMap;
use wp_core::{traits::TrieBackend, BlockHeader, BlockInfo, H256};

/// Storage-key prefix under which child-trie roots live in the top trie.
const CHILD_STORAGE_PREFIX: &[u8] = b":child_storage:";

fn is_child_storage_key(key: &[u8]) -> bool {
	key.starts_with(CHILD_STORAGE_PREFIX)
}

/// What a processed response means for the flow.
#[derive(Debug, PartialEq, Eq)]
pub enum StateSyncStatus {
	/// Everything received; ready for [`StateSyncFlow::commit`].
	Complete,
	/// More pages to fetch.
	Continue,
	/// Response was unusable; try another peer.
	BadResponse,
}

/// Per-trie accumulation: the entries themselves, plus the top-trie keys
/// whose value is this trie's root.
#[derive(Default)]
struct TrieEntries {
	key_values: Vec<(Vec<u8>, Vec<u8>)>,
	storage_keys: Vec<Vec<u8>>,
}

/// One state download in progress. At most one flow exists at a time.
pub struct StateSyncFlow {
	target: BlockInfo,
	target_header: BlockHeader,
	/// Resume cursor: last key of the top trie, optionally followed by
	/// the last key inside an unfinished child trie.
	last_key: SmallVec<[Vec<u8>; 2]>,
	/// Accumulated entries keyed by child-trie root; the empty key is the
	/// top trie.
	state: HashMap<Vec<u8>, TrieEntries>,
	complete: bool,
	imported_entries: u64,
	imported_bytes: u64,
	skip_proof: bool,
}

impl StateSyncFlow {
	pub fn new(target: BlockInfo, target_header: BlockHeader, skip_proof: bool) -> Self {
		Self {
			target,
			target_header,
			last_key: SmallVec::default(),
			state: HashMap::default(),
			complete: false,
			imported_entries: 0,
			imported_bytes: 0,
			skip_proof,
		}
	}

	pub fn block_info(&self) -> BlockInfo {
		self.target
	}

	pub fn is_complete(&self) -> bool {
		self.complete
	}

	pub fn next_request(&self) -> StateRequest {
		StateRequest {
			block: self.target.hash,
			start: self.last_key.clone().into_vec(),
			no_proof: self.skip_proof,
		}
	}

	/// Fold one response into the accumulated state and advance the
	/// cursor.
	pub fn on_response(&mut self, response: &StateResponse) -> StateSyncStatus {
		if response.entries.is_empty() && response.proof.is_empty() {
			debug!(target: LOG_TARGET, "Bad state response for block {}", self.target);
			return StateSyncStatus::BadResponse
		}

		// A response that only continues a child trie keeps the parent
		// cursor position valid.
		if self.last_key.len() == 2 &&
			response.entries.first().map_or(false, |state| state.entries.is_empty())
		{
			self.last_key.pop();
		} else {
			self.last_key.clear();
		}

		let mut complete = true;
		for state in &response.entries {
			if !state.complete {
				if let Some(last) = state.entries.last() {
					self.last_key.push(last.key.clone());
				}
				complete = false;
			}
			self.accumulate(state);
		}

		if complete {
			self.complete = true;
			StateSyncStatus::Complete
		} else {
			trace!(
				target: LOG_TARGET,
				"State page for block {} processed, {} entries so far",
				self.target,
				self.imported_entries,
			);
			StateSyncStatus::Continue
		}
	}

	fn accumulate(&mut self, state: &KeyValueStateEntry) {
		let is_top = state.state_root.is_empty();
		let mut child_roots = Vec::new();

		{
			let entry = self.state.entry(state.state_root.clone()).or_default();
			for kv in &state.entries {
				// Child roots stored in the top trie are recomputed on
				// commit; remember the key, drop the stale value.
				if is_top && is_child_storage_key(&kv.key) {
					child_roots.push((kv.value.clone(), kv.key.clone()));
				} else {
					self.imported_entries += 1;
					self.imported_bytes += (kv.key.len() + kv.value.len()) as u64;
					entry.key_values.push((kv.key.clone(), kv.value.clone()));
				}
			}
		}

		for (root, storage_key) in child_roots {
			self.state.entry(root).or_default().storage_keys.push(storage_key);
		}
	}

	/// Commit the snapshot: child tries first, their fresh roots folded
	/// into the top trie, then the top trie itself. Fails with
	/// [`SyncError::StateRootMismatch`] unless the final root equals the
	/// target header's state root.
	pub fn commit(&self, trie: &dyn TrieBackend) -> Result<H256, SyncError> {
		let mut top: Vec<(Vec<u8>, Vec<u8>)> = self
			.state
			.get(&Vec::new())
			.map(|entries| entries.key_values.clone())
			.unwrap_or_default();

		for (declared_root, entries) in &self.state {
			if declared_root.is_empty() {
				continue
			}
			let child_root = trie
				.commit(entries.key_values.clone())
				.map_err(|error| SyncError::Blockchain(error.to_string()))?;
			for storage_key in &entries.storage_keys {
				top.push((storage_key.clone(), child_root.as_bytes().to_vec()));
			}
		}

		let root = trie
			.commit(top)
			.map_err(|error| SyncError::Blockchain(error.to_string()))?;
		if root != self.target_header.state_root {
			debug!(
				target: LOG_TARGET,
				"State snapshot for block {} commits to {root:?}, header says {:?}",
				self.target,
				self.target_header.state_root,
			);
			return Err(SyncError::StateRootMismatch)
		}
		debug!(
			target: LOG_TARGET,
			"State snapshot for block {} committed: {} entries, {} bytes",
			self.target,
			self.imported_entries,
			self.imported_bytes,
		);
		Ok(root)
	}

	/// Rough download progress: percentage by cursor position plus bytes
	/// received so far.
	pub fn progress(&self) -> (u32, u64) {
		let cursor = *self.last_key.first().and_then(|key| key.first()).unwrap_or(&0u8);
		(cursor as u32 * 100 / 256, self.imported_bytes)
	}
}
