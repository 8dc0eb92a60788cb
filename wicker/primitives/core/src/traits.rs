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

//! Seams for the runtime executor and the trie storage engine.

use crate::block::Block;
use primitive_types::H256;

/// Errors surfaced by the trie storage engine.
#[derive(Debug, thiserror::Error)]
pub enum TrieError {
	#[error("trie storage error: {0}")]
	Backend(String),
	#[error("state at root {0} is not available")]
	StateUnavailable(H256),
}

/// The trie storage engine.
///
/// Used to compute storage roots (genesis construction), to commit a
/// downloaded state snapshot, and to answer whether a state is locally
/// available.
pub trait TrieBackend: Send + Sync {
	/// Root of the trie built from `entries` alone. Nothing is persisted.
	fn storage_root(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> H256;

	/// Persist `entries` as a complete trie and return the resulting root.
	fn commit(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<H256, TrieError>;

	/// Whether the state with the given root is present in local storage.
	fn has_state_at(&self, root: &H256) -> bool;
}

/// Errors surfaced by the runtime executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
	#[error("state at root {0} is not available")]
	StateUnavailable(H256),
	#[error("runtime execution failed: {0}")]
	Execution(String),
}

/// The WASM runtime executor.
pub trait RuntimeExecutor: Send + Sync {
	/// Execute `block`'s extrinsics on top of the state at
	/// `parent_state_root` and return the resulting storage root.
	fn execute_block(
		&self,
		parent_state_root: &H256,
		block: &Block,
	) -> Result<H256, ExecutorError>;
}
