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

//! Blockchain error type.

use wp_core::H256;

/// Errors of the block store and the block tree.
///
/// Storage and codec failures are fatal and must be propagated to the top
/// level; the tree-shape variants are recoverable caller signals.
/// [`Error::BlockExists`] in particular is informational: the tree is
/// unchanged and the caller may treat the operation as already done.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("block {0} already exists in the tree")]
	BlockExists(H256),

	#[error("parent of block {0} is not found in the tree")]
	ParentNotFound(H256),

	#[error("block {0} is not found")]
	BlockNotFound(H256),

	#[error("block {0} is not a leaf")]
	NotALeaf(H256),

	#[error("target block is above the requested maximum number")]
	TargetIsPastMax,

	#[error("no direct chain between {ancestor} and {descendant}")]
	NoChainBetweenBlocks { ancestor: H256, descendant: H256 },

	#[error("header of block {0} is missing in storage")]
	MissingHeader(H256),

	#[error("block storage is not initialized")]
	UninitializedStorage,

	#[error("database error: {0}")]
	Storage(#[from] std::io::Error),

	#[error("failed to decode a stored value: {0}")]
	Codec(#[from] codec::Error),
}

impl Error {
	/// Whether this error leaves the node in a state it cannot recover
	/// from locally.
	pub fn is_fatal(&self) -> bool {
		matches!(self, Self::Storage(_) | Self::Codec(_))
	}
}
