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

//! Block, body and wire-level block data.

use crate::header::BlockHeader;
use codec::{Decode, Encode};
use primitive_types::H256;

/// A transaction as the client sees it: an opaque byte string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct OpaqueExtrinsic(pub Vec<u8>);

/// Ordered list of a block's extrinsics.
pub type BlockBody = Vec<OpaqueExtrinsic>;

/// An opaque, SCALE-encoded finality justification.
///
/// Typed decoding happens in the finality gadget that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct EncodedJustification(pub Vec<u8>);

/// A complete block.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Block {
	pub header: BlockHeader,
	pub body: BlockBody,
}

impl Block {
	pub fn hash(&self) -> H256 {
		self.header.hash()
	}
}

/// Block material as it arrives from the network; every part beyond the
/// hash is present only if the request asked for it and the peer had it.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BlockData {
	/// Advertised header hash.
	pub hash: H256,
	pub header: Option<BlockHeader>,
	pub body: Option<BlockBody>,
	pub justification: Option<EncodedJustification>,
}

impl BlockData {
	/// Block data carrying only a hash.
	pub fn bare(hash: H256) -> Self {
		Self { hash, header: None, body: None, justification: None }
	}
}
