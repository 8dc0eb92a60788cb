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

//! Chain primitives shared by every wicker client crate: block identity,
//! headers with their digest items, opaque bodies and justifications, and
//! the trait seams behind which the fixed external collaborators live
//! (crypto providers, the WASM runtime executor, the trie storage engine).

pub mod block;
pub mod crypto;
pub mod digests;
pub mod header;
pub mod traits;

pub use block::{Block, BlockBody, BlockData, EncodedJustification, OpaqueExtrinsic};
pub use header::{BlockHeader, ConsensusEngineId, Digest, DigestItem};
pub use primitive_types::H256;

use codec::{Decode, Encode};
use std::fmt;

/// Height of a block in the chain.
pub type BlockNumber = u64;

/// Index of a BABE slot.
pub type Slot = u64;

/// Compute the BLAKE2b-256 hash of `data`.
pub fn blake2_256(data: &[u8]) -> [u8; 32] {
	let hash = blake2b_simd::Params::new().hash_length(32).hash(data);
	let mut out = [0u8; 32];
	out.copy_from_slice(hash.as_bytes());
	out
}

/// Identity of a block: its number paired with its header hash.
///
/// Ordering is lexicographic with the number first, which makes the hash the
/// tie-break between blocks of the same height.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct BlockInfo {
	pub number: BlockNumber,
	pub hash: H256,
}

impl BlockInfo {
	pub fn new(number: BlockNumber, hash: H256) -> Self {
		Self { number, hash }
	}
}

impl fmt::Display for BlockInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let bytes = self.hash.as_bytes();
		write!(
			f,
			"#{} (0x{:02x}{:02x}…{:02x}{:02x})",
			self.number, bytes[0], bytes[1], bytes[30], bytes[31],
		)
	}
}

/// Reference to a block, either by hash or by number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub enum BlockId {
	Hash(H256),
	Number(BlockNumber),
}

impl From<H256> for BlockId {
	fn from(hash: H256) -> Self {
		Self::Hash(hash)
	}
}

impl From<BlockNumber> for BlockId {
	fn from(number: BlockNumber) -> Self {
		Self::Number(number)
	}
}
