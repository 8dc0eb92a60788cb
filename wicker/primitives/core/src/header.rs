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

//! Block header and digest types.

use crate::{blake2_256, BlockInfo, BlockNumber};
use codec::{Decode, Encode};
use primitive_types::H256;

/// Four-byte identifier of the consensus engine a digest item belongs to.
pub type ConsensusEngineId = [u8; 4];

/// Engine id of BABE digest items.
pub const BABE_ENGINE_ID: ConsensusEngineId = *b"BABE";

/// Engine id of GRANDPA digest items.
pub const GRANDPA_ENGINE_ID: ConsensusEngineId = *b"FRNK";

/// A single log entry of a header digest.
///
/// The variant indices follow the reference wire format.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum DigestItem {
	/// Opaque payload not interpreted by the client.
	#[codec(index = 0)]
	Other(Vec<u8>),
	/// A message from the runtime to the consensus engine.
	#[codec(index = 4)]
	Consensus(ConsensusEngineId, Vec<u8>),
	/// The seal put on by the block author, always the last item.
	#[codec(index = 5)]
	Seal(ConsensusEngineId, Vec<u8>),
	/// Data the consensus engine attaches before the block is executed.
	#[codec(index = 6)]
	PreRuntime(ConsensusEngineId, Vec<u8>),
}

impl DigestItem {
	/// Payload of a pre-runtime item for `engine`, if this is one.
	pub fn as_pre_runtime(&self, engine: ConsensusEngineId) -> Option<&[u8]> {
		match self {
			Self::PreRuntime(id, payload) if *id == engine => Some(payload),
			_ => None,
		}
	}

	/// Payload of a consensus item for `engine`, if this is one.
	pub fn as_consensus(&self, engine: ConsensusEngineId) -> Option<&[u8]> {
		match self {
			Self::Consensus(id, payload) if *id == engine => Some(payload),
			_ => None,
		}
	}

	/// Payload of a seal for `engine`, if this is one.
	pub fn as_seal(&self, engine: ConsensusEngineId) -> Option<&[u8]> {
		match self {
			Self::Seal(id, payload) if *id == engine => Some(payload),
			_ => None,
		}
	}
}

/// Ordered list of digest items of a header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Digest {
	pub logs: Vec<DigestItem>,
}

impl Digest {
	pub fn push(&mut self, item: DigestItem) {
		self.logs.push(item);
	}
}

/// A block header.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct BlockHeader {
	/// Hash of the parent block's header.
	pub parent_hash: H256,
	/// Height of the block.
	#[codec(compact)]
	pub number: BlockNumber,
	/// Root of the state trie after executing the block.
	pub state_root: H256,
	/// Merkle root of the block's extrinsics.
	pub extrinsics_root: H256,
	/// Consensus digest items.
	pub digest: Digest,
}

impl BlockHeader {
	/// Content hash of the header: BLAKE2b-256 over the SCALE encoding.
	pub fn hash(&self) -> H256 {
		H256(blake2_256(&self.encode()))
	}

	/// `BlockInfo` of this header.
	pub fn block_info(&self) -> BlockInfo {
		BlockInfo::new(self.number, self.hash())
	}

	/// Hash of the header with the seal digest stripped, which is what the
	/// block author signs.
	pub fn pre_seal_hash(&self) -> H256 {
		let mut unsealed = self.clone();
		unsealed
			.digest
			.logs
			.retain(|item| !matches!(item, DigestItem::Seal(..)));
		unsealed.hash()
	}

	/// `BlockInfo` of the parent.
	pub fn parent_info(&self) -> Option<BlockInfo> {
		self.number
			.checked_sub(1)
			.map(|number| BlockInfo::new(number, self.parent_hash))
	}
}
