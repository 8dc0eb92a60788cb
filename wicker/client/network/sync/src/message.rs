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

//! Typed sync-protocol messages. The wire codec lives with the transport;
//! requests and responses cross the seam already decoded.

use codec::Encode;
use wp_core::{blake2_256, BlockData, BlockId, H256};

bitflags::bitflags! {
	/// Which parts of block data a request asks for.
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
	pub struct BlockAttributes: u32 {
		const HEADER = 0b0000_0001;
		const BODY = 0b0000_0010;
		const JUSTIFICATION = 0b0000_0100;
	}
}

/// Sequence direction of a ranged request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode)]
pub enum Direction {
	/// From the starting block towards higher numbers.
	Ascending,
	/// From the starting block towards genesis.
	Descending,
}

/// Stable identity of a request's semantic content, for duplicate
/// suppression. The request `id` is excluded on purpose.
pub type RequestFingerprint = u64;

/// Request for a run of blocks.
#[derive(Clone, Debug)]
pub struct BlocksRequest {
	/// Unique, monotonically increasing request id.
	pub id: u64,
	/// Parts of [`BlockData`] to return.
	pub fields: BlockAttributes,
	/// Start from this block.
	pub from: BlockId,
	/// End at this block; the responder picks its own cap when absent.
	pub to: Option<H256>,
	pub direction: Direction,
	/// Maximum number of blocks to return; responder-defined when absent.
	pub max: Option<u32>,
}

impl BlocksRequest {
	/// Header, body and justification together.
	pub const BASIC_ATTRIBUTES: BlockAttributes = BlockAttributes::HEADER
		.union(BlockAttributes::BODY)
		.union(BlockAttributes::JUSTIFICATION);

	pub fn attribute_is_set(&self, attribute: BlockAttributes) -> bool {
		self.fields.contains(attribute)
	}

	/// Hash over the semantic request fields, excluding `id`.
	pub fn fingerprint(&self) -> RequestFingerprint {
		let encoded =
			(self.fields.bits(), &self.from, &self.to, &self.direction, &self.max).encode();
		let digest = blake2_256(&encoded);
		let mut raw = [0u8; 8];
		raw.copy_from_slice(&digest[..8]);
		u64::from_le_bytes(raw)
	}
}

/// Response to a [`BlocksRequest`], blocks in request order.
#[derive(Clone, Debug, Default)]
pub struct BlocksResponse {
	pub blocks: Vec<BlockData>,
}

/// Request for a page of the state trie at a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateRequest {
	pub block: H256,
	/// Resume cursor: the last keys received, outermost trie first.
	pub start: Vec<Vec<u8>>,
	/// Skip proof generation; the snapshot root is verified on commit.
	pub no_proof: bool,
}

/// One key-value entry of a state page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateEntry {
	pub key: Vec<u8>,
	pub value: Vec<u8>,
}

/// Entries of one trie (the top trie or a child trie) in a state page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValueStateEntry {
	/// Root of the trie these entries belong to; empty for the top trie.
	pub state_root: Vec<u8>,
	pub entries: Vec<StateEntry>,
	/// Whether this trie has been sent completely.
	pub complete: bool,
}

/// Response to a [`StateRequest`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateResponse {
	pub entries: Vec<KeyValueStateEntry>,
	/// Optional proof nodes; empty when the request set `no_proof`.
	pub proof: Vec<u8>,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn request(id: u64, from: BlockId, max: Option<u32>) -> BlocksRequest {
		BlocksRequest {
			id,
			fields: BlocksRequest::BASIC_ATTRIBUTES,
			from,
			to: None,
			direction: Direction::Ascending,
			max,
		}
	}

	#[test]
	fn fingerprint_ignores_id_but_not_fields() {
		let a = request(1, BlockId::Number(5), None);
		let b = request(2, BlockId::Number(5), None);
		assert_eq!(a.fingerprint(), b.fingerprint());

		let c = request(1, BlockId::Number(6), None);
		assert_ne!(a.fingerprint(), c.fingerprint());

		let d = request(1, BlockId::Number(5), Some(1));
		assert_ne!(a.fingerprint(), d.fingerprint());

		let mut e = request(1, BlockId::Number(5), None);
		e.fields = BlockAttributes::HEADER;
		assert_ne!(a.fingerprint(), e.fingerprint());
	}

	#[test]
	fn basic_attributes_cover_all_parts() {
		let request = request(0, BlockId::Number(0), None);
		assert!(request.attribute_is_set(BlockAttributes::HEADER));
		assert!(request.attribute_is_set(BlockAttributes::BODY));
		assert!(request.attribute_is_set(BlockAttributes::JUSTIFICATION));
	}
}
