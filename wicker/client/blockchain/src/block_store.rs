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

//! Column-oriented persistent block storage.
//!
//! Values are SCALE-encoded. Keys are header hashes, except in
//! [`columns::LOOKUP_KEY`] where the big-endian block number maps to the
//! canonical hash at that height, and in [`columns::DEFAULT_META`] where a
//! few fixed keys hold chain metadata.

use crate::error::Error;
use codec::{Decode, Encode};
use kvdb::{DBTransaction, KeyValueDB};
use std::sync::Arc;
use wp_core::{Block, BlockBody, BlockHeader, BlockInfo, BlockNumber, EncodedJustification, H256};

/// Storage spaces, one database column each.
pub mod columns {
	pub const DEFAULT_META: u32 = 0;
	pub const HEADER: u32 = 1;
	pub const BODY: u32 = 2;
	pub const JUSTIFICATION: u32 = 3;
	pub const LOOKUP_KEY: u32 = 4;
	/// State-trie nodes; written by the trie storage engine, never by the
	/// block store itself.
	pub const TRIE_NODE: u32 = 5;
	/// Changes-trie nodes; same ownership as [`TRIE_NODE`].
	pub const CHANGES_TRIE: u32 = 6;

	pub const NUM_COLUMNS: u32 = 7;
}

mod meta_keys {
	pub const GENESIS_HASH: &[u8] = b"wicker_genesis_hash";
	pub const LAST_FINALIZED: &[u8] = b"wicker_last_finalized";
	pub const LEAVES: &[u8] = b"wicker_leaves";
}

fn number_key(number: BlockNumber) -> [u8; 8] {
	number.to_be_bytes()
}

/// Persistent block storage over a column database.
pub struct BlockStore {
	db: Arc<dyn KeyValueDB>,
}

impl BlockStore {
	pub fn new(db: Arc<dyn KeyValueDB>) -> Self {
		Self { db }
	}

	fn get<T: Decode>(&self, column: u32, key: &[u8]) -> Result<Option<T>, Error> {
		match self.db.get(column, key)? {
			Some(raw) => Ok(Some(T::decode(&mut &raw[..])?)),
			None => Ok(None),
		}
	}

	/// Persist a header and return its hash.
	pub fn put_header(&self, header: &BlockHeader) -> Result<H256, Error> {
		let hash = header.hash();
		let mut tx = DBTransaction::new();
		tx.put(columns::HEADER, hash.as_bytes(), &header.encode());
		self.db.write(tx)?;
		Ok(hash)
	}

	/// Persist a full block and return its hash.
	pub fn put_block(&self, block: &Block) -> Result<H256, Error> {
		let hash = block.hash();
		let mut tx = DBTransaction::new();
		tx.put(columns::HEADER, hash.as_bytes(), &block.header.encode());
		tx.put(columns::BODY, hash.as_bytes(), &block.body.encode());
		self.db.write(tx)?;
		Ok(hash)
	}

	pub fn header(&self, hash: &H256) -> Result<Option<BlockHeader>, Error> {
		self.get(columns::HEADER, hash.as_bytes())
	}

	pub fn has_header(&self, hash: &H256) -> Result<bool, Error> {
		Ok(self.db.get(columns::HEADER, hash.as_bytes())?.is_some())
	}

	/// Header lookup that treats absence as [`Error::MissingHeader`].
	pub fn require_header(&self, hash: &H256) -> Result<BlockHeader, Error> {
		self.header(hash)?.ok_or(Error::MissingHeader(*hash))
	}

	pub fn body(&self, hash: &H256) -> Result<Option<BlockBody>, Error> {
		self.get(columns::BODY, hash.as_bytes())
	}

	pub fn justification(&self, hash: &H256) -> Result<Option<EncodedJustification>, Error> {
		self.get(columns::JUSTIFICATION, hash.as_bytes())
	}

	pub fn put_justification(
		&self,
		hash: &H256,
		justification: &EncodedJustification,
	) -> Result<(), Error> {
		let mut tx = DBTransaction::new();
		tx.put(columns::JUSTIFICATION, hash.as_bytes(), &justification.encode());
		self.db.write(tx)?;
		Ok(())
	}

	pub fn remove_justification(&self, hash: &H256) -> Result<(), Error> {
		let mut tx = DBTransaction::new();
		tx.delete(columns::JUSTIFICATION, hash.as_bytes());
		self.db.write(tx)?;
		Ok(())
	}

	/// Record `block` as the canonical block at its height.
	pub fn assign_number_to_hash(&self, block: BlockInfo) -> Result<(), Error> {
		let mut tx = DBTransaction::new();
		tx.put(columns::LOOKUP_KEY, &number_key(block.number), &block.hash.encode());
		self.db.write(tx)?;
		Ok(())
	}

	pub fn hash_by_number(&self, number: BlockNumber) -> Result<Option<H256>, Error> {
		self.get(columns::LOOKUP_KEY, &number_key(number))
	}

	/// Drop a block's header, body and justification; the number→hash
	/// assignment is removed only if it points at this very block.
	pub fn remove_block(&self, block: &BlockInfo) -> Result<(), Error> {
		let mut tx = DBTransaction::new();
		tx.delete(columns::HEADER, block.hash.as_bytes());
		tx.delete(columns::BODY, block.hash.as_bytes());
		tx.delete(columns::JUSTIFICATION, block.hash.as_bytes());
		if self.hash_by_number(block.number)? == Some(block.hash) {
			tx.delete(columns::LOOKUP_KEY, &number_key(block.number));
		}
		self.db.write(tx)?;
		Ok(())
	}

	pub fn set_genesis_hash(&self, hash: &H256) -> Result<(), Error> {
		let mut tx = DBTransaction::new();
		tx.put(columns::DEFAULT_META, meta_keys::GENESIS_HASH, &hash.encode());
		self.db.write(tx)?;
		Ok(())
	}

	pub fn genesis_hash(&self) -> Result<Option<H256>, Error> {
		self.get(columns::DEFAULT_META, meta_keys::GENESIS_HASH)
	}

	pub fn set_last_finalized(&self, block: BlockInfo) -> Result<(), Error> {
		let mut tx = DBTransaction::new();
		tx.put(columns::DEFAULT_META, meta_keys::LAST_FINALIZED, &block.encode());
		self.db.write(tx)?;
		Ok(())
	}

	pub fn last_finalized(&self) -> Result<Option<BlockInfo>, Error> {
		self.get(columns::DEFAULT_META, meta_keys::LAST_FINALIZED)
	}

	/// Persist the current leaf set; read back on tree recovery.
	pub fn set_leaves(&self, leaves: &[H256]) -> Result<(), Error> {
		let mut tx = DBTransaction::new();
		tx.put(columns::DEFAULT_META, meta_keys::LEAVES, &leaves.encode());
		self.db.write(tx)?;
		Ok(())
	}

	pub fn leaves(&self) -> Result<Vec<H256>, Error> {
		Ok(self.get(columns::DEFAULT_META, meta_keys::LEAVES)?.unwrap_or_default())
	}
}
