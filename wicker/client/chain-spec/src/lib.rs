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

//! Chain specification ingress: the JSON document naming a chain, its
//! boot nodes and its raw genesis storage, plus the genesis state-root
//! computation over the external trie engine.

use serde::Deserialize;
use std::{collections::BTreeMap, path::PathBuf, str::FromStr};
use wp_core::{traits::TrieBackend, H256};

/// Key prefix under which default child-trie roots live in the top trie.
const CHILD_STORAGE_DEFAULT_PREFIX: &[u8] = b":child_storage:default:";

#[derive(Debug, thiserror::Error)]
pub enum ChainSpecError {
	#[error("failed to read chain spec: {0}")]
	Io(#[from] std::io::Error),

	#[error("failed to parse chain spec JSON: {0}")]
	Json(#[from] serde_json::Error),

	#[error("invalid hex in chain spec: {0}")]
	InvalidHex(String),
}

/// A well-known chain or a path to a custom spec file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainSelect {
	Polkadot,
	Kusama,
	Rococo,
	Westend,
	Custom(PathBuf),
}

impl FromStr for ChainSelect {
	type Err = std::convert::Infallible;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		Ok(match value {
			"polkadot" => Self::Polkadot,
			"kusama" => Self::Kusama,
			"rococo" => Self::Rococo,
			"westend" => Self::Westend,
			path => Self::Custom(PathBuf::from(path)),
		})
	}
}

/// Raw genesis storage: hex-encoded key-value pairs of the top trie and
/// of each default child trie.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawGenesis {
	#[serde(default)]
	pub top: BTreeMap<String, String>,
	#[serde(default, rename = "childrenDefault")]
	pub children_default: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Deserialize)]
struct Genesis {
	raw: RawGenesis,
}

/// A parsed chain specification document.
#[derive(Clone, Debug, Deserialize)]
pub struct ChainSpec {
	pub name: String,
	pub id: String,
	#[serde(default, rename = "chainType")]
	pub chain_type: Option<String>,
	#[serde(default, rename = "bootNodes")]
	pub boot_nodes: Vec<String>,
	#[serde(default, rename = "protocolId")]
	pub protocol_id: Option<String>,
	#[serde(default)]
	pub properties: Option<serde_json::Value>,
	genesis: Genesis,
}

fn decode_hex(value: &str) -> Result<Vec<u8>, ChainSpecError> {
	array_bytes::hex2bytes(value)
		.map_err(|_| ChainSpecError::InvalidHex(value.to_string()))
}

impl ChainSpec {
	pub fn from_json_str(json: &str) -> Result<Self, ChainSpecError> {
		Ok(serde_json::from_str(json)?)
	}

	pub fn from_json_file(path: &std::path::Path) -> Result<Self, ChainSpecError> {
		Self::from_json_str(&std::fs::read_to_string(path)?)
	}

	/// Decoded top-trie genesis entries.
	pub fn genesis_top(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainSpecError> {
		self.genesis
			.raw
			.top
			.iter()
			.map(|(key, value)| Ok((decode_hex(key)?, decode_hex(value)?)))
			.collect()
	}

	/// Decoded default-child-trie genesis entries, keyed by child id.
	pub fn genesis_children_default(
		&self,
	) -> Result<Vec<(Vec<u8>, Vec<(Vec<u8>, Vec<u8>)>)>, ChainSpecError> {
		self.genesis
			.raw
			.children_default
			.iter()
			.map(|(child, entries)| {
				let entries = entries
					.iter()
					.map(|(key, value)| Ok((decode_hex(key)?, decode_hex(value)?)))
					.collect::<Result<Vec<_>, ChainSpecError>>()?;
				Ok((decode_hex(child)?, entries))
			})
			.collect()
	}

	/// Genesis state root: every top entry goes into an empty trie, each
	/// child trie's root is folded in under
	/// `:child_storage:default:<child id>`, and the resulting root is the
	/// chain's genesis state root.
	pub fn genesis_state_root(&self, trie: &dyn TrieBackend) -> Result<H256, ChainSpecError> {
		let mut top = self.genesis_top()?;
		for (child, entries) in self.genesis_children_default()? {
			let child_root = trie.storage_root(&entries);
			let mut key = CHILD_STORAGE_DEFAULT_PREFIX.to_vec();
			key.extend_from_slice(&child);
			top.push((key, child_root.as_bytes().to_vec()));
		}
		Ok(trie.storage_root(&top))
	}
}
