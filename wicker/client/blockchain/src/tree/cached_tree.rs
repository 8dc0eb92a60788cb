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

//! The in-memory representation of the unfinalized part of the chain.
//!
//! Nodes live in an arena and refer to each other by index, with a
//! hash→index map on the side; the root is always the last finalized
//! block and every other node descends from it.

use crate::error::Error;
use std::collections::{HashMap, HashSet, VecDeque};
use wp_core::{BlockInfo, BlockNumber, H256};

pub(crate) type NodeIdx = usize;

/// Fork-choice weight of a node: the count of primary slot claims on the
/// chain from the root, then the height. Compared together with the hash
/// so that the ordering over leaves is total.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Weight {
	pub primary: u64,
	pub number: BlockNumber,
}

#[derive(Debug)]
pub(crate) struct TreeNode {
	pub info: BlockInfo,
	pub parent: Option<NodeIdx>,
	pub children: Vec<NodeIdx>,
	pub weight: Weight,
	pub finalized: bool,
	pub has_body: bool,
	pub has_justification: bool,
}

impl TreeNode {
	pub fn is_leaf(&self) -> bool {
		self.children.is_empty()
	}
}

/// What a finalization removed from memory.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct PruneOutcome {
	/// Ancestors of the newly finalized block, oldest first, strictly
	/// between the previous root and the new one. They stay in storage as
	/// part of the canonical chain.
	pub retired: Vec<BlockInfo>,
	/// Blocks on branches that do not contain the finalized block,
	/// parents before children. Gone for good.
	pub pruned: Vec<BlockInfo>,
}

pub(crate) struct CachedTree {
	nodes: Vec<Option<TreeNode>>,
	free: Vec<NodeIdx>,
	index: HashMap<H256, NodeIdx>,
	root: NodeIdx,
	best: NodeIdx,
	leaves: HashSet<NodeIdx>,
}

impl CachedTree {
	/// Create a tree holding only `root`, the last finalized block.
	pub fn new(root: BlockInfo) -> Self {
		let node = TreeNode {
			info: root,
			parent: None,
			children: Vec::new(),
			weight: Weight { primary: 0, number: root.number },
			finalized: true,
			has_body: true,
			has_justification: false,
		};
		let mut index = HashMap::new();
		index.insert(root.hash, 0);
		Self {
			nodes: vec![Some(node)],
			free: Vec::new(),
			index,
			root: 0,
			best: 0,
			leaves: HashSet::from([0]),
		}
	}

	fn node(&self, idx: NodeIdx) -> &TreeNode {
		self.nodes[idx].as_ref().expect("indices handed out only for occupied slots; qed")
	}

	fn node_mut(&mut self, idx: NodeIdx) -> &mut TreeNode {
		self.nodes[idx].as_mut().expect("indices handed out only for occupied slots; qed")
	}

	pub fn contains(&self, hash: &H256) -> bool {
		self.index.contains_key(hash)
	}

	pub fn get(&self, hash: &H256) -> Option<&TreeNode> {
		self.index.get(hash).map(|&idx| self.node(idx))
	}

	/// Whether the node is part of the finalized chain; only the root is.
	pub fn is_finalized(&self, hash: &H256) -> bool {
		self.get(hash).map_or(false, |node| node.finalized)
	}

	pub fn root_info(&self) -> BlockInfo {
		self.node(self.root).info
	}

	pub fn best_info(&self) -> BlockInfo {
		self.node(self.best).info
	}

	/// Number of nodes, the root included.
	pub fn len(&self) -> usize {
		self.index.len()
	}

	/// Leaves sorted by height descending, hash as tie-break.
	pub fn leaf_hashes(&self) -> Vec<H256> {
		let mut leaves: Vec<BlockInfo> =
			self.leaves.iter().map(|&idx| self.node(idx).info).collect();
		leaves.sort_by(|a, b| b.cmp(a));
		leaves.into_iter().map(|info| info.hash).collect()
	}

	fn alloc(&mut self, node: TreeNode) -> NodeIdx {
		match self.free.pop() {
			Some(idx) => {
				self.nodes[idx] = Some(node);
				idx
			},
			None => {
				self.nodes.push(Some(node));
				self.nodes.len() - 1
			},
		}
	}

	fn release(&mut self, idx: NodeIdx) {
		if let Some(node) = self.nodes[idx].take() {
			self.index.remove(&node.info.hash);
			self.leaves.remove(&idx);
			self.free.push(idx);
		}
	}

	fn best_key(&self, idx: NodeIdx) -> (Weight, H256) {
		let node = self.node(idx);
		(node.weight, node.info.hash)
	}

	fn update_best(&mut self) {
		self.best = self
			.leaves
			.iter()
			.copied()
			.max_by_key(|&idx| self.best_key(idx))
			.unwrap_or(self.root);
	}

	/// Insert a node under its parent.
	pub fn add(
		&mut self,
		info: BlockInfo,
		parent_hash: &H256,
		primary: bool,
		has_body: bool,
		has_justification: bool,
	) -> Result<(), Error> {
		if self.contains(&info.hash) {
			return Err(Error::BlockExists(info.hash))
		}
		let parent = *self.index.get(parent_hash).ok_or(Error::ParentNotFound(info.hash))?;

		let weight = Weight {
			primary: self.node(parent).weight.primary + primary as u64,
			number: info.number,
		};
		let idx = self.alloc(TreeNode {
			info,
			parent: Some(parent),
			children: Vec::new(),
			weight,
			finalized: false,
			has_body,
			has_justification,
		});
		self.index.insert(info.hash, idx);
		self.node_mut(parent).children.push(idx);
		self.leaves.remove(&parent);
		self.leaves.insert(idx);
		self.update_best();
		Ok(())
	}

	/// Remove a childless non-root node.
	pub fn remove_leaf(&mut self, hash: &H256) -> Result<BlockInfo, Error> {
		let idx = *self.index.get(hash).ok_or(Error::BlockNotFound(*hash))?;
		if idx == self.root || !self.node(idx).is_leaf() {
			return Err(Error::NotALeaf(*hash))
		}
		let info = self.node(idx).info;
		let parent = self.node(idx).parent.expect("non-root node has a parent; qed");
		self.node_mut(parent).children.retain(|&child| child != idx);
		if self.node(parent).is_leaf() {
			self.leaves.insert(parent);
		}
		self.release(idx);
		self.update_best();
		Ok(info)
	}

	/// Whether `descendant` sits on a branch passing through `ancestor`.
	/// A block is considered its own descendant.
	pub fn is_descendant(&self, ancestor: &H256, descendant: &H256) -> bool {
		let Some(&ancestor_idx) = self.index.get(ancestor) else { return false };
		let Some(&descendant_idx) = self.index.get(descendant) else { return false };
		let ancestor_number = self.node(ancestor_idx).info.number;
		let mut idx = descendant_idx;
		loop {
			if idx == ancestor_idx {
				return true
			}
			let node = self.node(idx);
			if node.info.number <= ancestor_number {
				return false
			}
			match node.parent {
				Some(parent) => idx = parent,
				None => return false,
			}
		}
	}

	/// The best leaf whose branch contains `target`, walked down to
	/// `max_number` when the leaf overshoots it.
	pub fn best_containing(
		&self,
		target: &H256,
		max_number: Option<BlockNumber>,
	) -> Result<Option<BlockInfo>, Error> {
		let &target_idx = match self.index.get(target) {
			Some(idx) => idx,
			None => return Ok(None),
		};
		let target_number = self.node(target_idx).info.number;
		if let Some(max) = max_number {
			if target_number > max {
				return Err(Error::TargetIsPastMax)
			}
		}

		let mut leaves: Vec<NodeIdx> = self.leaves.iter().copied().collect();
		leaves.sort_by_key(|&idx| std::cmp::Reverse(self.best_key(idx)));

		for leaf in leaves {
			if !self.is_descendant(target, &self.node(leaf).info.hash) {
				continue
			}
			let mut idx = leaf;
			if let Some(max) = max_number {
				while self.node(idx).info.number > max {
					idx = self
						.node(idx)
						.parent
						.expect("walk stops at target which is within max; qed");
				}
			}
			return Ok(Some(self.node(idx).info))
		}
		Ok(None)
	}

	/// Make `hash` the new root, dropping everything not on its branch.
	///
	/// Finalizing the current root is a no-op with an empty outcome.
	pub fn finalize(&mut self, hash: &H256) -> Result<PruneOutcome, Error> {
		let &final_idx = self.index.get(hash).ok_or(Error::BlockNotFound(*hash))?;
		if self.node(final_idx).finalized {
			return Ok(PruneOutcome::default())
		}

		// The subtree rooted at the newly finalized block survives.
		let mut keep = HashSet::new();
		let mut queue = VecDeque::from([final_idx]);
		while let Some(idx) = queue.pop_front() {
			keep.insert(idx);
			queue.extend(self.node(idx).children.iter().copied());
		}

		// Ancestors between the old root and the finalized block join the
		// canonical chain.
		let mut retired = Vec::new();
		let mut cursor = self.node(final_idx).parent;
		while let Some(idx) = cursor {
			if idx == self.root {
				break
			}
			retired.push(self.node(idx).info);
			cursor = self.node(idx).parent;
		}
		retired.reverse();
		let retired_set: HashSet<NodeIdx> =
			retired.iter().filter_map(|info| self.index.get(&info.hash).copied()).collect();

		// Everything else is discarded, parents before children.
		let mut pruned = Vec::new();
		let mut queue = VecDeque::from([self.root]);
		while let Some(idx) = queue.pop_front() {
			if keep.contains(&idx) {
				continue
			}
			if !retired_set.contains(&idx) && idx != self.root {
				pruned.push(self.node(idx).info);
			}
			queue.extend(self.node(idx).children.iter().copied());
		}

		let occupied: Vec<NodeIdx> =
			(0..self.nodes.len()).filter(|idx| self.nodes[*idx].is_some()).collect();
		for idx in occupied {
			if !keep.contains(&idx) {
				self.release(idx);
			}
		}

		self.root = final_idx;
		let root = self.node_mut(final_idx);
		root.parent = None;
		root.finalized = true;
		root.has_justification = true;

		self.leaves = self
			.index
			.values()
			.copied()
			.filter(|&idx| self.node(idx).is_leaf())
			.collect();
		if self.leaves.is_empty() {
			self.leaves.insert(self.root);
		}
		self.update_best();

		Ok(PruneOutcome { retired, pruned })
	}
}
