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

//! Block executor and header appender behind the import seams.
//!
//! Both paths share [`BlockAppenderBase`]: validate the header, observe
//! its digests under a consistency guard, insert into the tree, commit
//! the guard, then hand any justification to GRANDPA. The executor
//! additionally runs the block body through the runtime and checks the
//! resulting state root before insertion.

use crate::{
	digest_tracker::{ConsistencyGuard, DigestTracker},
	verification::BlockValidator,
	LOG_TARGET,
};
use log::{debug, trace};
use std::sync::Arc;
use wc_blockchain::{
	BlockExecutor, BlockHeaderAppender, BlockTree, ImportError, ImportResultCallback,
	JustificationApplier,
};
use wc_consensus_grandpa::GrandpaEnvironment;
use wp_core::{
	traits::RuntimeExecutor, Block, BlockHeader, BlockInfo, EncodedJustification,
};

/// Logic shared between full-block execution and header-only appending.
pub struct BlockAppenderBase {
	tree: Arc<BlockTree>,
	validator: Arc<BlockValidator>,
	digest_tracker: Arc<DigestTracker>,
	grandpa: Arc<GrandpaEnvironment>,
}

impl BlockAppenderBase {
	pub fn new(
		tree: Arc<BlockTree>,
		validator: Arc<BlockValidator>,
		digest_tracker: Arc<DigestTracker>,
		grandpa: Arc<GrandpaEnvironment>,
	) -> Self {
		Self { tree, validator, digest_tracker, grandpa }
	}

	/// Validate `header` and record its consensus digests. The guard must
	/// be committed once the block is in the tree; dropping it rolls the
	/// digest state back so a failed import leaves nothing behind.
	pub fn observe_digests_and_validate_header(
		&self,
		header: &BlockHeader,
	) -> Result<ConsistencyGuard, ImportError> {
		self.validator
			.validate_header(header)
			.map_err(|error| ImportError::Verification(error.to_string()))?;
		Ok(self.digest_tracker.observe(header.block_info(), header))
	}

	/// Retry parked justifications, then apply the fresh one if present.
	pub fn apply_justifications(
		&self,
		block: BlockInfo,
		justification: Option<EncodedJustification>,
		callback: ImportResultCallback,
	) {
		self.grandpa.retry_postponed();
		match justification {
			Some(justification) =>
				self.grandpa.apply_justification(block, justification, callback),
			None => callback(Ok(())),
		}
	}

	fn check_not_yet_known(&self, block: BlockInfo) -> Result<(), ImportError> {
		if self.tree.has_block_header(&block.hash)? {
			return Err(ImportError::Tree(wc_blockchain::Error::BlockExists(block.hash)))
		}
		Ok(())
	}

	fn require_parent(&self, header: &BlockHeader) -> Result<BlockHeader, ImportError> {
		self.tree
			.get_block_header(&header.parent_hash)?
			.ok_or(ImportError::Tree(wc_blockchain::Error::ParentNotFound(header.hash())))
	}
}

/// Full-sync import: execute the body against the parent state, check the
/// state root, insert into the tree.
pub struct BabeBlockExecutor {
	base: BlockAppenderBase,
	runtime: Arc<dyn RuntimeExecutor>,
}

impl BabeBlockExecutor {
	pub fn new(base: BlockAppenderBase, runtime: Arc<dyn RuntimeExecutor>) -> Self {
		Self { base, runtime }
	}

	fn import(&self, block: Block) -> Result<(), ImportError> {
		let info = block.header.block_info();
		self.base.check_not_yet_known(info)?;
		let parent = self.base.require_parent(&block.header)?;
		let guard = self.base.observe_digests_and_validate_header(&block.header)?;

		let state_root = self
			.runtime
			.execute_block(&parent.state_root, &block)
			.map_err(|error| ImportError::Execution(error.to_string()))?;
		if state_root != block.header.state_root {
			return Err(ImportError::Execution(format!(
				"state root mismatch after execution: header has {:?}, runtime produced \
				 {state_root:?}",
				block.header.state_root,
			)))
		}

		self.base.tree.add_block(block)?;
		guard.commit();
		trace!(target: LOG_TARGET, "Executed and inserted block {info}");
		Ok(())
	}
}

impl BlockExecutor for BabeBlockExecutor {
	fn apply_block(
		&self,
		block: Block,
		justification: Option<EncodedJustification>,
		callback: ImportResultCallback,
	) {
		let info = block.header.block_info();
		match self.import(block) {
			Ok(()) => {
				debug!(target: LOG_TARGET, "Applied block {info}");
				self.base.apply_justifications(info, justification, callback);
			},
			Err(error) => callback(Err(error)),
		}
	}
}

/// Fast-sync import: validate and append the bare header.
pub struct BabeHeaderAppender {
	base: BlockAppenderBase,
}

impl BabeHeaderAppender {
	pub fn new(base: BlockAppenderBase) -> Self {
		Self { base }
	}

	fn append(&self, header: BlockHeader) -> Result<(), ImportError> {
		let info = header.block_info();
		self.base.check_not_yet_known(info)?;
		self.base.require_parent(&header)?;
		let guard = self.base.observe_digests_and_validate_header(&header)?;
		self.base.tree.add_header(header)?;
		guard.commit();
		trace!(target: LOG_TARGET, "Appended header {info}");
		Ok(())
	}
}

impl BlockHeaderAppender for BabeHeaderAppender {
	fn append_header(
		&self,
		header: BlockHeader,
		justification: Option<EncodedJustification>,
		callback: ImportResultCallback,
	) {
		let info = header.block_info();
		match self.append(header) {
			Ok(()) => {
				debug!(target: LOG_TARGET, "Appended block header {info}");
				self.base.apply_justifications(info, justification, callback);
			},
			Err(error) => callback(Err(error)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		config::{AllowedSlots, BabeConfigRepository, BabeConfiguration},
		verification::tests::{authority, genesis_header, sealed_header, StubCrypto},
	};
	use assert_matches::assert_matches;
	use codec::Encode;
	use mockall::mock;
	use parking_lot::Mutex;
	use wc_blockchain::{block_store::columns, BlockStore, ChainEvents};
	use wc_consensus_grandpa::{
		justification::{GrandpaJustification, Precommit, SignedPrecommit},
		AuthorityManager,
	};
	use wp_core::{
		crypto::{Ed25519Public, Ed25519Signature, Ed25519Verifier},
		traits::ExecutorError,
		H256,
	};

	mock! {
		pub Runtime {}

		impl RuntimeExecutor for Runtime {
			fn execute_block(
				&self,
				parent_state_root: &H256,
				block: &Block,
			) -> Result<H256, ExecutorError>;
		}
	}

	struct AcceptAllEd25519;

	impl Ed25519Verifier for AcceptAllEd25519 {
		fn verify(&self, _: &Ed25519Signature, _: &[u8], _: &Ed25519Public) -> bool {
			true
		}
	}

	struct Fixture {
		tree: Arc<BlockTree>,
		grandpa: Arc<GrandpaEnvironment>,
		config: Arc<BabeConfigRepository>,
		digest_tracker: Arc<DigestTracker>,
	}

	fn fixture() -> Fixture {
		let store =
			Arc::new(BlockStore::new(Arc::new(kvdb_memorydb::create(columns::NUM_COLUMNS))));
		let tree = Arc::new(
			BlockTree::from_genesis(store, Arc::new(ChainEvents::new()), genesis_header())
				.unwrap(),
		);
		let config = Arc::new(BabeConfigRepository::new(
			BabeConfiguration {
				epoch_length: 600,
				c: (1, 1),
				authorities: vec![(authority(1), 1)],
				randomness: [0; 32],
				allowed_slots: AllowedSlots::PrimaryAndSecondaryPlainSlots,
			},
			tree.clone(),
		));
		let authorities =
			Arc::new(AuthorityManager::new(vec![(Ed25519Public([1; 32]), 1)]));
		let grandpa = Arc::new(GrandpaEnvironment::new(
			tree.clone(),
			authorities.clone(),
			Arc::new(AcceptAllEd25519),
		));
		let digest_tracker = Arc::new(DigestTracker::new(config.clone(), authorities));
		Fixture { tree, grandpa, config, digest_tracker }
	}

	fn base_of(fixture: &Fixture) -> BlockAppenderBase {
		let validator = Arc::new(BlockValidator::new(
			fixture.tree.clone(),
			fixture.config.clone(),
			Arc::new(StubCrypto),
			Arc::new(StubCrypto),
		));
		BlockAppenderBase::new(
			fixture.tree.clone(),
			validator,
			fixture.digest_tracker.clone(),
			fixture.grandpa.clone(),
		)
	}

	fn run(
		executor: &BabeBlockExecutor,
		block: Block,
		justification: Option<EncodedJustification>,
	) -> Result<(), ImportError> {
		let result = Arc::new(Mutex::new(None));
		let sink = result.clone();
		executor.apply_block(
			block,
			justification,
			Box::new(move |outcome| *sink.lock() = Some(outcome)),
		);
		let outcome = result.lock().take().expect("import completes synchronously in tests");
		outcome
	}

	#[test]
	fn executes_and_inserts_block() {
		let fixture = fixture();
		let mut runtime = MockRuntime::new();
		runtime
			.expect_execute_block()
			.returning(|_, block| Ok(block.header.state_root));
		let executor = BabeBlockExecutor::new(base_of(&fixture), Arc::new(runtime));

		let header = sealed_header(&genesis_header(), 1, false, 1);
		let block = Block { header: header.clone(), body: vec![] };
		run(&executor, block, None).unwrap();
		assert_eq!(fixture.tree.best_leaf(), header.block_info());
	}

	#[test]
	fn state_root_mismatch_fails_and_rolls_back() {
		let fixture = fixture();
		let mut runtime = MockRuntime::new();
		runtime
			.expect_execute_block()
			.returning(|_, _| Ok(H256::repeat_byte(0xbe)));
		let executor = BabeBlockExecutor::new(base_of(&fixture), Arc::new(runtime));

		let header = sealed_header(&genesis_header(), 1, false, 1);
		let block = Block { header: header.clone(), body: vec![] };
		assert_matches!(run(&executor, block, None), Err(ImportError::Execution(_)));
		assert!(!fixture.tree.has_block_header(&header.hash()).unwrap());
		assert_eq!(fixture.tree.best_leaf().number, 0);
	}

	#[test]
	fn known_block_reports_block_exists() {
		let fixture = fixture();
		let mut runtime = MockRuntime::new();
		runtime
			.expect_execute_block()
			.returning(|_, block| Ok(block.header.state_root));
		let executor = BabeBlockExecutor::new(base_of(&fixture), Arc::new(runtime));

		let header = sealed_header(&genesis_header(), 1, false, 1);
		run(&executor, Block { header: header.clone(), body: vec![] }, None).unwrap();

		let error =
			run(&executor, Block { header, body: vec![] }, None).unwrap_err();
		assert!(error.is_already_in_tree());
	}

	#[test]
	fn orphan_block_is_rejected() {
		let fixture = fixture();
		let executor = BabeBlockExecutor::new(base_of(&fixture), Arc::new(MockRuntime::new()));
		let missing_parent = sealed_header(&genesis_header(), 1, false, 1);
		let header = sealed_header(&missing_parent, 2, false, 2);
		assert_matches!(
			run(&executor, Block { header, body: vec![] }, None),
			Err(ImportError::Tree(wc_blockchain::Error::ParentNotFound(_)))
		);
	}

	#[test]
	fn header_appender_tracks_header_only_blocks() {
		let fixture = fixture();
		let appender = BabeHeaderAppender::new(base_of(&fixture));

		let header = sealed_header(&genesis_header(), 1, false, 1);
		let result = Arc::new(Mutex::new(None));
		let sink = result.clone();
		appender.append_header(
			header.clone(),
			None,
			Box::new(move |outcome| *sink.lock() = Some(outcome)),
		);
		result.lock().take().unwrap().unwrap();

		assert_eq!(fixture.tree.best_leaf(), header.block_info());
		assert_eq!(fixture.tree.store().body(&header.hash()).unwrap(), None);
	}

	#[test]
	fn justification_shipped_with_block_finalizes_it() {
		let fixture = fixture();
		let mut runtime = MockRuntime::new();
		runtime
			.expect_execute_block()
			.returning(|_, block| Ok(block.header.state_root));
		let executor = BabeBlockExecutor::new(base_of(&fixture), Arc::new(runtime));

		let header = sealed_header(&genesis_header(), 1, false, 1);
		let info = header.block_info();
		let precommit = Precommit { target_hash: info.hash, target_number: info.number };
		let justification = GrandpaJustification {
			round: 1,
			target_hash: info.hash,
			target_number: info.number,
			precommits: vec![SignedPrecommit {
				precommit,
				signature: Ed25519Signature([0; 64]),
				id: Ed25519Public([1; 32]),
			}],
		};

		run(
			&executor,
			Block { header, body: vec![] },
			Some(EncodedJustification(justification.encode())),
		)
		.unwrap();
		assert_eq!(fixture.tree.get_last_finalized(), info);
	}
}
