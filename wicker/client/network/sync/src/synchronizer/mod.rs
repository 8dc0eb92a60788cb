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

//! The synchronizer: obtains missing blocks and justifications from
//! peers, feeds the import pipeline, never issues duplicate requests, and
//! keeps at most one request in flight per peer.

use crate::{
	error::SyncError,
	message::{BlockAttributes, BlocksRequest, RequestFingerprint, Direction},
	network::{StateProtocol, SyncProtocol},
	scheduler::Scheduler,
	state_sync::{StateSyncFlow, StateSyncStatus},
	JUSTIFICATION_INTERVAL, LOG_TARGET, MAX_DISTANCE_TO_BLOCK_FOR_SUBSCRIPTION,
	MAX_JUSTIFICATION_LAG, MIN_PRELOADED_BLOCK_AMOUNT,
	MIN_PRELOADED_BLOCK_AMOUNT_FOR_FAST_SYNCING, RECENTNESS_DURATION,
};
use libp2p_identity::PeerId;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::{
	collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
};
use wc_blockchain::{
	BlockExecutor, BlockHeaderAppender, BlockTree, ChainEvent, ChainEvents,
	JustificationApplier,
};
use wp_core::{
	digests::scheduled_change_digest, traits::TrieBackend, Block, BlockData, BlockHeader,
	BlockId, BlockInfo, BlockNumber, EncodedJustification, H256,
};

/// Completion callback of a sync operation; receives the last block the
/// operation got to, or the reason it stopped.
pub type SyncResultHandler = Box<dyn FnOnce(Result<BlockInfo, SyncError>) + Send>;

/// How the node synchronizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
	/// Download and execute every block.
	Full,
	/// Download headers, then a state snapshot at a recent block.
	Fast,
	/// Like [`Self::Fast`] but without the state snapshot.
	FastWithoutState,
	/// Authority-set-change proof chain plus a recent state. Shares the
	/// fast transport here; distinct proof verification is not wired up.
	Warp,
	/// Pick automatically; resolved before the synchronizer starts.
	Auto,
}

impl SyncMode {
	fn block_attributes(self) -> BlockAttributes {
		match self {
			Self::Full | Self::Auto => BlocksRequest::BASIC_ATTRIBUTES,
			Self::Fast | Self::FastWithoutState | Self::Warp =>
				BlockAttributes::HEADER | BlockAttributes::JUSTIFICATION,
		}
	}

	fn is_full(self) -> bool {
		matches!(self, Self::Full | Self::Auto)
	}
}

struct KnownBlock {
	data: BlockData,
	/// Peers known to hold this block.
	peers: HashSet<PeerId>,
}

#[derive(Default)]
struct SyncState {
	known_blocks: HashMap<H256, KnownBlock>,
	/// Queue index by height; popped lowest-first by the import loop.
	generations: BTreeSet<(BlockNumber, H256)>,
	/// parent hash → enqueued children, for cascading discard.
	ancestry: HashMap<H256, Vec<H256>>,
	busy_peers: HashSet<PeerId>,
	recent_requests: HashMap<(PeerId, RequestFingerprint), &'static str>,
	subscriptions: BTreeMap<BlockInfo, Vec<SyncResultHandler>>,
	watched_blocks: HashMap<H256, SyncResultHandler>,
	watched_blocks_number: BlockNumber,
}

struct StateSyncInFlight {
	peer: PeerId,
	handler: SyncResultHandler,
}

#[derive(Default)]
struct StateSyncState {
	flow: Option<StateSyncFlow>,
	current: Option<StateSyncInFlight>,
}

/// Resets a busy-flag on scope exit.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

pub struct Synchronizer {
	tree: Arc<BlockTree>,
	executor: Arc<dyn BlockExecutor>,
	appender: Arc<dyn BlockHeaderAppender>,
	justification_applier: Arc<dyn JustificationApplier>,
	sync_protocol: Arc<dyn SyncProtocol>,
	state_protocol: Arc<dyn StateProtocol>,
	trie: Arc<dyn TrieBackend>,
	scheduler: Arc<dyn Scheduler>,
	events: Arc<ChainEvents>,

	/// Import-queue state; touched only from the main context.
	state: Mutex<SyncState>,
	/// One state sync at a time; its own lock because worker completions
	/// touch it.
	state_sync: Mutex<StateSyncState>,
	/// Fetched justifications awaiting application.
	justifications: Mutex<VecDeque<(BlockInfo, EncodedJustification)>>,
	sync_mode: Mutex<SyncMode>,

	applying_in_progress: AtomicBool,
	asking_blocks_portion_in_progress: AtomicBool,
	shutting_down: AtomicBool,
	next_request_id: AtomicU64,
}

impl Synchronizer {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		sync_mode: SyncMode,
		tree: Arc<BlockTree>,
		executor: Arc<dyn BlockExecutor>,
		appender: Arc<dyn BlockHeaderAppender>,
		justification_applier: Arc<dyn JustificationApplier>,
		sync_protocol: Arc<dyn SyncProtocol>,
		state_protocol: Arc<dyn StateProtocol>,
		trie: Arc<dyn TrieBackend>,
		scheduler: Arc<dyn Scheduler>,
		events: Arc<ChainEvents>,
	) -> Arc<Self> {
		let synchronizer = Arc::new(Self {
			tree,
			executor,
			appender,
			justification_applier,
			sync_protocol,
			state_protocol,
			trie,
			scheduler,
			events,
			state: Mutex::new(SyncState::default()),
			state_sync: Mutex::new(StateSyncState::default()),
			justifications: Mutex::new(VecDeque::new()),
			sync_mode: Mutex::new(sync_mode),
			applying_in_progress: AtomicBool::new(false),
			asking_blocks_portion_in_progress: AtomicBool::new(false),
			shutting_down: AtomicBool::new(false),
			next_request_id: AtomicU64::new(0),
		});

		// Finalization pruning must clear matching queue entries.
		let weak = Arc::downgrade(&synchronizer);
		synchronizer.tree.register_discard_hook(Box::new(move |info| {
			if let Some(synchronizer) = weak.upgrade() {
				synchronizer.discard_block(&info.hash);
			}
		}));
		synchronizer
	}

	/// Make every pending callback chain terminate promptly.
	pub fn shutdown(&self) {
		self.shutting_down.store(true, Ordering::Release);
	}

	pub fn sync_mode(&self) -> SyncMode {
		*self.sync_mode.lock()
	}

	pub fn queued_blocks_count(&self) -> usize {
		self.state.lock().known_blocks.len()
	}

	fn is_shutting_down(&self) -> bool {
		self.shutting_down.load(Ordering::Acquire)
	}

	fn next_request_id(&self) -> u64 {
		self.next_request_id.fetch_add(1, Ordering::Relaxed)
	}

	/// Whether the block is already enqueued or in the tree.
	fn is_known_block(&self, hash: &H256) -> bool {
		self.state.lock().known_blocks.contains_key(hash) ||
			self.tree.has_block_header(hash).unwrap_or(false)
	}

	/// Register `handler` to fire once `block` is applied or discarded.
	///
	/// Fires immediately (asynchronously, on the scheduler) when the block
	/// is already in the tree, already below the finalized height, or too
	/// far ahead to be waited for.
	pub fn subscribe_to_block(&self, block: BlockInfo, handler: SyncResultHandler) -> bool {
		if self.tree.has_block_header(&block.hash).unwrap_or(false) {
			self.scheduler.schedule(Box::new(move || handler(Ok(block))));
			return false
		}

		let finalized = self.tree.get_last_finalized();
		if finalized.number >= block.number {
			self.scheduler
				.schedule(Box::new(move || handler(Err(SyncError::DiscardedBlock))));
			return false
		}

		let best = self.tree.best_leaf();
		if best.number + MAX_DISTANCE_TO_BLOCK_FOR_SUBSCRIPTION < block.number {
			self.scheduler
				.schedule(Box::new(move || handler(Err(SyncError::ArrivedTooEarly))));
			return false
		}

		self.state.lock().subscriptions.entry(block).or_default().push(handler);
		true
	}

	fn notify_subscribers(&self, block: BlockInfo, result: Result<BlockInfo, SyncError>) {
		let handlers = self.state.lock().subscriptions.remove(&block).unwrap_or_default();
		for handler in handlers {
			let result = result.clone();
			self.scheduler.schedule(Box::new(move || handler(result)));
		}
	}

	/// Catch up with a peer that reported `block` as its best: find the
	/// best common block, then load everything above it.
	///
	/// Returns whether a sync round was started.
	pub fn sync_by_block_info(
		self: &Arc<Self>,
		block: BlockInfo,
		peer: PeerId,
		handler: Option<SyncResultHandler>,
		subscribe: bool,
	) -> bool {
		let mut handler = handler;
		if subscribe {
			if let Some(handler) = handler.take() {
				self.subscribe_to_block(block, handler);
			}
		}

		// Already enqueued: just remember the peer as a source.
		{
			let mut state = self.state.lock();
			if let Some(entry) = state.known_blocks.get_mut(&block.hash) {
				entry.peers.insert(peer);
				drop(state);
				if let Some(handler) = handler {
					handler(Ok(block));
				}
				return false
			}
			// One in-flight exchange per peer.
			if !state.busy_peers.insert(peer) {
				trace!(
					target: LOG_TARGET,
					"Can't sync block {block} with {peer}: peer is busy",
				);
				return false
			}
			trace!(target: LOG_TARGET, "Peer {peer} marked as busy");
		}

		let best = self.tree.best_leaf();
		if block == best {
			self.unmark_busy(&peer);
			if let Some(handler) = handler {
				handler(Ok(block));
			}
			return false
		}

		// Probe for the best common block between the last finalized
		// (known to everyone) and the lower of the two bests.
		let finalized = self.tree.get_last_finalized();
		let lower = finalized.number;
		let upper = block.number.min(best.number) + 1;
		let hint = block.number.min(best.number);
		if upper <= lower {
			// The peer reported a block at or below our finalized height;
			// there is nothing to catch up with on that chain.
			self.unmark_busy(&peer);
			if let Some(handler) = handler {
				handler(Err(SyncError::DiscardedBlock));
			}
			return false
		}

		let weak = Arc::downgrade(self);
		let find_handler: SyncResultHandler = Box::new(move |result| {
			let Some(synchronizer) = weak.upgrade() else { return };
			synchronizer.unmark_busy(&peer);
			let common = match result {
				Ok(common) => common,
				Err(error) => {
					if let Some(handler) = handler {
						handler(Err(error));
					}
					return
				},
			};
			{
				let mut state = synchronizer.state.lock();
				if let Some(entry) = state.known_blocks.get_mut(&common.hash) {
					entry.peers.insert(peer);
					drop(state);
					if let Some(handler) = handler {
						handler(Ok(common));
					}
					return
				}
			}
			debug!(
				target: LOG_TARGET,
				"Start to load blocks from {peer} since block {common}",
			);
			synchronizer.load_blocks(peer, common, handler);
		});

		debug!(
			target: LOG_TARGET,
			"Start to find common block with {peer} in #{lower}..#{} to catch up",
			upper - 1,
		);
		self.find_common_block(peer, lower, upper, hint, find_handler, BTreeMap::new());
		true
	}

	/// React to a validated block announcement.
	pub fn sync_by_block_header(
		self: &Arc<Self>,
		header: BlockHeader,
		peer: PeerId,
		handler: SyncResultHandler,
	) -> bool {
		let hash = header.hash();
		let block = BlockInfo::new(header.number, hash);

		// Applied before.
		if self.tree.has_block_header(&hash).unwrap_or(false) {
			return false
		}

		{
			let mut state = self.state.lock();
			// Already enqueued: remember the peer.
			if let Some(entry) = state.known_blocks.get_mut(&hash) {
				entry.peers.insert(peer);
				return false
			}

			// Watch the announced tip; announcements racing to higher
			// numbers reset the watch list.
			if state.watched_blocks_number < header.number {
				state.watched_blocks_number = header.number;
				state.watched_blocks.clear();
			}
			if state.watched_blocks_number == header.number {
				state.watched_blocks.insert(hash, handler);
			}
		}

		let parent_is_known = self.state.lock().known_blocks.contains_key(&header.parent_hash) ||
			self.tree.has_block_header(&header.parent_hash).unwrap_or(false);

		if parent_is_known {
			// The parent connects it to our chain; load directly.
			let weak = Arc::downgrade(self);
			self.load_blocks(
				peer,
				block,
				Some(Box::new(move |_result| {
					if weak.upgrade().is_some() {
						trace!(target: LOG_TARGET, "Block(s) enqueued to apply by announce");
					}
				})),
			);
			return true
		}

		// Otherwise find the common block first.
		let weak = Arc::downgrade(self);
		self.sync_by_block_info(
			block,
			peer,
			Some(Box::new(move |_result| {
				if weak.upgrade().is_some() {
					trace!(target: LOG_TARGET, "Block(s) enqueued to load by announce");
				}
			})),
			false,
		)
	}

	/// Fetch missing justifications starting at `target`, rescheduling if
	/// the peer is currently serving another exchange.
	pub fn sync_missing_justifications(
		self: &Arc<Self>,
		peer: PeerId,
		target: BlockInfo,
		limit: Option<u32>,
		handler: Option<SyncResultHandler>,
	) {
		if self.is_shutting_down() {
			if let Some(handler) = handler {
				handler(Err(SyncError::ShuttingDown));
			}
			return
		}
		if self.state.lock().busy_peers.contains(&peer) {
			debug!(
				target: LOG_TARGET,
				"Justifications load since block {target} was rescheduled, peer {peer} is busy",
			);
			let weak = Arc::downgrade(self);
			self.scheduler.schedule(Box::new(move || {
				if let Some(synchronizer) = weak.upgrade() {
					synchronizer.sync_missing_justifications(peer, target, limit, handler);
				}
			}));
			return
		}
		self.load_justifications(peer, target, limit, handler);
	}

	/// Binary search for the highest block both we and the peer have.
	///
	/// Probes one header per request at `hint`; a locally known result
	/// narrows from below, an unknown one from above. Observed heights
	/// are memoized so revisits don't hit the network again.
	pub(crate) fn find_common_block(
		self: &Arc<Self>,
		peer: PeerId,
		mut lower: BlockNumber,
		mut upper: BlockNumber,
		hint: BlockNumber,
		handler: SyncResultHandler,
		mut observed: BTreeMap<BlockNumber, H256>,
	) {
		if self.is_shutting_down() {
			handler(Err(SyncError::ShuttingDown));
			return
		}

		let request = BlocksRequest {
			id: self.next_request_id(),
			fields: BlockAttributes::HEADER,
			from: BlockId::Number(hint),
			to: None,
			direction: Direction::Ascending,
			max: Some(1),
		};
		let fingerprint = request.fingerprint();
		if let Err(reason) = self.note_recent_request(peer, fingerprint, "find common block") {
			warn!(
				target: LOG_TARGET,
				"Can't check if block #{hint} in #{lower}..#{} is common with {peer}: {reason}",
				upper - 1,
			);
			handler(Err(SyncError::DuplicateRequest));
			return
		}

		trace!(
			target: LOG_TARGET,
			"Check if block #{hint} in #{lower}..#{} is common with {peer}",
			upper - 1,
		);

		let weak = Arc::downgrade(self);
		self.sync_protocol.request_blocks(
			peer,
			request,
			Box::new(move |response| {
				let Some(synchronizer) = weak.upgrade() else { return };
				let response = match response {
					Ok(response) => response,
					Err(error) => {
						warn!(
							target: LOG_TARGET,
							"Can't check if block #{hint} is common with {peer}: {error}",
						);
						handler(Err(error));
						return
					},
				};

				// The requested height lies in a range that must exist on
				// the peer's chain; an empty response is abnormal.
				let Some(first) = response.blocks.first() else {
					warn!(
						target: LOG_TARGET,
						"Can't check if block #{hint} is common with {peer}: \
						 response does not have any blocks",
					);
					synchronizer.forget_recent_request(&peer, fingerprint);
					handler(Err(SyncError::EmptyResponse));
					return
				};

				let mut target = hint;
				let mut hash = first.hash;
				observed.insert(target, hash);

				loop {
					let block_is_known = synchronizer.is_known_block(&hash);

					if target == lower {
						if block_is_known {
							let common = BlockInfo::new(target, hash);
							debug!(
								target: LOG_TARGET,
								"Found best common block with {peer}: {common}",
							);
							handler(Ok(common));
						} else {
							warn!(
								target: LOG_TARGET,
								"Not found any common block with {peer}",
							);
							handler(Err(SyncError::EmptyResponse));
						}
						return
					}

					if block_is_known {
						trace!(
							target: LOG_TARGET,
							"Block {} of {peer} is found locally",
							BlockInfo::new(target, hash),
						);
						lower = target;
					} else {
						trace!(
							target: LOG_TARGET,
							"Block {} of {peer} is not found locally",
							BlockInfo::new(target, hash),
						);
						upper = target;
					}
					let hint = lower + (upper - lower) / 2;

					// Seen this height already; keep narrowing without
					// another request.
					if let Some(observed_hash) = observed.get(&hint) {
						target = hint;
						hash = *observed_hash;
						continue
					}

					synchronizer.find_common_block(peer, lower, upper, hint, handler, observed);
					return
				}
			}),
		);
	}

	/// Request an ascending run of blocks from `from` and enqueue every
	/// response block that passes validation.
	pub(crate) fn load_blocks(
		self: &Arc<Self>,
		peer: PeerId,
		from: BlockInfo,
		handler: Option<SyncResultHandler>,
	) {
		if self.is_shutting_down() {
			if let Some(handler) = handler {
				handler(Err(SyncError::ShuttingDown));
			}
			return
		}

		let request = BlocksRequest {
			id: self.next_request_id(),
			fields: self.sync_mode().block_attributes(),
			from: BlockId::Hash(from.hash),
			to: None,
			direction: Direction::Ascending,
			max: None,
		};
		let fingerprint = request.fingerprint();
		let body_requested = request.attribute_is_set(BlockAttributes::BODY);
		if let Err(reason) = self.note_recent_request(peer, fingerprint, "load blocks") {
			error!(
				target: LOG_TARGET,
				"Can't load blocks from {peer} beginning block {from}: {reason}",
			);
			if let Some(handler) = handler {
				handler(Err(SyncError::DuplicateRequest));
			}
			return
		}

		let weak = Arc::downgrade(self);
		self.sync_protocol.request_blocks(
			peer,
			request,
			Box::new(move |response| {
				let Some(synchronizer) = weak.upgrade() else { return };
				let response = match response {
					Ok(response) => response,
					Err(error) => {
						error!(
							target: LOG_TARGET,
							"Can't load blocks from {peer} beginning block {from}: {error}",
						);
						if let Some(handler) = handler {
							handler(Err(error));
						}
						return
					},
				};
				let result =
					synchronizer.enqueue_loaded_blocks(peer, from, body_requested, response.blocks);
				match result {
					Ok((last_loaded, some_blocks_added)) => {
						trace!(target: LOG_TARGET, "Block loading is finished");
						if let Some(handler) = handler {
							handler(Ok(last_loaded));
						}
						if some_blocks_added {
							trace!(
								target: LOG_TARGET,
								"Enqueued some new blocks: schedule applying",
							);
							let weak = Arc::downgrade(&synchronizer);
							synchronizer.scheduler.schedule(Box::new(move || {
								if let Some(synchronizer) = weak.upgrade() {
									synchronizer.apply_next_block();
								}
							}));
						}
					},
					Err(error) => {
						error!(
							target: LOG_TARGET,
							"Can't load blocks from {peer} beginning block {from}: {error}",
						);
						if let Some(handler) = handler {
							handler(Err(error));
						}
					},
				}
			}),
		);
	}

	/// Validate a block response per the range-fetch rules and move the
	/// acceptable blocks into the import queue.
	fn enqueue_loaded_blocks(
		&self,
		peer: PeerId,
		from: BlockInfo,
		body_requested: bool,
		blocks: Vec<BlockData>,
	) -> Result<(BlockInfo, bool), SyncError> {
		if blocks.is_empty() {
			return Err(SyncError::EmptyResponse)
		}
		trace!(
			target: LOG_TARGET,
			"{} blocks are loaded from {peer} beginning block {from}",
			blocks.len(),
		);

		let finalized = self.tree.get_last_finalized();
		let mut parent_hash: Option<H256> = None;
		let mut last_loaded = BlockInfo::default();
		let mut some_blocks_added = false;

		let mut state = self.state.lock();
		for block in blocks {
			let Some(header) = block.header else {
				return Err(SyncError::ResponseWithoutBlockHeader)
			};
			if body_requested && block.body.is_none() {
				return Err(SyncError::ResponseWithoutBlockBody)
			}

			// Blocks at or below the finalized height are either the
			// canonical ones (skip) or a discarded side chain (fatal for
			// this exchange).
			if finalized.number >= header.number {
				if finalized.number == header.number {
					if finalized.hash != block.hash {
						return Err(SyncError::DiscardedBlock)
					}
					trace!(
						target: LOG_TARGET,
						"Skip block {}: it is the finalized one",
						BlockInfo::new(header.number, block.hash),
					);
					continue
				}
				trace!(
					target: LOG_TARGET,
					"Skip block {}: it is below the last finalized #{}",
					BlockInfo::new(header.number, block.hash),
					finalized.number,
				);
				continue
			}

			// The first block above the finalized one must attach to it.
			if finalized.number + 1 == header.number {
				if finalized.hash != header.parent_hash {
					return Err(SyncError::DiscardedBlock)
				}
				parent_hash = Some(header.parent_hash);
			}

			// Within the batch every block must extend the previous one.
			if let Some(previous) = parent_hash {
				if previous != header.parent_hash {
					return Err(SyncError::WrongOrder)
				}
			}

			// The advertised hash must be the recomputed header hash.
			let calculated = header.hash();
			if block.hash != calculated {
				return Err(SyncError::InvalidHash)
			}

			last_loaded = BlockInfo::new(header.number, block.hash);
			parent_hash = Some(block.hash);

			match state.known_blocks.get_mut(&block.hash) {
				Some(entry) => {
					entry.peers.insert(peer);
					trace!(
						target: LOG_TARGET,
						"Skip block {last_loaded}: already enqueued",
					);
					continue
				},
				None => {
					trace!(target: LOG_TARGET, "Enqueue block {last_loaded} from {peer}");
					state.generations.insert((header.number, block.hash));
					state
						.ancestry
						.entry(header.parent_hash)
						.or_default()
						.push(block.hash);
					state.known_blocks.insert(
						block.hash,
						KnownBlock {
							data: BlockData {
								hash: block.hash,
								header: Some(header),
								body: block.body,
								justification: block.justification,
							},
							peers: HashSet::from([peer]),
						},
					);
					some_blocks_added = true;
				},
			}
		}

		Ok((last_loaded, some_blocks_added))
	}

	/// Page justifications from `target` upwards until the chain tip or
	/// `limit` blocks are covered.
	fn load_justifications(
		self: &Arc<Self>,
		peer: PeerId,
		target: BlockInfo,
		limit: Option<u32>,
		handler: Option<SyncResultHandler>,
	) {
		if self.is_shutting_down() {
			if let Some(handler) = handler {
				handler(Err(SyncError::ShuttingDown));
			}
			return
		}

		self.state.lock().busy_peers.insert(peer);

		let request = BlocksRequest {
			id: self.next_request_id(),
			fields: BlockAttributes::HEADER | BlockAttributes::JUSTIFICATION,
			from: BlockId::Hash(target.hash),
			to: None,
			direction: Direction::Ascending,
			max: limit,
		};
		let fingerprint = request.fingerprint();
		if let Err(reason) = self.note_recent_request(peer, fingerprint, "load justifications") {
			error!(
				target: LOG_TARGET,
				"Can't load justifications from {peer} for block {target}: {reason}",
			);
			self.unmark_busy(&peer);
			if let Some(handler) = handler {
				handler(Err(SyncError::DuplicateRequest));
			}
			return
		}

		let weak = Arc::downgrade(self);
		self.sync_protocol.request_blocks(
			peer,
			request,
			Box::new(move |response| {
				let Some(synchronizer) = weak.upgrade() else { return };
				synchronizer.unmark_busy(&peer);
				let response = match response {
					Ok(response) => response,
					Err(error) => {
						error!(
							target: LOG_TARGET,
							"Can't load justifications from {peer} for block {target}: {error}",
						);
						if let Some(handler) = handler {
							handler(Err(error));
						}
						return
					},
				};
				if response.blocks.is_empty() {
					error!(
						target: LOG_TARGET,
						"Can't load justifications from {peer} for block {target}: \
						 response does not have any contents",
					);
					if let Some(handler) = handler {
						handler(Err(SyncError::EmptyResponse));
					}
					return
				}

				// Decreasing limit avoids racing this pagination against
				// block requests for the same range.
				let mut limit = limit;
				if let Some(remaining) = &mut limit {
					if response.blocks.len() as u32 >= *remaining {
						*remaining = 0;
					} else {
						*remaining -= response.blocks.len() as u32 - 1;
					}
				}

				let mut justification_received = false;
				let mut last_justified = BlockInfo::default();
				let mut last_observed = BlockInfo::default();
				for block in &response.blocks {
					let Some(header) = &block.header else {
						error!(
							target: LOG_TARGET,
							"No header was provided from {peer} for block {target} \
							 while requesting justifications",
						);
						if let Some(handler) = handler {
							handler(Err(SyncError::ResponseWithoutBlockHeader));
						}
						return
					};
					last_observed = BlockInfo::new(header.number, block.hash);
					if let Some(justification) = &block.justification {
						justification_received = true;
						last_justified = last_observed;
						synchronizer
							.justifications
							.lock()
							.push_back((last_justified, justification.clone()));
					}
				}

				if justification_received {
					trace!(
						target: LOG_TARGET,
						"Enqueued new justifications: schedule applying",
					);
					let weak = Arc::downgrade(&synchronizer);
					synchronizer.scheduler.schedule(Box::new(move || {
						if let Some(synchronizer) = weak.upgrade() {
							synchronizer.apply_next_justification();
						}
					}));
				}

				// Continue paging until the limit runs out or the peer has
				// nothing beyond the last observed block.
				if limit.map_or(true, |remaining| remaining > 0) && last_observed != target {
					trace!(target: LOG_TARGET, "Request next justification page");
					let weak = Arc::downgrade(&synchronizer);
					synchronizer.scheduler.schedule(Box::new(move || {
						if let Some(synchronizer) = weak.upgrade() {
							synchronizer.load_justifications(
								peer,
								last_observed,
								limit,
								handler,
							);
						}
					}));
					return
				}

				if let Some(handler) = handler {
					handler(Ok(last_justified));
				}
			}),
		);
	}

	/// The single-writer import step: pop the lowest enqueued block and
	/// route it into the executor (Full) or the header appender (Fast).
	/// Guarded by a CAS flag; concurrent callers return immediately.
	pub fn apply_next_block(self: &Arc<Self>) {
		if self.state.lock().generations.is_empty() {
			trace!(target: LOG_TARGET, "No block for applying");
			return
		}
		if self
			.applying_in_progress
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			trace!(target: LOG_TARGET, "Applying in progress");
			return
		}
		trace!(target: LOG_TARGET, "Begin applying");
		let _guard = FlagGuard(&self.applying_in_progress);

		let (hash, data, handler) = {
			let mut state = self.state.lock();
			let entry = loop {
				let Some(&(number, hash)) = state.generations.iter().next() else {
					trace!(target: LOG_TARGET, "No block for applying");
					return
				};
				state.generations.remove(&(number, hash));
				if state.known_blocks.contains_key(&hash) {
					break hash
				}
			};
			let data = state.known_blocks.get(&entry).map(|known| known.data.clone());
			let Some(data) = data else { return };
			let number = data.header.as_ref().map(|header| header.number).unwrap_or(0);
			let handler = if state.watched_blocks_number == number {
				state.watched_blocks.remove(&entry)
			} else {
				None
			};
			(entry, data, handler)
		};

		let Some(header) = data.header.clone() else {
			self.discard_block(&hash);
			return
		};
		let block_info = BlockInfo::new(header.number, hash);
		let finalized = self.tree.get_last_finalized();

		// Skip applied-and-finalized blocks, discard side chains below
		// the finalized height.
		if header.number <= finalized.number {
			if self.tree.has_block_header(&hash).unwrap_or(false) {
				self.state.lock().known_blocks.remove(&hash);
			} else {
				let n = self.discard_block(&hash);
				warn!(
					target: LOG_TARGET,
					"Block {block_info} and {n} others have not been applied as discarded",
				);
				if let Some(handler) = handler {
					handler(Err(SyncError::DiscardedBlock));
				}
			}
			self.post_apply_block(&hash);
			return
		}

		let weak = Arc::downgrade(self);
		let callback = Box::new(move |result: Result<(), wc_blockchain::ImportError>| {
			if let Some(synchronizer) = weak.upgrade() {
				synchronizer.process_block_addition_result(result, hash, handler);
				synchronizer.post_apply_block(&hash);
			}
		});

		if self.sync_mode().is_full() {
			// Regular syncing.
			let body = data.body.clone().unwrap_or_default();
			self.executor.apply_block(
				Block { header, body },
				data.justification.clone(),
				callback,
			);
		} else {
			// Headers-first syncing; while a state snapshot is being
			// fetched all incoming blocks are discarded.
			if self.state_sync.lock().current.is_some() {
				let n = self.discard_block(&hash);
				warn!(
					target: LOG_TARGET,
					"Block {block_info} and {n} others have not been applied as discarded: \
					 state syncing is in progress",
				);
				self.post_apply_block(&hash);
				return
			}
			self.appender.append_header(header, data.justification.clone(), callback);
		}
	}

	fn process_block_addition_result(
		self: &Arc<Self>,
		result: Result<(), wc_blockchain::ImportError>,
		hash: H256,
		handler: Option<SyncResultHandler>,
	) {
		let Some(known) = self.state.lock().known_blocks.remove(&hash) else { return };
		let Some(header) = known.data.header else { return };
		let block_info = BlockInfo::new(header.number, hash);

		match result {
			Err(error) if error.is_already_in_tree() => {
				debug!(target: LOG_TARGET, "Block {block_info} is skipped as existing");
				self.notify_subscribers(block_info, Ok(block_info));
				if let Some(handler) = handler {
					handler(Ok(block_info));
				}
			},
			Err(error) => {
				self.notify_subscribers(block_info, Err(SyncError::DiscardedBlock));
				let n = self.discard_block(&hash);
				warn!(
					target: LOG_TARGET,
					"Block {block_info} and {n} others have been discarded: {error}",
				);
				if let Some(handler) = handler {
					handler(Err(SyncError::DiscardedBlock));
				}
			},
			Ok(()) => {
				self.notify_subscribers(block_info, Ok(block_info));
				if let Some(handler) = handler {
					handler(Ok(block_info));
				}

				// Post-apply hook: a declared authority-set change or a
				// finality lag crossing the interval triggers a
				// justification catch-up from every serving peer.
				let finalized = self.tree.get_last_finalized();
				let declares_change = scheduled_change_digest(&header).is_some();
				let lag_triggered = block_info.number.saturating_sub(MAX_JUSTIFICATION_LAG) /
					JUSTIFICATION_INTERVAL >
					finalized.number / JUSTIFICATION_INTERVAL;
				if declares_change || lag_triggered {
					for peer in known.peers {
						let weak = Arc::downgrade(self);
						self.sync_missing_justifications(
							peer,
							finalized,
							Some((JUSTIFICATION_INTERVAL * 2) as u32),
							Some(Box::new(move |result| {
								let Some(_synchronizer) = weak.upgrade() else { return };
								match result {
									Ok(last) => debug!(
										target: LOG_TARGET,
										"Loaded justifications for blocks in range \
										 {finalized} - {last}",
									),
									Err(error) => warn!(
										target: LOG_TARGET,
										"Missing justifications since {finalized} \
										 were not loaded: {error}",
									),
								}
							})),
						);
					}
				}
			},
		}
	}

	fn post_apply_block(self: &Arc<Self>, hash: &H256) {
		let queue_len = {
			let mut state = self.state.lock();
			state.ancestry.remove(hash);
			state.known_blocks.len()
		};

		// Catch up queue pruning with any finality progress.
		self.prune_queue(self.tree.get_last_finalized());

		let threshold = if self.sync_mode().is_full() {
			MIN_PRELOADED_BLOCK_AMOUNT
		} else {
			MIN_PRELOADED_BLOCK_AMOUNT_FOR_FAST_SYNCING
		};
		if queue_len < threshold {
			trace!(
				target: LOG_TARGET,
				"{queue_len} blocks in queue: ask next portion of blocks",
			);
			self.ask_next_portion_of_blocks();
		} else {
			trace!(target: LOG_TARGET, "{queue_len} blocks in queue");
		}

		let weak = Arc::downgrade(self);
		self.scheduler.schedule(Box::new(move || {
			if let Some(synchronizer) = weak.upgrade() {
				synchronizer.apply_next_block();
			}
		}));
	}

	/// Apply every fetched justification in arrival order; serialized by
	/// the same CAS flag as block application.
	pub fn apply_next_justification(self: &Arc<Self>) {
		if self
			.applying_in_progress
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			trace!(target: LOG_TARGET, "Applying justification in progress");
			return
		}
		trace!(target: LOG_TARGET, "Begin justification applying");
		let _guard = FlagGuard(&self.applying_in_progress);

		let mut queue = {
			let mut justifications = self.justifications.lock();
			std::mem::take(&mut *justifications)
		};

		while let Some((block, justification)) = queue.pop_front() {
			self.justification_applier.apply_justification(
				block,
				justification,
				Box::new(move |result| match result {
					Ok(()) => {
						trace!(target: LOG_TARGET, "Applied justification for block {block}")
					},
					Err(error) => warn!(
						target: LOG_TARGET,
						"Justification for block {block} was not applied: {error}",
					),
				}),
			);
		}
	}

	/// Cascade-discard a queued block and every enqueued descendant.
	/// Returns the number of discarded blocks.
	pub(crate) fn discard_block(&self, hash: &H256) -> usize {
		let mut discarded = Vec::new();
		{
			let mut state = self.state.lock();
			let mut queue = VecDeque::from([*hash]);
			while let Some(hash) = queue.pop_front() {
				if let Some(known) = state.known_blocks.remove(&hash) {
					if let Some(header) = &known.data.header {
						let info = BlockInfo::new(header.number, hash);
						state.generations.remove(&(header.number, hash));
						discarded.push(info);
					}
				}
				if let Some(children) = state.ancestry.remove(&hash) {
					queue.extend(children);
				}
			}
		}
		for info in &discarded {
			self.notify_subscribers(*info, Err(SyncError::DiscardedBlock));
		}
		discarded.len()
	}

	/// Drop queued blocks made obsolete by a finalization: everything
	/// below the finalized height, and the finalized height's siblings
	/// with their descendants.
	fn prune_queue(&self, finalized: BlockInfo) {
		let (below, siblings) = {
			let state = self.state.lock();
			let below: Vec<(BlockNumber, H256)> = state
				.generations
				.iter()
				.take_while(|(number, _)| *number < finalized.number)
				.copied()
				.collect();
			let siblings: Vec<H256> = state
				.generations
				.iter()
				.skip_while(|(number, _)| *number < finalized.number)
				.take_while(|(number, _)| *number == finalized.number)
				.filter(|(_, hash)| *hash != finalized.hash)
				.map(|(_, hash)| *hash)
				.collect();
			(below, siblings)
		};

		{
			let mut state = self.state.lock();
			for (number, hash) in &below {
				state.generations.remove(&(*number, *hash));
				state.known_blocks.remove(hash);
				state.ancestry.remove(hash);
			}
		}
		for (number, hash) in below {
			self.notify_subscribers(BlockInfo::new(number, hash), Err(SyncError::DiscardedBlock));
		}
		for hash in siblings {
			self.discard_block(&hash);
		}
	}

	fn note_recent_request(
		self: &Arc<Self>,
		peer: PeerId,
		fingerprint: RequestFingerprint,
		reason: &'static str,
	) -> Result<(), &'static str> {
		{
			let mut state = self.state.lock();
			match state.recent_requests.entry((peer, fingerprint)) {
				std::collections::hash_map::Entry::Occupied(entry) => return Err(*entry.get()),
				std::collections::hash_map::Entry::Vacant(entry) => {
					entry.insert(reason);
				},
			}
		}
		self.schedule_recent_request_removal(peer, fingerprint);
		Ok(())
	}

	fn forget_recent_request(&self, peer: &PeerId, fingerprint: RequestFingerprint) {
		self.state.lock().recent_requests.remove(&(*peer, fingerprint));
	}

	fn schedule_recent_request_removal(
		self: &Arc<Self>,
		peer: PeerId,
		fingerprint: RequestFingerprint,
	) {
		let weak = Arc::downgrade(self);
		self.scheduler.schedule_after(
			RECENTNESS_DURATION,
			Box::new(move || {
				if let Some(synchronizer) = weak.upgrade() {
					synchronizer.forget_recent_request(&peer, fingerprint);
				}
			}),
		);
	}

	fn unmark_busy(&self, peer: &PeerId) {
		if self.state.lock().busy_peers.remove(peer) {
			trace!(target: LOG_TARGET, "Peer {peer} unmarked as busy");
		}
	}

	/// Pick a peer that served an enqueued block and ask it for the next
	/// run of blocks; at most one such round at a time.
	pub fn ask_next_portion_of_blocks(self: &Arc<Self>) {
		if self
			.asking_blocks_portion_in_progress
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			trace!(target: LOG_TARGET, "Asking portion of blocks in progress");
			return
		}
		trace!(target: LOG_TARGET, "Begin asking portion of blocks");

		// Walk the queue from the newest block down, looking for an entry
		// with an idle serving peer.
		let pick = {
			let mut state = self.state.lock();
			let mut pick = None;
			let generations: Vec<(BlockNumber, H256)> =
				state.generations.iter().rev().copied().collect();
			let bounds = state.generations.iter().next().copied().zip(
				state.generations.iter().next_back().copied(),
			);
			'outer: for (number, hash) in generations {
				let Some(known) = state.known_blocks.get(&hash) else { continue };
				if known.peers.is_empty() {
					continue
				}
				let peers: Vec<PeerId> = known.peers.iter().copied().collect();
				for peer in peers {
					if state.busy_peers.contains(&peer) {
						continue
					}
					if let Some(known) = state.known_blocks.get_mut(&hash) {
						known.peers.remove(&peer);
					}
					state.busy_peers.insert(peer);
					trace!(target: LOG_TARGET, "Peer {peer} marked as busy");
					pick = Some((peer, BlockInfo::new(number, hash), bounds));
					break 'outer
				}
			}
			pick
		};

		let Some((peer, block, bounds)) = pick else {
			trace!(target: LOG_TARGET, "End asking portion of blocks: none");
			self.asking_blocks_portion_in_progress.store(false, Ordering::Release);
			return
		};

		let weak = Arc::downgrade(self);
		let handler: SyncResultHandler = Box::new(move |result| {
			let Some(synchronizer) = weak.upgrade() else { return };
			synchronizer.unmark_busy(&peer);
			trace!(target: LOG_TARGET, "End asking portion of blocks");
			synchronizer
				.asking_blocks_portion_in_progress
				.store(false, Ordering::Release);
			match result {
				Err(error) => debug!(
					target: LOG_TARGET,
					"Loading next portion of blocks from {peer} failed: {error}",
				),
				Ok(last) => {
					debug!(
						target: LOG_TARGET,
						"Portion of blocks from {peer} is loaded till {last}",
					);
					if synchronizer.state.lock().known_blocks.is_empty() {
						synchronizer.ask_next_portion_of_blocks();
					}
				},
			}
		});

		if self.sync_mode().is_full() {
			let Some(((lower, _), (upper_number, _))) = bounds else {
				self.unmark_busy(&peer);
				self.asking_blocks_portion_in_progress.store(false, Ordering::Release);
				return
			};
			debug!(
				target: LOG_TARGET,
				"Start to find common block with {peer} in #{lower}..#{upper_number} \
				 to fill queue",
			);
			let weak = Arc::downgrade(self);
			self.find_common_block(
				peer,
				lower,
				upper_number + 1,
				upper_number,
				Box::new(move |result| {
					let Some(synchronizer) = weak.upgrade() else { return };
					match result {
						Err(error) => {
							debug!(
								target: LOG_TARGET,
								"Can't load next portion of blocks from {peer}: {error}",
							);
							handler(Err(error));
						},
						Ok(common) => {
							debug!(
								target: LOG_TARGET,
								"Start to load next portion of blocks from {peer} \
								 since block {common}",
							);
							synchronizer.load_blocks(peer, common, Some(handler));
						},
					}
				}),
				BTreeMap::new(),
			);
		} else {
			debug!(
				target: LOG_TARGET,
				"Start to load next portion of blocks from {peer} since block {block}",
			);
			self.load_blocks(peer, block, Some(handler));
		}
	}

	/// Download the state snapshot of `block` from `peer`. At most one
	/// state sync runs at a time; a second call while one is active is
	/// silently ignored.
	pub fn sync_state(
		self: &Arc<Self>,
		peer: PeerId,
		block: BlockInfo,
		handler: SyncResultHandler,
	) {
		{
			let mut state_sync = self.state_sync.lock();
			if state_sync.current.is_some() {
				trace!(
					target: LOG_TARGET,
					"State sync request was not sent to {peer} for block {block}: \
					 previous request in progress",
				);
				return
			}
			let header = match self.tree.get_block_header(&block.hash) {
				Ok(Some(header)) => header,
				Ok(None) => {
					drop(state_sync);
					handler(Err(SyncError::from(wc_blockchain::Error::MissingHeader(
						block.hash,
					))));
					return
				},
				Err(error) => {
					drop(state_sync);
					handler(Err(error.into()));
					return
				},
			};
			if self.trie.has_state_at(&header.state_root) {
				drop(state_sync);
				handler(Ok(block));
				return
			}
			if state_sync
				.flow
				.as_ref()
				.map_or(true, |flow| flow.block_info() != block)
			{
				state_sync.flow = Some(StateSyncFlow::new(block, header, true));
			}
			state_sync.current = Some(StateSyncInFlight { peer, handler });
		}
		info!(target: LOG_TARGET, "Sync of state for block {block} has started");
		self.continue_state_sync();
	}

	fn continue_state_sync(self: &Arc<Self>) {
		let (peer, request) = {
			let state_sync = self.state_sync.lock();
			let (Some(flow), Some(current)) = (&state_sync.flow, &state_sync.current) else {
				return
			};
			trace!(
				target: LOG_TARGET,
				"State sync request has been sent to {} for block {}",
				current.peer,
				flow.block_info(),
			);
			(current.peer, flow.next_request())
		};

		let weak = Arc::downgrade(self);
		self.state_protocol.request_state(
			peer,
			request,
			Box::new(move |response| {
				if let Some(synchronizer) = weak.upgrade() {
					synchronizer.on_state_response(response);
				}
			}),
		);
	}

	fn on_state_response(self: &Arc<Self>, response: Result<crate::StateResponse, SyncError>) {
		let mut state_sync = self.state_sync.lock();
		let Some(flow) = state_sync.flow.as_mut() else { return };
		let block = flow.block_info();

		let fail = |mut state_sync: parking_lot::MutexGuard<'_, StateSyncState>,
		            error: SyncError| {
			let Some(current) = state_sync.current.take() else { return };
			drop(state_sync);
			warn!(target: LOG_TARGET, "State syncing failed with error: {error}");
			(current.handler)(Err(error));
		};

		let response = match response {
			Ok(response) => response,
			Err(error) => {
				fail(state_sync, error);
				return
			},
		};

		match flow.on_response(&response) {
			StateSyncStatus::BadResponse => fail(state_sync, SyncError::EmptyResponse),
			StateSyncStatus::Continue => {
				drop(state_sync);
				trace!(target: LOG_TARGET, "State syncing continues");
				self.continue_state_sync();
			},
			StateSyncStatus::Complete => {
				let flow = state_sync.flow.take().expect("checked above; qed");
				match flow.commit(&*self.trie) {
					Ok(_root) => {
						let Some(current) = state_sync.current.take() else { return };
						drop(state_sync);
						info!(
							target: LOG_TARGET,
							"State syncing block {block} has finished",
						);
						self.events.notify(ChainEvent::NewRuntime(block.hash));
						// Snapshot in place: continue as a full node.
						*self.sync_mode.lock() = SyncMode::Full;
						(current.handler)(Ok(block));
					},
					Err(error) => fail(state_sync, error),
				}
			},
		}
	}

}

#[cfg(test)]
mod tests;
