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

//! Tests of the [`Synchronizer`].

use super::*;
use crate::{
	message::{KeyValueStateEntry, StateEntry, StateRequest, StateResponse},
	network::{BlocksResponseHandler, StateResponseHandler},
	scheduler::Task,
	state_sync::tests::StubTrie,
	BlocksResponse,
};
use assert_matches::assert_matches;
use std::time::Duration;
use wc_blockchain::{block_store::columns, BlockStore, ImportError};
use wp_core::{Digest, OpaqueExtrinsic};

/// Deterministic stand-in for the main context: tasks queue up and run
/// when the test pumps them; delayed tasks fire on [`advance`].
struct TestScheduler {
	queue: Mutex<VecDeque<Task>>,
	delayed: Mutex<Vec<(Duration, Task)>>,
	now: Mutex<Duration>,
}

impl TestScheduler {
	fn new() -> Self {
		Self {
			queue: Mutex::new(VecDeque::new()),
			delayed: Mutex::new(Vec::new()),
			now: Mutex::new(Duration::ZERO),
		}
	}

	fn run_until_idle(&self) {
		loop {
			let task = self.queue.lock().pop_front();
			match task {
				Some(task) => task(),
				None => break,
			}
		}
	}

	fn advance(&self, delta: Duration) {
		let now = {
			let mut now = self.now.lock();
			*now += delta;
			*now
		};
		let due: Vec<Task> = {
			let mut delayed = self.delayed.lock();
			let mut due = Vec::new();
			let mut index = 0;
			while index < delayed.len() {
				if delayed[index].0 <= now {
					due.push(delayed.swap_remove(index).1);
				} else {
					index += 1;
				}
			}
			due
		};
		self.queue.lock().extend(due);
		self.run_until_idle();
	}
}

impl Scheduler for TestScheduler {
	fn schedule(&self, task: Task) {
		self.queue.lock().push_back(task);
	}

	fn schedule_after(&self, delay: Duration, task: Task) {
		let at = *self.now.lock() + delay;
		self.delayed.lock().push((at, task));
	}
}

/// Captures outgoing requests; tests answer them by hand.
#[derive(Default)]
struct MockNetwork {
	blocks: Mutex<VecDeque<(PeerId, BlocksRequest, BlocksResponseHandler)>>,
	states: Mutex<VecDeque<(PeerId, StateRequest, StateResponseHandler)>>,
}

impl MockNetwork {
	fn next_blocks_request(&self) -> Option<(PeerId, BlocksRequest, BlocksResponseHandler)> {
		self.blocks.lock().pop_front()
	}

	fn next_state_request(&self) -> Option<(PeerId, StateRequest, StateResponseHandler)> {
		self.states.lock().pop_front()
	}

	fn pending_blocks_requests(&self) -> usize {
		self.blocks.lock().len()
	}
}

impl SyncProtocol for MockNetwork {
	fn request_blocks(
		&self,
		peer: PeerId,
		request: BlocksRequest,
		handler: BlocksResponseHandler,
	) {
		self.blocks.lock().push_back((peer, request, handler));
	}
}

impl StateProtocol for MockNetwork {
	fn request_state(&self, peer: PeerId, request: StateRequest, handler: StateResponseHandler) {
		self.states.lock().push_back((peer, request, handler));
	}
}

/// Executor applying blocks straight into the tree; consensus checks are
/// exercised in the consensus crates.
struct TreeExecutor(Arc<BlockTree>);

impl BlockExecutor for TreeExecutor {
	fn apply_block(
		&self,
		block: Block,
		_justification: Option<EncodedJustification>,
		callback: wc_blockchain::ImportResultCallback,
	) {
		callback(self.0.add_block(block).map_err(ImportError::Tree));
	}
}

struct TreeAppender(Arc<BlockTree>);

impl BlockHeaderAppender for TreeAppender {
	fn append_header(
		&self,
		header: BlockHeader,
		_justification: Option<EncodedJustification>,
		callback: wc_blockchain::ImportResultCallback,
	) {
		callback(self.0.add_header(header).map_err(ImportError::Tree));
	}
}

/// Finalizes without verifying the justification.
struct TreeFinalizer(Arc<BlockTree>);

impl JustificationApplier for TreeFinalizer {
	fn apply_justification(
		&self,
		block: BlockInfo,
		justification: EncodedJustification,
		callback: wc_blockchain::ImportResultCallback,
	) {
		callback(self.0.finalize(&block.hash, justification).map_err(ImportError::Tree));
	}
}

/// Accepts every block without touching the tree.
struct NoopExecutor;

impl BlockExecutor for NoopExecutor {
	fn apply_block(
		&self,
		_block: Block,
		_justification: Option<EncodedJustification>,
		callback: wc_blockchain::ImportResultCallback,
	) {
		callback(Ok(()));
	}
}

struct FailingExecutor;

impl BlockExecutor for FailingExecutor {
	fn apply_block(
		&self,
		_block: Block,
		_justification: Option<EncodedJustification>,
		callback: wc_blockchain::ImportResultCallback,
	) {
		callback(Err(ImportError::Execution("boom".into())));
	}
}

struct Fixture {
	synchronizer: Arc<Synchronizer>,
	tree: Arc<BlockTree>,
	network: Arc<MockNetwork>,
	scheduler: Arc<TestScheduler>,
	events: Arc<ChainEvents>,
}

fn genesis_header() -> BlockHeader {
	BlockHeader {
		parent_hash: H256::zero(),
		number: 0,
		state_root: H256::zero(),
		extrinsics_root: H256::zero(),
		digest: Digest::default(),
	}
}

fn child_header(parent: &BlockHeader, salt: u8) -> BlockHeader {
	BlockHeader {
		parent_hash: parent.hash(),
		number: parent.number + 1,
		state_root: H256::repeat_byte(salt),
		extrinsics_root: H256::zero(),
		digest: Digest::default(),
	}
}

fn block_data(header: &BlockHeader) -> BlockData {
	BlockData {
		hash: header.hash(),
		header: Some(header.clone()),
		body: Some(vec![OpaqueExtrinsic(vec![header.number as u8])]),
		justification: None,
	}
}

fn fixture_with(
	mode: SyncMode,
	make_executor: impl FnOnce(&Arc<BlockTree>) -> Arc<dyn BlockExecutor>,
) -> Fixture {
	let store = Arc::new(BlockStore::new(Arc::new(kvdb_memorydb::create(columns::NUM_COLUMNS))));
	let events = Arc::new(ChainEvents::new());
	let tree = Arc::new(
		BlockTree::from_genesis(store, events.clone(), genesis_header()).unwrap(),
	);
	let network = Arc::new(MockNetwork::default());
	let scheduler = Arc::new(TestScheduler::new());
	let executor = make_executor(&tree);
	let synchronizer = Synchronizer::new(
		mode,
		tree.clone(),
		executor,
		Arc::new(TreeAppender(tree.clone())),
		Arc::new(TreeFinalizer(tree.clone())),
		network.clone(),
		network.clone(),
		Arc::new(StubTrie::new()),
		scheduler.clone(),
		events.clone(),
	);
	Fixture { synchronizer, tree, network, scheduler, events }
}

fn fixture(mode: SyncMode) -> Fixture {
	fixture_with(mode, |tree| Arc::new(TreeExecutor(tree.clone())))
}

type Captured = Arc<Mutex<Option<Result<BlockInfo, SyncError>>>>;

fn capture() -> (SyncResultHandler, Captured) {
	let slot: Captured = Arc::new(Mutex::new(None));
	let sink = slot.clone();
	(Box::new(move |result| *sink.lock() = Some(result)), slot)
}

fn peer() -> PeerId {
	PeerId::random()
}

fn respond(handler: BlocksResponseHandler, blocks: Vec<BlockData>) {
	handler(Ok(BlocksResponse { blocks }));
}

#[test]
fn finds_common_ancestor_by_binary_search() {
	let fixture = fixture(SyncMode::Full);
	let genesis = genesis_header();
	let a1 = child_header(&genesis, 0xa1);
	let a2 = child_header(&a1, 0xa2);
	for header in [&a1, &a2] {
		fixture
			.tree
			.add_block(Block { header: header.clone(), body: vec![] })
			.unwrap();
	}

	// The peer extends our chain with C3..C5.
	let c3 = child_header(&a2, 0xc3);
	let c4 = child_header(&c3, 0xc4);
	let c5 = child_header(&c4, 0xc5);
	let peer_chain = [&genesis, &a1, &a2, &c3, &c4, &c5];

	let (handler, result) = capture();
	// Bounds as the catch-up path would pick them: the peer's best is
	// (5, C5), ours is (2, A2).
	fixture.synchronizer.find_common_block(
		peer(),
		0,
		3,
		2,
		handler,
		BTreeMap::new(),
	);

	let mut probes = 0;
	while let Some((_peer, request, respond_to)) = fixture.network.next_blocks_request() {
		probes += 1;
		let BlockId::Number(number) = request.from else { panic!("probe by number") };
		assert_eq!(request.max, Some(1));
		respond(
			respond_to,
			vec![BlockData::bare(peer_chain[number as usize].hash())],
		);
	}

	assert!(probes <= 3, "binary search over 3 candidates needs at most 3 probes");
	assert_eq!(result.lock().take().unwrap().unwrap(), a2.block_info());
}

#[test]
fn ancestor_search_reports_peer_on_impossible_chain() {
	let fixture = fixture(SyncMode::Full);
	// The peer knows a completely different history: every probed header
	// hash is unknown to us.
	let (handler, result) = capture();
	fixture.synchronizer.find_common_block(
		peer(),
		0,
		3,
		2,
		handler,
		BTreeMap::new(),
	);
	let mut salt = 0xe0;
	while let Some((_peer, _request, respond_to)) = fixture.network.next_blocks_request() {
		respond(respond_to, vec![BlockData::bare(H256::repeat_byte(salt))]);
		salt += 1;
	}
	assert_eq!(result.lock().take().unwrap(), Err(SyncError::EmptyResponse));
}

#[test]
fn duplicate_requests_are_suppressed_until_the_window_expires() {
	let fixture = fixture(SyncMode::Full);
	let from = fixture.tree.best_leaf();
	let peer = peer();

	let (first, first_result) = capture();
	fixture.synchronizer.load_blocks(peer, from, Some(first));
	assert_eq!(fixture.network.pending_blocks_requests(), 1);
	assert!(first_result.lock().is_none());

	// The identical request within the window is rejected outright.
	let (second, second_result) = capture();
	fixture.synchronizer.load_blocks(peer, from, Some(second));
	assert_eq!(fixture.network.pending_blocks_requests(), 1);
	assert_eq!(
		second_result.lock().take().unwrap(),
		Err(SyncError::DuplicateRequest)
	);

	// Once the recentness window passes, a fresh call goes out again.
	fixture.scheduler.advance(RECENTNESS_DURATION);
	let (third, third_result) = capture();
	fixture.synchronizer.load_blocks(peer, from, Some(third));
	assert_eq!(fixture.network.pending_blocks_requests(), 2);
	assert!(third_result.lock().is_none());
}

#[test]
fn response_validation_rejects_malformed_batches() {
	let genesis = genesis_header();
	let h1 = child_header(&genesis, 1);
	let h2 = child_header(&h1, 2);

	// Blocks accepted before the offending one stay enqueued; the
	// exchange itself fails.
	let expect_error = |blocks: Vec<BlockData>, expected: SyncError, queued_before_error| {
		let fixture = fixture(SyncMode::Full);
		let (handler, result) = capture();
		fixture
			.synchronizer
			.load_blocks(peer(), fixture.tree.best_leaf(), Some(handler));
		let (_peer, _request, respond_to) =
			fixture.network.next_blocks_request().expect("request was issued");
		respond(respond_to, blocks);
		assert_eq!(result.lock().take().unwrap(), Err(expected));
		assert_eq!(fixture.synchronizer.queued_blocks_count(), queued_before_error);
	};

	// Entirely empty response.
	expect_error(vec![], SyncError::EmptyResponse, 0);

	// Header missing.
	expect_error(vec![BlockData::bare(h1.hash())], SyncError::ResponseWithoutBlockHeader, 0);

	// Body missing although full sync requested bodies.
	let mut no_body = block_data(&h1);
	no_body.body = None;
	expect_error(vec![no_body], SyncError::ResponseWithoutBlockBody, 0);

	// The first block above the finalized height does not attach to the
	// finalized block.
	let fake_parent = BlockHeader { state_root: H256::repeat_byte(9), ..genesis.clone() };
	let detached = child_header(&fake_parent, 1);
	expect_error(vec![block_data(&detached)], SyncError::DiscardedBlock, 0);

	// Batch where a later block is not a child of its predecessor.
	expect_error(
		vec![block_data(&h1), block_data(&h2), block_data(&h2)],
		SyncError::WrongOrder,
		2,
	);

	// A block advertised under a wrong hash.
	let mut lying = block_data(&h1);
	lying.hash = H256::repeat_byte(0xad);
	expect_error(vec![lying], SyncError::InvalidHash, 0);

	// A sibling of the finalized block at its exact height.
	let fake_genesis = BlockHeader { state_root: H256::repeat_byte(0xfe), ..genesis.clone() };
	expect_error(vec![block_data(&fake_genesis)], SyncError::DiscardedBlock, 0);
}

#[test]
fn loaded_blocks_are_enqueued_and_applied_in_order() {
	let fixture = fixture(SyncMode::Full);
	let genesis = genesis_header();
	let h1 = child_header(&genesis, 1);
	let h2 = child_header(&h1, 2);

	let (handler, result) = capture();
	fixture
		.synchronizer
		.load_blocks(peer(), fixture.tree.best_leaf(), Some(handler));
	let (_peer, request, respond_to) = fixture.network.next_blocks_request().unwrap();
	assert!(request.attribute_is_set(BlockAttributes::BODY));
	respond(respond_to, vec![block_data(&h1), block_data(&h2)]);

	assert_eq!(result.lock().take().unwrap().unwrap(), h2.block_info());
	assert_eq!(fixture.synchronizer.queued_blocks_count(), 2);

	// The import loop drains the queue lowest-first.
	fixture.scheduler.run_until_idle();
	assert_eq!(fixture.tree.best_leaf(), h2.block_info());
	assert_eq!(fixture.synchronizer.queued_blocks_count(), 0);
}

#[test]
fn import_is_serialized_by_the_applying_flag() {
	let fixture = fixture(SyncMode::Full);
	let h1 = child_header(&genesis_header(), 1);

	let (handler, _result) = capture();
	fixture
		.synchronizer
		.load_blocks(peer(), fixture.tree.best_leaf(), Some(handler));
	let (_peer, _request, respond_to) = fixture.network.next_blocks_request().unwrap();
	respond(respond_to, vec![block_data(&h1)]);

	// Someone else is mid-apply: the call must return without touching
	// the queue.
	fixture.synchronizer.applying_in_progress.store(true, Ordering::Release);
	fixture.synchronizer.apply_next_block();
	assert_eq!(fixture.synchronizer.queued_blocks_count(), 1);

	fixture.synchronizer.applying_in_progress.store(false, Ordering::Release);
	fixture.synchronizer.apply_next_block();
	assert_eq!(fixture.tree.best_leaf(), h1.block_info());
}

#[test]
fn failed_import_discards_enqueued_descendants() {
	let fixture = fixture_with(SyncMode::Full, |_tree| Arc::new(FailingExecutor));
	let h1 = child_header(&genesis_header(), 1);
	let h2 = child_header(&h1, 2);

	fixture
		.synchronizer
		.load_blocks(peer(), fixture.tree.best_leaf(), None);
	let (_peer, _request, respond_to) = fixture.network.next_blocks_request().unwrap();
	respond(respond_to, vec![block_data(&h1), block_data(&h2)]);
	assert_eq!(fixture.synchronizer.queued_blocks_count(), 2);

	let (subscription, subscription_result) = capture();
	assert!(fixture.synchronizer.subscribe_to_block(h2.block_info(), subscription));

	fixture.scheduler.run_until_idle();
	assert_eq!(fixture.synchronizer.queued_blocks_count(), 0);
	assert_eq!(fixture.tree.best_leaf().number, 0);
	assert_eq!(
		subscription_result.lock().take().unwrap(),
		Err(SyncError::DiscardedBlock)
	);
}

#[test]
fn subscriptions_fire_for_terminal_states_immediately() {
	let fixture = fixture(SyncMode::Full);
	let genesis = genesis_header();
	let h1 = child_header(&genesis, 1);
	fixture.tree.add_block(Block { header: h1.clone(), body: vec![] }).unwrap();
	fixture
		.tree
		.finalize(&h1.hash(), EncodedJustification(vec![1]))
		.unwrap();

	// Already in the tree.
	let (in_tree, in_tree_result) = capture();
	assert!(!fixture.synchronizer.subscribe_to_block(h1.block_info(), in_tree));

	// Number at or below the finalized height, but not the chain we keep.
	let (discarded, discarded_result) = capture();
	assert!(!fixture
		.synchronizer
		.subscribe_to_block(BlockInfo::new(1, H256::repeat_byte(0xdd)), discarded));

	// Too far beyond the best block.
	let far = BlockInfo::new(
		h1.number + MAX_DISTANCE_TO_BLOCK_FOR_SUBSCRIPTION + 1,
		H256::repeat_byte(0xfa),
	);
	let (too_early, too_early_result) = capture();
	assert!(!fixture.synchronizer.subscribe_to_block(far, too_early));

	fixture.scheduler.run_until_idle();
	assert_eq!(in_tree_result.lock().take().unwrap().unwrap(), h1.block_info());
	assert_eq!(
		discarded_result.lock().take().unwrap(),
		Err(SyncError::DiscardedBlock)
	);
	assert_eq!(
		too_early_result.lock().take().unwrap(),
		Err(SyncError::ArrivedTooEarly)
	);
}

#[test]
fn pending_subscription_fires_once_the_block_is_applied() {
	let fixture = fixture(SyncMode::Full);
	let h1 = child_header(&genesis_header(), 1);

	let (subscription, subscription_result) = capture();
	assert!(fixture.synchronizer.subscribe_to_block(h1.block_info(), subscription));

	fixture
		.synchronizer
		.load_blocks(peer(), fixture.tree.best_leaf(), None);
	let (_peer, _request, respond_to) = fixture.network.next_blocks_request().unwrap();
	respond(respond_to, vec![block_data(&h1)]);
	fixture.scheduler.run_until_idle();

	assert_eq!(
		subscription_result.lock().take().unwrap().unwrap(),
		h1.block_info()
	);
}

#[test]
fn finality_lag_triggers_justification_download() {
	let fixture = fixture_with(SyncMode::Full, |_tree| Arc::new(NoopExecutor));
	let peer = peer();
	let genesis = genesis_header();

	// A block far beyond the finalized height sits in the queue, served
	// by `peer`.
	let mut far_header = child_header(&genesis, 7);
	far_header.number = 600;
	let far_hash = far_header.hash();
	{
		let mut state = fixture.synchronizer.state.lock();
		state.generations.insert((600, far_hash));
		state.known_blocks.insert(
			far_hash,
			KnownBlock {
				data: BlockData {
					hash: far_hash,
					header: Some(far_header),
					body: Some(vec![]),
					justification: None,
				},
				peers: HashSet::from([peer]),
			},
		);
	}

	fixture.synchronizer.apply_next_block();

	// The post-apply hook noticed the finality lag and asked the serving
	// peer for justifications starting at the finalized block.
	let (request_peer, request, _handler) =
		fixture.network.next_blocks_request().expect("justification request dispatched");
	assert_eq!(request_peer, peer);
	assert_eq!(
		request.fields,
		BlockAttributes::HEADER | BlockAttributes::JUSTIFICATION
	);
	assert_eq!(request.from, BlockId::Hash(genesis.hash()));
	assert_eq!(request.max, Some((JUSTIFICATION_INTERVAL * 2) as u32));
}

#[test]
fn justification_pages_until_target_and_applies() {
	let fixture = fixture(SyncMode::Full);
	let genesis = genesis_header();
	let h1 = child_header(&genesis, 1);
	let h2 = child_header(&h1, 2);
	for header in [&h1, &h2] {
		fixture
			.tree
			.add_block(Block { header: header.clone(), body: vec![] })
			.unwrap();
	}
	let peer = peer();

	let (handler, result) = capture();
	fixture.synchronizer.sync_missing_justifications(
		peer,
		h1.block_info(),
		Some(10),
		Some(handler),
	);

	// First page: h1 without a justification, h2 with one; the target has
	// not been reached so another page is requested.
	let (_peer, request, respond_to) = fixture.network.next_blocks_request().unwrap();
	assert_eq!(
		request.fields,
		BlockAttributes::HEADER | BlockAttributes::JUSTIFICATION
	);
	let mut justified = block_data(&h2);
	justified.justification = Some(EncodedJustification(vec![2]));
	respond(respond_to, vec![block_data(&h1), justified]);
	fixture.scheduler.run_until_idle();

	// Second page from the last observed block; only that block comes
	// back, so pagination stops.
	let (_peer, request, respond_to) = fixture.network.next_blocks_request().unwrap();
	assert_eq!(request.from, BlockId::Hash(h2.hash()));
	respond(respond_to, vec![block_data(&h2)]);
	fixture.scheduler.run_until_idle();

	assert_matches!(result.lock().take().unwrap(), Ok(_));
	// The fetched justification was applied and finalized h2.
	assert_eq!(fixture.tree.get_last_finalized(), h2.block_info());
}

#[test]
fn justification_sync_waits_for_a_busy_peer() {
	let fixture = fixture(SyncMode::Full);
	let peer = peer();
	fixture.synchronizer.state.lock().busy_peers.insert(peer);

	fixture.synchronizer.sync_missing_justifications(
		peer,
		fixture.tree.get_last_finalized(),
		Some(4),
		None,
	);
	// Nothing sent while the peer serves another exchange; the retry is
	// parked on the scheduler.
	assert_eq!(fixture.network.pending_blocks_requests(), 0);

	fixture.synchronizer.unmark_busy(&peer);
	fixture.scheduler.run_until_idle();
	let (request_peer, request, _handler) = fixture.network.next_blocks_request().unwrap();
	assert_eq!(request_peer, peer);
	assert_eq!(
		request.fields,
		BlockAttributes::HEADER | BlockAttributes::JUSTIFICATION
	);
}

#[test]
fn announce_with_known_parent_loads_blocks_directly() {
	let fixture = fixture(SyncMode::Full);
	let h1 = child_header(&genesis_header(), 1);

	let (handler, _result) = capture();
	assert!(fixture.synchronizer.sync_by_block_header(h1.clone(), peer(), handler));

	let (_peer, request, _respond_to) = fixture.network.next_blocks_request().unwrap();
	assert_eq!(request.from, BlockId::Hash(h1.hash()));
}

#[test]
fn busy_peer_is_not_probed_again() {
	let fixture = fixture(SyncMode::Full);
	let peer = peer();
	fixture.synchronizer.state.lock().busy_peers.insert(peer);

	let started = fixture.synchronizer.sync_by_block_info(
		BlockInfo::new(5, H256::repeat_byte(5)),
		peer,
		None,
		false,
	);
	assert!(!started);
	assert_eq!(fixture.network.pending_blocks_requests(), 0);
}

#[test]
fn ask_next_portion_picks_an_idle_serving_peer() {
	let fixture = fixture(SyncMode::Fast);
	let peer = peer();
	let h1 = child_header(&genesis_header(), 1);
	let h1_hash = h1.hash();
	{
		let mut state = fixture.synchronizer.state.lock();
		state.generations.insert((1, h1_hash));
		state.known_blocks.insert(
			h1_hash,
			KnownBlock {
				data: BlockData {
					hash: h1_hash,
					header: Some(h1.clone()),
					body: None,
					justification: None,
				},
				peers: HashSet::from([peer]),
			},
		);
	}

	fixture.synchronizer.ask_next_portion_of_blocks();
	let (request_peer, request, _handler) = fixture.network.next_blocks_request().unwrap();
	assert_eq!(request_peer, peer);
	assert_eq!(request.from, BlockId::Hash(h1_hash));
	// Fast sync asks for headers and justifications only.
	assert!(!request.attribute_is_set(BlockAttributes::BODY));
	assert!(fixture.synchronizer.state.lock().busy_peers.contains(&peer));
}

#[test]
fn state_sync_pages_commits_and_switches_to_full() {
	let fixture = fixture(SyncMode::Fast);
	let mut events = fixture.events.subscribe();

	let entries =
		vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())];
	let root = StubTrie::root_of(entries.clone());
	let mut target = child_header(&genesis_header(), 0);
	target.state_root = root;
	fixture.tree.add_header(target.clone()).unwrap();

	let (handler, result) = capture();
	fixture.synchronizer.sync_state(peer(), target.block_info(), handler);

	// First page is incomplete.
	let (_peer, request, respond_to) = fixture.network.next_state_request().unwrap();
	assert_eq!(request.block, target.hash());
	assert!(request.start.is_empty());
	respond_to(Ok(StateResponse {
		entries: vec![KeyValueStateEntry {
			state_root: vec![],
			entries: vec![StateEntry { key: b"a".to_vec(), value: b"1".to_vec() }],
			complete: false,
		}],
		proof: vec![],
	}));

	// The cursor advanced; a second sync_state call while one is running
	// is ignored.
	let (ignored, ignored_result) = capture();
	fixture
		.synchronizer
		.sync_state(peer(), target.block_info(), ignored);
	assert!(ignored_result.lock().is_none());

	let (_peer, request, respond_to) = fixture.network.next_state_request().unwrap();
	assert_eq!(request.start, vec![b"a".to_vec()]);
	respond_to(Ok(StateResponse {
		entries: vec![KeyValueStateEntry {
			state_root: vec![],
			entries: vec![StateEntry { key: b"b".to_vec(), value: b"2".to_vec() }],
			complete: true,
		}],
		proof: vec![],
	}));

	assert_eq!(
		result.lock().take().unwrap().unwrap(),
		target.block_info()
	);
	assert_eq!(fixture.synchronizer.sync_mode(), SyncMode::Full);
	// Committing the snapshot announced the new runtime.
	let mut saw_new_runtime = false;
	while let Ok(Some(event)) = events.try_next() {
		if event == ChainEvent::NewRuntime(target.hash()) {
			saw_new_runtime = true;
		}
	}
	assert!(saw_new_runtime);
	assert!(fixture.network.next_state_request().is_none());
}

#[test]
fn fast_sync_discards_queued_blocks_while_state_sync_runs() {
	let fixture = fixture(SyncMode::Fast);
	let target = child_header(&genesis_header(), 0);
	fixture.tree.add_header(target.clone()).unwrap();
	let (state_handler, _state_result) = capture();
	fixture
		.synchronizer
		.sync_state(peer(), target.block_info(), state_handler);
	assert!(fixture.network.next_state_request().is_some());

	// A block arrives while the snapshot is being fetched.
	let stray = child_header(&target, 5);
	fixture
		.synchronizer
		.load_blocks(peer(), fixture.tree.best_leaf(), None);
	let (_peer, _request, respond_to) = fixture.network.next_blocks_request().unwrap();
	respond(respond_to, {
		let mut data = block_data(&stray);
		data.body = None;
		vec![data]
	});
	assert_eq!(fixture.synchronizer.queued_blocks_count(), 1);

	fixture.scheduler.run_until_idle();
	assert_eq!(fixture.synchronizer.queued_blocks_count(), 0);
	assert!(!fixture.tree.has_block_header(&stray.hash()).unwrap());
}

#[test]
fn shutdown_short_circuits_pending_operations() {
	let fixture = fixture(SyncMode::Full);
	fixture.synchronizer.shutdown();

	let (handler, result) = capture();
	fixture
		.synchronizer
		.load_blocks(peer(), fixture.tree.best_leaf(), Some(handler));
	assert_eq!(result.lock().take().unwrap(), Err(SyncError::ShuttingDown));
	assert_eq!(fixture.network.pending_blocks_requests(), 0);

	let (handler, result) = capture();
	fixture.synchronizer.sync_missing_justifications(
		peer(),
		fixture.tree.get_last_finalized(),
		None,
		Some(handler),
	);
	assert_eq!(result.lock().take().unwrap(), Err(SyncError::ShuttingDown));
}

#[test]
fn queue_is_pruned_after_finalization_progress() {
	let fixture = fixture(SyncMode::Full);
	let genesis = genesis_header();
	let h1 = child_header(&genesis, 1);
	let h1_sibling = child_header(&genesis, 9);
	let h2 = child_header(&h1, 2);

	// Enqueue the canonical h1/h2 plus a competing sibling of h1, served
	// by two different peers so the fingerprints don't collide.
	fixture
		.synchronizer
		.load_blocks(peer(), fixture.tree.best_leaf(), None);
	let (_peer, _request, respond_to) = fixture.network.next_blocks_request().unwrap();
	respond(respond_to, vec![block_data(&h1), block_data(&h2)]);
	fixture
		.synchronizer
		.load_blocks(peer(), fixture.tree.best_leaf(), None);
	let (_peer, _request, respond_to) = fixture.network.next_blocks_request().unwrap();
	respond(respond_to, vec![block_data(&h1_sibling)]);

	assert_eq!(fixture.synchronizer.queued_blocks_count(), 3);

	// h1 and h2 get applied; the finalization of h1 must flush the
	// sibling from the queue.
	fixture.scheduler.run_until_idle();
	assert_eq!(fixture.synchronizer.queued_blocks_count(), 0);
	fixture
		.tree
		.finalize(&h1.hash(), EncodedJustification(vec![1]))
		.unwrap();
	assert_eq!(fixture.tree.get_last_finalized(), h1.block_info());
}

#[test]
fn tree_pruning_clears_matching_queue_entries() {
	let fixture = fixture(SyncMode::Full);
	let genesis = genesis_header();
	let a1 = child_header(&genesis, 0xa1);
	let b1 = child_header(&genesis, 0xb1);
	let b2 = child_header(&b1, 0xb2);
	fixture.tree.add_block(Block { header: a1.clone(), body: vec![] }).unwrap();
	fixture.tree.add_block(Block { header: b1.clone(), body: vec![] }).unwrap();

	// b2, a child of the to-be-pruned fork, is still in the queue.
	fixture
		.synchronizer
		.load_blocks(peer(), fixture.tree.best_leaf(), None);
	let (_peer, _request, respond_to) = fixture.network.next_blocks_request().unwrap();
	respond(respond_to, vec![block_data(&b2)]);
	assert_eq!(fixture.synchronizer.queued_blocks_count(), 1);

	// Finalizing a1 prunes the b-branch; the discard hook must flush b2.
	fixture
		.tree
		.finalize(&a1.hash(), EncodedJustification(vec![1]))
		.unwrap();
	assert_eq!(fixture.synchronizer.queued_blocks_count(), 0);
}
