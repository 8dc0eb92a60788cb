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

//! Chain synchronization: per-peer common-ancestor discovery, block and
//! justification download, the import queue feeding the executor, and
//! state-snapshot sync for fast mode.

pub mod error;
pub mod message;
pub mod network;
pub mod scheduler;
pub mod state_sync;
pub mod synchronizer;

pub use error::SyncError;
pub use message::{
	BlockAttributes, BlocksRequest, BlocksResponse, Direction, RequestFingerprint, StateRequest,
	StateResponse,
};
pub use network::{StateProtocol, SyncProtocol};
pub use scheduler::Scheduler;
pub use state_sync::StateSyncFlow;
pub use synchronizer::{SyncMode, SyncResultHandler, Synchronizer};

use std::time::Duration;
use wp_core::BlockNumber;

const LOG_TARGET: &str = "sync";

/// How long a request fingerprint suppresses identical requests to the
/// same peer.
pub const RECENTNESS_DURATION: Duration = Duration::from_secs(30);

/// Finalized-height granularity at which justification downloads are
/// re-triggered while catching up.
pub const JUSTIFICATION_INTERVAL: BlockNumber = 512;

/// Tolerated finality lag before the interval check above fires.
pub const MAX_JUSTIFICATION_LAG: BlockNumber = 5;

/// Import-queue fill target in full sync; new fetches start only below it.
pub const MIN_PRELOADED_BLOCK_AMOUNT: usize = 256;

/// Import-queue fill target while fast-syncing headers.
pub const MIN_PRELOADED_BLOCK_AMOUNT_FOR_FAST_SYNCING: usize = MIN_PRELOADED_BLOCK_AMOUNT * 40;

/// Furthest ahead of the best block a subscription target may be.
pub const MAX_DISTANCE_TO_BLOCK_FOR_SUBSCRIPTION: BlockNumber = 2_560;
