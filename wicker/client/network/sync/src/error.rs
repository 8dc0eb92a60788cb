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

//! Synchronizer error type.

/// Errors handed to sync result handlers and subscription callbacks.
///
/// All of these are recovered locally (another peer is tried, queue
/// entries are discarded); none is fatal for the node. `Clone` because a
/// single failure may fan out to several subscribers.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
	#[error("node is shutting down")]
	ShuttingDown,

	#[error("response does not contain any blocks")]
	EmptyResponse,

	#[error("response does not contain the header of some block")]
	ResponseWithoutBlockHeader,

	#[error("response does not contain the body of some block")]
	ResponseWithoutBlockBody,

	#[error("block is discarded")]
	DiscardedBlock,

	#[error("wrong order of blocks in response")]
	WrongOrder,

	#[error("block hash does not match the header")]
	InvalidHash,

	#[error("block is already enqueued")]
	AlreadyInQueue,

	#[error("peer is busy")]
	PeerBusy,

	#[error("block arrived too early, try again later")]
	ArrivedTooEarly,

	#[error("duplicate of a recent request")]
	DuplicateRequest,

	#[error("state snapshot does not match the target state root")]
	StateRootMismatch,

	#[error("network error: {0}")]
	Network(String),

	#[error("blockchain error: {0}")]
	Blockchain(String),
}

impl From<wc_blockchain::Error> for SyncError {
	fn from(error: wc_blockchain::Error) -> Self {
		Self::Blockchain(error.to_string())
	}
}
