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

//! Transport seam of the synchronizer.
//!
//! The peer protocol is request/response, synchronous per exchange; the
//! transport owns timeouts and must eventually invoke the handler exactly
//! once, with a [`crate::SyncError::Network`] error on failure or expiry.

use crate::{
	error::SyncError,
	message::{BlocksRequest, BlocksResponse, StateRequest, StateResponse},
};
use libp2p_identity::PeerId;

pub type BlocksResponseHandler = Box<dyn FnOnce(Result<BlocksResponse, SyncError>) + Send>;
pub type StateResponseHandler = Box<dyn FnOnce(Result<StateResponse, SyncError>) + Send>;

/// Sends block requests to a peer.
pub trait SyncProtocol: Send + Sync {
	fn request_blocks(&self, peer: PeerId, request: BlocksRequest, handler: BlocksResponseHandler);
}

/// Sends state requests to a peer.
pub trait StateProtocol: Send + Sync {
	fn request_state(&self, peer: PeerId, request: StateRequest, handler: StateResponseHandler);
}
