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

//! Chain event fan-out.

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use parking_lot::Mutex;
use wp_core::{BlockInfo, H256};

/// Events published by the block tree and the synchronizer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
	/// The best chain changed its head.
	NewBestBlock(BlockInfo),
	/// The finalized cursor moved forward.
	Finalized(BlockInfo),
	/// A new runtime became available, e.g. after a state snapshot was
	/// committed.
	NewRuntime(H256),
}

/// Unbounded multi-subscriber event hub. Closed subscriptions are swept
/// on the next notification.
#[derive(Default)]
pub struct ChainEvents {
	subscribers: Mutex<Vec<UnboundedSender<ChainEvent>>>,
}

impl ChainEvents {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn subscribe(&self) -> UnboundedReceiver<ChainEvent> {
		let (sender, receiver) = unbounded();
		self.subscribers.lock().push(sender);
		receiver
	}

	pub fn notify(&self, event: ChainEvent) {
		self.subscribers
			.lock()
			.retain(|subscriber| subscriber.unbounded_send(event.clone()).is_ok());
	}
}
