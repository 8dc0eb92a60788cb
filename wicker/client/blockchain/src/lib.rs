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

//! The persistent block store and the in-memory, fork-aware block tree.
//!
//! [`BlockStore`] is a thin column-oriented layer over a key-value
//! database holding headers, bodies, justifications, the number→hash
//! lookup and chain metadata. [`BlockTree`] keeps every unfinalized block
//! above the last finalized one in memory, tracks competing forks and the
//! best chain, and prunes on finalization.

pub mod block_store;
pub mod error;
pub mod import;
pub mod justification_policy;
pub mod notifications;
pub mod tree;

pub use block_store::{columns, BlockStore};
pub use error::Error;
pub use import::{
	BlockExecutor, BlockHeaderAppender, ImportError, ImportResultCallback, JustificationApplier,
};
pub use justification_policy::JustificationStoragePolicy;
pub use notifications::{ChainEvent, ChainEvents};
pub use tree::BlockTree;

const LOG_TARGET: &str = "blockchain";
