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

//! Seams between the synchronizer and the consensus-side import logic.
//!
//! The import work is executed off the caller's context (validation and
//! execution run on the worker pool), so completion is reported through a
//! one-shot callback rather than a return value.

use crate::error::Error;
use wp_core::{Block, BlockHeader, BlockInfo, EncodedJustification};

/// How an import attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
	/// The block tree refused the block. [`Error::BlockExists`] inside is
	/// an informational signal, not a failure.
	#[error(transparent)]
	Tree(#[from] Error),

	#[error("header verification failed: {0}")]
	Verification(String),

	#[error("block execution failed: {0}")]
	Execution(String),

	#[error("justification rejected: {0}")]
	Justification(String),
}

impl ImportError {
	/// Whether the target block ended up present in the tree anyway.
	pub fn is_already_in_tree(&self) -> bool {
		matches!(self, Self::Tree(Error::BlockExists(_)))
	}
}

/// One-shot completion callback of an import operation.
pub type ImportResultCallback = Box<dyn FnOnce(Result<(), ImportError>) + Send>;

/// Executes complete blocks against their parent state and inserts them
/// into the block tree (Full sync).
pub trait BlockExecutor: Send + Sync {
	fn apply_block(
		&self,
		block: Block,
		justification: Option<EncodedJustification>,
		callback: ImportResultCallback,
	);
}

/// Validates and appends bare headers to the block tree (Fast sync).
pub trait BlockHeaderAppender: Send + Sync {
	fn append_header(
		&self,
		header: BlockHeader,
		justification: Option<EncodedJustification>,
		callback: ImportResultCallback,
	);
}

/// Applies finality justifications, driving the finalized cursor.
pub trait JustificationApplier: Send + Sync {
	fn apply_justification(
		&self,
		block: BlockInfo,
		justification: EncodedJustification,
		callback: ImportResultCallback,
	);
}
