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

//! GRANDPA finality for the import pipeline: authority-set tracking and
//! justification verification/application. Voting itself is out of scope;
//! this crate only consumes justifications produced elsewhere.

pub mod authorities;
pub mod environment;
pub mod justification;

pub use authorities::{AuthorityManager, AuthoritySet, AuthoritySetId};
pub use environment::GrandpaEnvironment;
pub use justification::{GrandpaJustification, SignedPrecommit};

use wp_core::{BlockInfo, H256};

const LOG_TARGET: &str = "grandpa";

/// Why a justification was rejected. The block it targets stays in the
/// tree; only the finality claim is discarded.
#[derive(Debug, thiserror::Error)]
pub enum JustificationError {
	#[error("failed to decode justification: {0}")]
	Decode(#[from] codec::Error),

	#[error("justification targets {actual}, expected {expected}")]
	TargetMismatch { expected: BlockInfo, actual: BlockInfo },

	#[error("justification targets the already finalized past at {0}")]
	ForBlockInPast(BlockInfo),

	#[error("justification target {0} does not descend from the last finalized block")]
	NotDescendant(BlockInfo),

	#[error("precommit signed by a voter outside the authority set")]
	UnknownVoter,

	#[error("more than one precommit from the same voter")]
	DuplicateVote,

	#[error("invalid precommit signature")]
	BadSignature,

	#[error("precommit for a block below the justification target")]
	PrecommitTooLow,

	#[error("insufficient voting weight: got {got}, need {need}")]
	InsufficientWeight { got: u64, need: u64 },

	#[error(transparent)]
	Blockchain(#[from] wc_blockchain::Error),
}

/// Outcome of trying to apply a justification whose target may not have
/// been imported yet.
#[derive(Debug)]
pub(crate) enum ApplyOutcome {
	Applied,
	/// Target block is unknown so far; the justification was postponed.
	Postponed(H256),
}
