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

//! BABE-side import logic: per-block consensus configuration derived from
//! epoch digests, header validation (digest shape, seal signature, VRF
//! threshold), and the block executor / header appender feeding the block
//! tree.

pub mod block_import;
pub mod config;
pub mod digest_tracker;
pub mod verification;

pub use block_import::{BabeBlockExecutor, BabeHeaderAppender, BlockAppenderBase};
pub use config::{AllowedSlots, BabeConfigRepository, BabeConfiguration, EpochData};
pub use digest_tracker::{ConsistencyGuard, DigestTracker};
pub use verification::BlockValidator;

use wp_core::{BlockNumber, H256, Slot};

const LOG_TARGET: &str = "babe";

/// Why a header failed validation. The offending block and all of its
/// descendants are discarded and the serving peer penalized.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
	#[error("header carries no BABE pre-runtime digest")]
	NoPreRuntimeDigest,

	#[error("header carries no BABE seal")]
	NoSeal,

	#[error("digest items are in the wrong order")]
	BadOrderOfDigestItems,

	#[error("claimed authority index {index} is out of range for the epoch")]
	AuthorityOutOfRange { index: u32 },

	#[error("secondary slot claims are disabled in this epoch")]
	SecondarySlotsDisabled,

	#[error("slot {slot} is not after the parent's slot {parent_slot}")]
	SlotNotAfterParent { slot: Slot, parent_slot: Slot },

	#[error("seal signature does not verify against the scheduled authority")]
	InvalidSealSignature,

	#[error("VRF proof does not verify")]
	VrfVerificationFailed,

	#[error("VRF output does not meet the primary-slot threshold")]
	VrfOverThreshold,

	#[error("no epoch configuration reachable for parent 0x{0:x}")]
	ConfigUnavailable(H256),

	#[error(transparent)]
	Blockchain(#[from] wc_blockchain::Error),
}

/// How many slots an epoch lasts.
pub type EpochLength = u64;

/// Index of an epoch since genesis.
pub type EpochIndex = u64;

/// Epoch index a slot belongs to.
pub fn epoch_index(slot: Slot, epoch_length: EpochLength) -> EpochIndex {
	slot / epoch_length.max(1)
}

/// Blocks an import must look back at most when resolving epoch data; a
/// deeper walk than one epoch of blocks means the chain is broken.
pub(crate) const MAX_EPOCH_WALK: BlockNumber = 100_000;
