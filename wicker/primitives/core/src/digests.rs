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

//! Typed payloads of the BABE and GRANDPA digest items, and helpers to
//! pull them out of a header.

use crate::{
	crypto::{Ed25519Public, Randomness, Sr25519Public, Sr25519Signature, VrfOutput, VrfProof},
	header::{BlockHeader, DigestItem, BABE_ENGINE_ID, GRANDPA_ENGINE_ID},
	BlockNumber, Slot,
};
use codec::{Decode, Encode};

/// Index of an authority in its set.
pub type AuthorityIndex = u32;

/// Voting weight of an authority.
pub type AuthorityWeight = u64;

/// A BABE authority with its weight.
pub type BabeAuthority = (Sr25519Public, AuthorityWeight);

/// A GRANDPA authority with its weight.
pub type GrandpaAuthority = (Ed25519Public, AuthorityWeight);

/// The slot claim a block author places in the first pre-runtime digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub enum PreDigest {
	/// Primary slot claim, won by VRF lottery.
	#[codec(index = 1)]
	Primary {
		authority_index: AuthorityIndex,
		slot: Slot,
		vrf_output: VrfOutput,
		vrf_proof: VrfProof,
	},
	/// Secondary claim without a VRF output.
	#[codec(index = 2)]
	SecondaryPlain { authority_index: AuthorityIndex, slot: Slot },
	/// Secondary claim carrying a VRF output.
	#[codec(index = 3)]
	SecondaryVRF {
		authority_index: AuthorityIndex,
		slot: Slot,
		vrf_output: VrfOutput,
		vrf_proof: VrfProof,
	},
}

impl PreDigest {
	pub fn authority_index(&self) -> AuthorityIndex {
		match self {
			Self::Primary { authority_index, .. } |
			Self::SecondaryPlain { authority_index, .. } |
			Self::SecondaryVRF { authority_index, .. } => *authority_index,
		}
	}

	pub fn slot(&self) -> Slot {
		match self {
			Self::Primary { slot, .. } |
			Self::SecondaryPlain { slot, .. } |
			Self::SecondaryVRF { slot, .. } => *slot,
		}
	}

	/// Whether this claim is a primary one; primaries add weight to their
	/// chain when competing forks are compared.
	pub fn is_primary(&self) -> bool {
		matches!(self, Self::Primary { .. })
	}
}

/// Epoch data announced one epoch ahead of its activation.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct NextEpochDescriptor {
	pub authorities: Vec<BabeAuthority>,
	pub randomness: Randomness,
}

/// Runtime-to-client messages of the BABE engine.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum BabeConsensusLog {
	#[codec(index = 1)]
	NextEpochData(NextEpochDescriptor),
	#[codec(index = 2)]
	OnDisabled(AuthorityIndex),
}

/// A pending change of the GRANDPA authority set, activated `delay` blocks
/// after the block that announced it.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ScheduledChange {
	pub next_authorities: Vec<GrandpaAuthority>,
	pub delay: BlockNumber,
}

/// Runtime-to-client messages of the GRANDPA engine.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum GrandpaConsensusLog {
	#[codec(index = 1)]
	ScheduledChange(ScheduledChange),
	#[codec(index = 2)]
	ForcedChange(BlockNumber, ScheduledChange),
	#[codec(index = 3)]
	OnDisabled(AuthorityIndex),
}

/// The BABE slot claim of `header`, decoded from its first pre-runtime
/// digest. `None` when the header carries no claim (e.g. genesis).
pub fn babe_pre_digest(header: &BlockHeader) -> Option<PreDigest> {
	header
		.digest
		.logs
		.iter()
		.find_map(|item| item.as_pre_runtime(BABE_ENGINE_ID))
		.and_then(|mut payload| PreDigest::decode(&mut payload).ok())
}

/// The BABE seal of `header`, decoded from its seal digest.
pub fn babe_seal(header: &BlockHeader) -> Option<Sr25519Signature> {
	header
		.digest
		.logs
		.iter()
		.find_map(|item| item.as_seal(BABE_ENGINE_ID))
		.and_then(|mut payload| Sr25519Signature::decode(&mut payload).ok())
}

/// The next-epoch descriptor announced by `header`, if any.
pub fn next_epoch_digest(header: &BlockHeader) -> Option<NextEpochDescriptor> {
	header
		.digest
		.logs
		.iter()
		.find_map(|item| item.as_consensus(BABE_ENGINE_ID))
		.and_then(|mut payload| BabeConsensusLog::decode(&mut payload).ok())
		.and_then(|log| match log {
			BabeConsensusLog::NextEpochData(descriptor) => Some(descriptor),
			_ => None,
		})
}

/// The scheduled GRANDPA authority-set change announced by `header`, if any.
pub fn scheduled_change_digest(header: &BlockHeader) -> Option<ScheduledChange> {
	header
		.digest
		.logs
		.iter()
		.find_map(|item| item.as_consensus(GRANDPA_ENGINE_ID))
		.and_then(|mut payload| GrandpaConsensusLog::decode(&mut payload).ok())
		.and_then(|log| match log {
			GrandpaConsensusLog::ScheduledChange(change) => Some(change),
			_ => None,
		})
}
