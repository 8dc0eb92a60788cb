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

//! Justification decoding and verification.
//!
//! A justification proves finality of its target block: a set of signed
//! precommits whose cumulated voter weight exceeds two thirds of the
//! authority set that was active when the round was played.

use crate::{authorities::AuthoritySet, JustificationError};
use codec::{Decode, Encode};
use wp_core::{
	crypto::{Ed25519Public, Ed25519Signature, Ed25519Verifier},
	BlockInfo, BlockNumber, EncodedJustification, H256,
};
use std::collections::HashSet;

/// Message-type discriminant precommit votes are signed under.
const PRECOMMIT_MARKER: u8 = 1;

/// A finality vote for a block at or above the commit target.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Precommit {
	pub target_hash: H256,
	pub target_number: BlockNumber,
}

/// A precommit with its voter and signature.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SignedPrecommit {
	pub precommit: Precommit,
	pub signature: Ed25519Signature,
	pub id: Ed25519Public,
}

/// A GRANDPA justification as shipped over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct GrandpaJustification {
	pub round: u64,
	pub target_hash: H256,
	pub target_number: BlockNumber,
	pub precommits: Vec<SignedPrecommit>,
}

impl GrandpaJustification {
	pub fn decode_from(raw: &EncodedJustification) -> Result<Self, JustificationError> {
		Ok(Self::decode(&mut &raw.0[..])?)
	}

	pub fn target(&self) -> BlockInfo {
		BlockInfo::new(self.target_number, self.target_hash)
	}

	/// The byte string a voter signs for `precommit` in `round` under
	/// authority set `set_id`.
	pub fn signed_message(precommit: &Precommit, round: u64, set_id: u64) -> Vec<u8> {
		(PRECOMMIT_MARKER, precommit, round, set_id).encode()
	}

	/// Check the justification against `set`.
	///
	/// Every precommit must come from a distinct voter of the set, carry a
	/// valid signature, and target the commit target or a block above it;
	/// the accumulated weight must reach the set's 2/3 threshold.
	pub fn verify(
		&self,
		set: &AuthoritySet,
		verifier: &dyn Ed25519Verifier,
	) -> Result<(), JustificationError> {
		let mut weight = 0u64;
		let mut seen = HashSet::new();

		for signed in &self.precommits {
			let voter_weight =
				set.weight_of(&signed.id).ok_or(JustificationError::UnknownVoter)?;
			if !seen.insert(signed.id) {
				return Err(JustificationError::DuplicateVote)
			}
			if signed.precommit.target_number < self.target_number {
				return Err(JustificationError::PrecommitTooLow)
			}
			let message = Self::signed_message(&signed.precommit, self.round, set.id);
			if !verifier.verify(&signed.signature, &message, &signed.id) {
				return Err(JustificationError::BadSignature)
			}
			weight += voter_weight;
		}

		if weight < set.threshold() {
			return Err(JustificationError::InsufficientWeight {
				got: weight,
				need: set.threshold(),
			})
		}
		Ok(())
	}
}
