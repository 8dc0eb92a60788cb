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

//! Key, signature and VRF types plus the verifier seams.
//!
//! The actual cryptographic primitives are external collaborators; the
//! client only moves their byte representations around and calls through
//! the traits below.

use crate::Slot;
use codec::{Decode, Encode};

/// An sr25519 public key, as used by block authors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct Sr25519Public(pub [u8; 32]);

/// An sr25519 signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Sr25519Signature(pub [u8; 64]);

/// An ed25519 public key, as used by finality voters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct Ed25519Public(pub [u8; 32]);

/// An ed25519 signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Ed25519Signature(pub [u8; 64]);

/// VRF pre-output included in a primary slot claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct VrfOutput(pub [u8; 32]);

/// VRF proof accompanying [`VrfOutput`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct VrfProof(pub [u8; 64]);

/// Epoch randomness the VRF transcript is built from.
pub type Randomness = [u8; 32];

/// The public inputs a slot-claim VRF is evaluated over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VrfTranscript {
	pub randomness: Randomness,
	pub slot: Slot,
	pub epoch: u64,
}

/// Verifies sr25519 signatures.
pub trait Sr25519Verifier: Send + Sync {
	fn verify(&self, signature: &Sr25519Signature, message: &[u8], public: &Sr25519Public) -> bool;
}

/// Verifies ed25519 signatures.
pub trait Ed25519Verifier: Send + Sync {
	fn verify(&self, signature: &Ed25519Signature, message: &[u8], public: &Ed25519Public) -> bool;
}

/// Verifies slot-claim VRF proofs.
pub trait VrfVerifier: Send + Sync {
	/// Check that `output` and `proof` are a valid evaluation of
	/// `public`'s VRF over `transcript`.
	fn verify(
		&self,
		transcript: &VrfTranscript,
		output: &VrfOutput,
		proof: &VrfProof,
		public: &Sr25519Public,
	) -> bool;
}
