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

//! Header validation: digest shape, seal signature, VRF slot claim.

use crate::{
	config::{BabeConfigRepository, EpochData},
	VerificationError, LOG_TARGET,
};
use log::trace;
use std::sync::Arc;
use wc_blockchain::BlockTree;
use wp_core::{
	crypto::{Sr25519Verifier, VrfOutput, VrfTranscript, VrfVerifier},
	digests::{babe_pre_digest, babe_seal, PreDigest},
	header::{DigestItem, BABE_ENGINE_ID},
	BlockHeader,
};

/// 2^128-scaled threshold a primary VRF output must stay below:
/// `p = 1 - (1 - c)^(weight / total_weight)`.
pub(crate) fn primary_threshold(c: (u64, u64), weight: u64, total_weight: u64) -> u128 {
	let c = c.0 as f64 / c.1.max(1) as f64;
	let theta = weight as f64 / total_weight.max(1) as f64;
	let p = 1f64 - (1f64 - c).powf(theta);
	(p * u128::MAX as f64) as u128
}

/// The low 128 bits of a VRF output, compared against the threshold.
pub(crate) fn vrf_output_value(output: &VrfOutput) -> u128 {
	let mut raw = [0u8; 16];
	raw.copy_from_slice(&output.0[..16]);
	u128::from_le_bytes(raw)
}

/// Validates headers against the epoch configuration of their parent.
pub struct BlockValidator {
	tree: Arc<BlockTree>,
	config: Arc<BabeConfigRepository>,
	sr25519: Arc<dyn Sr25519Verifier>,
	vrf: Arc<dyn VrfVerifier>,
}

impl BlockValidator {
	pub fn new(
		tree: Arc<BlockTree>,
		config: Arc<BabeConfigRepository>,
		sr25519: Arc<dyn Sr25519Verifier>,
		vrf: Arc<dyn VrfVerifier>,
	) -> Self {
		Self { tree, config, sr25519, vrf }
	}

	/// Check digest well-formedness, the parent slot ordering, the seal
	/// signature of the scheduled authority, and the VRF claim.
	pub fn validate_header(&self, header: &BlockHeader) -> Result<(), VerificationError> {
		check_digest_shape(header)?;
		let pre_digest =
			babe_pre_digest(header).ok_or(VerificationError::NoPreRuntimeDigest)?;
		let seal = babe_seal(header).ok_or(VerificationError::NoSeal)?;
		let slot = pre_digest.slot();

		if let Some(parent) = self.tree.get_block_header(&header.parent_hash)? {
			if let Some(parent_slot) = babe_pre_digest(&parent).map(|pre| pre.slot()) {
				if slot <= parent_slot {
					return Err(VerificationError::SlotNotAfterParent {
						slot,
						parent_slot,
					})
				}
			}
		}

		let epoch = self.config.config_for(&header.parent_hash, slot)?;
		let index = pre_digest.authority_index();
		let (authority, weight) = epoch
			.authorities
			.get(index as usize)
			.copied()
			.ok_or(VerificationError::AuthorityOutOfRange { index })?;

		let pre_seal_hash = header.pre_seal_hash();
		if !self.sr25519.verify(&seal, pre_seal_hash.as_bytes(), &authority) {
			return Err(VerificationError::InvalidSealSignature)
		}

		match pre_digest {
			PreDigest::Primary { vrf_output, vrf_proof, .. } => {
				self.check_vrf(&epoch, slot, &vrf_output, &vrf_proof, &authority)?;
				let threshold = primary_threshold(
					epoch.c,
					weight,
					epoch.authorities.iter().map(|(_, w)| w).sum(),
				);
				if vrf_output_value(&vrf_output) >= threshold {
					return Err(VerificationError::VrfOverThreshold)
				}
			},
			PreDigest::SecondaryVRF { vrf_output, vrf_proof, .. } => {
				if !epoch.allowed_slots.allows_secondary() {
					return Err(VerificationError::SecondarySlotsDisabled)
				}
				self.check_vrf(&epoch, slot, &vrf_output, &vrf_proof, &authority)?;
			},
			PreDigest::SecondaryPlain { .. } =>
				if !epoch.allowed_slots.allows_secondary() {
					return Err(VerificationError::SecondarySlotsDisabled)
				},
		}

		trace!(
			target: LOG_TARGET,
			"Header of block #{} validated: slot {slot}, authority {index}",
			header.number,
		);
		Ok(())
	}

	fn check_vrf(
		&self,
		epoch: &EpochData,
		slot: wp_core::Slot,
		output: &VrfOutput,
		proof: &wp_core::crypto::VrfProof,
		authority: &wp_core::crypto::Sr25519Public,
	) -> Result<(), VerificationError> {
		let transcript =
			VrfTranscript { randomness: epoch.randomness, slot, epoch: epoch.epoch };
		if !self.vrf.verify(&transcript, output, proof, authority) {
			return Err(VerificationError::VrfVerificationFailed)
		}
		Ok(())
	}
}

/// The BABE pre-runtime digest must open the log list and the seal must
/// close it; anything else is a malformed header.
fn check_digest_shape(header: &BlockHeader) -> Result<(), VerificationError> {
	let logs = &header.digest.logs;
	match logs.first() {
		Some(DigestItem::PreRuntime(engine, _)) if *engine == BABE_ENGINE_ID => {},
		_ => return Err(VerificationError::NoPreRuntimeDigest),
	}
	match logs.last() {
		Some(DigestItem::Seal(engine, _)) if *engine == BABE_ENGINE_ID => {},
		_ => return Err(VerificationError::NoSeal),
	}
	if logs[..logs.len() - 1].iter().any(|item| matches!(item, DigestItem::Seal(..))) ||
		logs[1..].iter().any(|item| matches!(item, DigestItem::PreRuntime(..)))
	{
		return Err(VerificationError::BadOrderOfDigestItems)
	}
	Ok(())
}
