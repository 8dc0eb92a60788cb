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

//! Decides which finalized blocks keep their justification on disk.

use wp_core::{digests::scheduled_change_digest, BlockHeader, BlockNumber};

/// Interval between finalized blocks whose justification is retained.
pub const JUSTIFICATION_STORAGE_INTERVAL: BlockNumber = 512;

/// Justifications are written for every finalization but kept long-term
/// only at milestone heights and around authority-set changes, where a
/// later warp-style verification needs them.
#[derive(Clone, Copy, Debug, Default)]
pub struct JustificationStoragePolicy;

impl JustificationStoragePolicy {
	pub fn should_retain(&self, header: &BlockHeader) -> bool {
		header.number % JUSTIFICATION_STORAGE_INTERVAL == 0 ||
			scheduled_change_digest(header).is_some()
	}
}
