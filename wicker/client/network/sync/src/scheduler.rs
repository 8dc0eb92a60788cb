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

//! The cooperative main execution context.
//!
//! All network callbacks and the import loop run on one logical context;
//! tasks posted here execute in posting order. CPU-heavy work happens
//! elsewhere and reports back by posting a task.

use std::time::Duration;

pub type Task = Box<dyn FnOnce() + Send>;

/// Posts tasks to the main context, immediately or after a delay.
pub trait Scheduler: Send + Sync {
	fn schedule(&self, task: Task);
	fn schedule_after(&self, delay: Duration, task: Task);
}
