// Copyright (C) 2023 QuerentAI LLC.
// This file is part of Querent.

// The Licensed Work is licensed under the Business Source License 1.1 (BSL 1.1).
// You may use this file in compliance with the BSL 1.1, subject to the following restrictions:
// 1. You may not use the Licensed Work for AI-related services, database services,
//    or any service or product offering that provides database, big data, or analytics
//    services to third parties unless explicitly authorized by QuerentAI LLC.
// 2. For more details, see the LICENSE file or visit https://mariadb.com/bsl11/.

// For inquiries about alternative licensing arrangements, please contact contact@querent.xyz.

// The Licensed Work is provided "AS IS", WITHOUT WARRANTY OF ANY KIND, express or implied,
// including but not limited to the warranties of merchantability, fitness for a particular purpose,
// and non-infringement. See the Business Source License for more details.

// This software includes code developed by QuerentAI LLC (https://querent.xyz).

use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum EngineState {
	/// The engine accepts and processes executions.
	Running = 0,
	/// The engine rejects new executions but lets in-flight ones finish.
	Draining = 1,
	/// The engine is fully stopped. Terminal.
	Shutdown = 2,
}

impl From<u32> for EngineState {
	fn from(engine_state_u32: u32) -> Self {
		match engine_state_u32 {
			0 => EngineState::Running,
			1 => EngineState::Draining,
			2 => EngineState::Shutdown,
			_ => {
				panic!(
					"Found forbidden u32 value for EngineState `{engine_state_u32}`. This should \
					 never happen."
				);
			},
		}
	}
}

impl EngineState {
	pub fn is_running(&self) -> bool {
		*self == EngineState::Running
	}

	pub fn is_shutting_down(&self) -> bool {
		match self {
			EngineState::Running => false,
			EngineState::Draining | EngineState::Shutdown => true,
		}
	}

	pub fn is_shutdown(&self) -> bool {
		*self == EngineState::Shutdown
	}
}

impl From<EngineState> for AtomicEngineState {
	fn from(state: EngineState) -> Self {
		AtomicEngineState(AtomicU32::from(state as u32))
	}
}

/// Engine lifecycle with monotonic transitions: once a state is left, it
/// is never re-entered. `fetch_max` makes concurrent transition attempts
/// commute.
pub(crate) struct AtomicEngineState(AtomicU32);

impl Default for AtomicEngineState {
	fn default() -> Self {
		AtomicEngineState(AtomicU32::new(EngineState::Running as u32))
	}
}

impl AtomicEngineState {
	/// Moves Running to Draining and returns the state observed before
	/// the transition, so exactly one caller wins the drain.
	pub(crate) fn begin_drain(&self) -> EngineState {
		EngineState::from(self.0.fetch_max(EngineState::Draining as u32, Ordering::SeqCst))
	}

	pub(crate) fn complete_shutdown(&self) {
		self.0.fetch_max(EngineState::Shutdown as u32, Ordering::SeqCst);
	}

	pub fn get_state(&self) -> EngineState {
		EngineState::from(self.0.load(Ordering::Acquire))
	}
}
