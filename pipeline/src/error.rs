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

use std::sync::Arc;

use common::Retryable;
use thiserror::Error;

use crate::{config::StageId, engine_state::EngineState};

/// Error returned by pipeline executions and by the engine's own
/// plumbing (admission, workers, lifecycle).
///
/// Handler-originated errors are preserved verbatim behind
/// [`PipelineError::Handler`].
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
	#[error("stage `{0}` not found in pipeline")]
	StageNotFound(StageId),
	#[error("Infinite loop detected: stage `{0}` has already run in this execution")]
	InfiniteLoop(StageId),
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),
	#[error("worker timed out after {timeout_ms}ms in stage `{stage}`")]
	WorkerTimeout { stage: StageId, timeout_ms: u64 },
	#[error("worker exited with non-zero status code {0}")]
	WorkerExit(i32),
	#[error("worker aborted")]
	WorkerAbort,
	#[error("worker pool is shut down")]
	PoolShutdown,
	#[error("engine is not running (state: {0:?})")]
	EngineState(EngineState),
	#[error("semaphore is shut down")]
	SemaphoreShutdown,
	#[error("semaphore released without a matching acquire")]
	ReleasedTooMany,
	#[error("shutdown timed out after {0}ms")]
	ShutdownTimeout(u64),
	#[error("{0}")]
	Handler(#[from] Arc<anyhow::Error>),
}

impl PipelineError {
	pub fn from_handler_error(error: anyhow::Error) -> Self {
		PipelineError::Handler(Arc::new(error))
	}
}

impl Retryable for PipelineError {
	fn is_retryable(&self) -> bool {
		match self {
			// Handler and transport failures are worth another attempt.
			PipelineError::Handler(_) |
			PipelineError::WorkerTimeout { .. } |
			PipelineError::WorkerExit(_) => true,
			// Cancellation, shutdown and configuration mistakes are not.
			PipelineError::StageNotFound(_) |
			PipelineError::InfiniteLoop(_) |
			PipelineError::InvalidConfig(_) |
			PipelineError::WorkerAbort |
			PipelineError::PoolShutdown |
			PipelineError::EngineState(_) |
			PipelineError::SemaphoreShutdown |
			PipelineError::ReleasedTooMany |
			PipelineError::ShutdownTimeout(_) => false,
		}
	}
}
