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

#![deny(clippy::disallowed_methods)]

//! pipeline is a staged data-processing engine.
//!
//! It solves the following problem:
//! - run a linear sequence of named stages, each transforming a value
//! - keep every handler invocation isolated and time-bounded, so a
//!   runaway handler cannot destabilise the orchestrator
//! - cap concurrency globally and per stage with fair-ordered admission
//! - react to failures with per-stage policies (retry, continue, stop,
//!   custom), with loop detection
//! - drain gracefully: Running → Draining → Shutdown

use std::num::NonZeroU64;

use once_cell::sync::Lazy;
use tokio::time::Duration;
use tracing::{info, warn};

mod config;
mod engine;
mod engine_state;
mod error;
mod handler;
pub mod metrics;
mod monitor;
mod policy;
mod semaphore;
mod worker;
mod worker_pool;

#[cfg(test)]
pub(crate) mod tests;

pub use config::{
	PipelineOptions, RetryOptions, StageConfig, StageId, StageOptions, DEFAULT_MAX_RETRIES,
};
pub use engine::{
	Pipeline, PipelineBuilder, ShutdownObserver, ShutdownOptions, StageInput,
};
pub use engine_state::EngineState;
pub use error::PipelineError;
pub use handler::{handler_fn, StageHandler, StageHandlerKind};
pub use monitor::{
	EventBroker, EventContext, EventSubscriptionHandle, PipelineEvent, PipelineEventKind,
};
pub use policy::{
	policy_fn, resolver_fn, ErrorAction, ErrorContext, ErrorPolicy, ErrorResolver, PipelineState,
};
pub use semaphore::Semaphore;
pub use worker_pool::WorkerPool;

/// Deadline granted to in-flight executions when a shutdown does not
/// specify one.
///
/// - Derived from `PIPELINE_SHUTDOWN_TIMEOUT_SECS` if set and valid.
/// - Defaults to 30 seconds.
pub static DEFAULT_SHUTDOWN_TIMEOUT: Lazy<Duration> =
	Lazy::new(shutdown_timeout_from_env_or_default);

fn shutdown_timeout_from_env_or_default() -> Duration {
	match std::env::var("PIPELINE_SHUTDOWN_TIMEOUT_SECS") {
		Ok(shutdown_timeout_secs_str) => {
			if let Ok(shutdown_timeout_secs) = shutdown_timeout_secs_str.parse::<NonZeroU64>() {
				info!("set the shutdown timeout to {shutdown_timeout_secs} seconds");
				return Duration::from_secs(shutdown_timeout_secs.get());
			} else {
				warn!(
					"failed to parse `PIPELINE_SHUTDOWN_TIMEOUT_SECS={shutdown_timeout_secs_str}` \
					 in seconds > 0, using default shutdown timeout (30 seconds)"
				);
			};
		},
		Err(std::env::VarError::NotUnicode(os_str)) => {
			warn!(
				"failed to parse `PIPELINE_SHUTDOWN_TIMEOUT_SECS={os_str:?}` in a valid unicode \
				 string, using default shutdown timeout (30 seconds)"
			);
		},
		Err(std::env::VarError::NotPresent) => {},
	}
	Duration::from_secs(30)
}
