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

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::{config::StageId, error::PipelineError};

/// What the orchestrator should do with a failed stage invocation.
#[derive(Clone)]
pub enum ErrorAction {
	/// Re-run the failing stage with the same value.
	///
	/// The budget is `max_retries`, falling back to the stage's retry
	/// options and finally to [`crate::config::DEFAULT_MAX_RETRIES`].
	Retry { max_retries: Option<usize> },
	/// Jump to another stage, resetting the retry counter.
	Continue { next_stage: StageId },
	/// Give up and propagate the original error.
	Stop,
	/// Defer the decision to a resolver.
	///
	/// A resolver returning another `Custom` action is treated as
	/// `Stop`, which guarantees termination of the dispatch.
	Custom(Arc<dyn ErrorResolver>),
}

impl ErrorAction {
	pub fn retry() -> ErrorAction {
		ErrorAction::Retry { max_retries: None }
	}

	pub fn continue_at(next_stage: impl ToString) -> ErrorAction {
		ErrorAction::Continue { next_stage: next_stage.to_string() }
	}
}

impl fmt::Debug for ErrorAction {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			ErrorAction::Retry { max_retries } =>
				f.debug_struct("Retry").field("max_retries", max_retries).finish(),
			ErrorAction::Continue { next_stage } =>
				f.debug_struct("Continue").field("next_stage", next_stage).finish(),
			ErrorAction::Stop => f.write_str("Stop"),
			ErrorAction::Custom(_) => f.write_str("Custom"),
		}
	}
}

/// A snapshot of where the execution stands, handed to policies.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
	pub current_stage: StageId,
	pub stages: Vec<StageId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
	pub stage: StageId,
	pub value: Value,
	pub error: String,
	pub retry_count: usize,
	pub pipeline_state: PipelineState,
}

/// Per-stage reaction to a handler failure.
///
/// `on_error` decides; the other hooks observe the chosen action right
/// before the orchestrator applies it.
#[async_trait]
pub trait ErrorPolicy: Send + Sync + 'static {
	async fn on_error(&self, error: &PipelineError, ctx: &ErrorContext) -> ErrorAction;

	async fn on_retry(&self, _ctx: &ErrorContext) {}

	async fn on_continue(&self, _ctx: &ErrorContext) {}

	async fn on_stop(&self, _ctx: &ErrorContext) {}
}

#[async_trait]
pub trait ErrorResolver: Send + Sync + 'static {
	async fn resolve(&self, error: &PipelineError, ctx: &ErrorContext) -> ErrorAction;
}

struct FnPolicy<F>(F);

#[async_trait]
impl<F> ErrorPolicy for FnPolicy<F>
where
	F: Fn(&PipelineError, &ErrorContext) -> ErrorAction + Send + Sync + 'static,
{
	async fn on_error(&self, error: &PipelineError, ctx: &ErrorContext) -> ErrorAction {
		(self.0)(error, ctx)
	}
}

/// Wraps a plain closure into an [`ErrorPolicy`] with no-op hooks.
pub fn policy_fn<F>(f: F) -> Arc<dyn ErrorPolicy>
where
	F: Fn(&PipelineError, &ErrorContext) -> ErrorAction + Send + Sync + 'static,
{
	Arc::new(FnPolicy(f))
}

struct FnResolver<F>(F);

#[async_trait]
impl<F> ErrorResolver for FnResolver<F>
where
	F: Fn(&PipelineError, &ErrorContext) -> ErrorAction + Send + Sync + 'static,
{
	async fn resolve(&self, error: &PipelineError, ctx: &ErrorContext) -> ErrorAction {
		(self.0)(error, ctx)
	}
}

/// Wraps a plain closure into an [`ErrorResolver`].
pub fn resolver_fn<F>(f: F) -> Arc<dyn ErrorResolver>
where
	F: Fn(&PipelineError, &ErrorContext) -> ErrorAction + Send + Sync + 'static,
{
	Arc::new(FnResolver(f))
}
