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

use std::{fmt, sync::Arc, time::Duration};

use common::RetryParams;
use serde::{Deserialize, Serialize};

use crate::{handler::StageHandlerKind, policy::ErrorPolicy};

pub type StageId = String;

/// Retry budget applied when neither the error policy nor the stage
/// options specify one.
pub const DEFAULT_MAX_RETRIES: usize = 3;

fn default_backoff_ms() -> u64 {
	250
}

fn default_max_retries() -> usize {
	DEFAULT_MAX_RETRIES
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryOptions {
	#[serde(default = "default_max_retries")]
	pub max_retries: usize,
	#[serde(default = "default_backoff_ms")]
	pub backoff_ms: u64,
}

impl Default for RetryOptions {
	fn default() -> Self {
		RetryOptions { max_retries: DEFAULT_MAX_RETRIES, backoff_ms: default_backoff_ms() }
	}
}

/// Execution knobs, overridable per stage.
///
/// All durations are milliseconds. A `worker_timeout_ms` of zero (or
/// none) disables the timeout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StageOptions {
	pub worker_timeout_ms: Option<u64>,
	pub max_concurrency: Option<usize>,
	pub retry: Option<RetryOptions>,
}

/// Pipeline-wide options share the stage option shape; a stage override
/// wins field by field, and `retry` is taken from the stage wholesale
/// when present.
pub type PipelineOptions = StageOptions;

/// Options a single stage invocation effectively runs under, after
/// overlaying stage options on top of the pipeline ones.
#[derive(Debug, Clone)]
pub struct EffectiveOptions {
	pub worker_timeout: Option<Duration>,
	pub stage_max_concurrency: Option<usize>,
	pub retry: Option<RetryParams>,
}

impl EffectiveOptions {
	pub fn resolve(
		pipeline_options: &PipelineOptions,
		stage_options: Option<&StageOptions>,
	) -> EffectiveOptions {
		let worker_timeout_ms = stage_options
			.and_then(|options| options.worker_timeout_ms)
			.or(pipeline_options.worker_timeout_ms);
		let stage_max_concurrency = stage_options.and_then(|options| options.max_concurrency);
		let retry = stage_options
			.and_then(|options| options.retry)
			.or(pipeline_options.retry);
		EffectiveOptions {
			worker_timeout: match worker_timeout_ms {
				None | Some(0) => None,
				Some(timeout_ms) => Some(Duration::from_millis(timeout_ms)),
			},
			stage_max_concurrency,
			retry: retry
				.map(|retry| RetryParams::from_millis(retry.backoff_ms, retry.max_retries)),
		}
	}

	pub fn max_retries(&self) -> Option<usize> {
		self.retry.map(|retry| retry.max_retries)
	}
}

/// A single named stage: the handler plus its optional overrides and
/// failure policy.
#[derive(Clone)]
pub struct StageConfig {
	pub name: StageId,
	pub handler: StageHandlerKind,
	pub options: Option<StageOptions>,
	pub error_policy: Option<Arc<dyn ErrorPolicy>>,
}

impl StageConfig {
	pub fn new(name: impl ToString, handler: StageHandlerKind) -> StageConfig {
		StageConfig {
			name: name.to_string(),
			handler,
			options: None,
			error_policy: None,
		}
	}

	pub fn with_options(mut self, options: StageOptions) -> StageConfig {
		self.options = Some(options);
		self
	}

	pub fn with_error_policy(mut self, error_policy: Arc<dyn ErrorPolicy>) -> StageConfig {
		self.error_policy = Some(error_policy);
		self
	}
}

impl fmt::Debug for StageConfig {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("StageConfig")
			.field("name", &self.name)
			.field("handler", &self.handler)
			.field("options", &self.options)
			.field("has_error_policy", &self.error_policy.is_some())
			.finish()
	}
}
