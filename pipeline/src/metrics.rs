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

use common::metrics::{counter_vec, new_gauge, IntCounterVec, IntGauge};
use once_cell::sync::Lazy;

pub struct PipelineMetrics {
	pub stage_executions_total: IntCounterVec<1>,
	pub stage_errors_total: IntCounterVec<1>,
	pub active_workers: IntGauge,
	pub active_executions: IntGauge,
}

impl Default for PipelineMetrics {
	fn default() -> Self {
		PipelineMetrics {
			stage_executions_total: counter_vec(
				"stage_executions_total",
				"Number of stage handler invocations.",
				"pipeline",
				&[],
				["stage"],
			),
			stage_errors_total: counter_vec(
				"stage_errors_total",
				"Number of failed stage handler invocations.",
				"pipeline",
				&[],
				["stage"],
			),
			active_workers: new_gauge(
				"active_workers",
				"Number of handler invocations currently running.",
				"pipeline",
			),
			active_executions: new_gauge(
				"active_executions",
				"Number of pipeline executions currently in flight.",
				"pipeline",
			),
		}
	}
}

pub static PIPELINE_METRICS: Lazy<PipelineMetrics> = Lazy::new(PipelineMetrics::default);
