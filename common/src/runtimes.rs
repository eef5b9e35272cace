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

use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use tokio::runtime::Runtime;

static WORKER_RUNTIME: OnceCell<Runtime> = OnceCell::new();

#[derive(Debug, Clone, Copy)]
pub struct RuntimesConfig {
	/// Number of threads allocated to the worker runtime.
	///
	/// Stage handlers run on this runtime, out-of-band from the runtime
	/// driving the orchestrator. A handler that blocks one of these
	/// threads for an arbitrary amount of time cannot stall the
	/// orchestrator's own task scheduler.
	pub num_worker_threads: usize,
}

impl RuntimesConfig {
	#[cfg(any(test, feature = "testsuite"))]
	pub fn light_for_tests() -> RuntimesConfig {
		RuntimesConfig { num_worker_threads: 2 }
	}

	pub fn with_num_cpus(num_cpus: usize) -> Self {
		RuntimesConfig { num_worker_threads: num_cpus.max(1) }
	}
}

impl Default for RuntimesConfig {
	fn default() -> Self {
		Self::with_num_cpus(num_cpus::get())
	}
}

fn start_worker_runtime(config: RuntimesConfig) -> Runtime {
	tokio::runtime::Builder::new_multi_thread()
		.worker_threads(config.num_worker_threads)
		.thread_name_fn(|| {
			static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
			let id = ATOMIC_ID.fetch_add(1, Ordering::AcqRel);
			format!("stage-worker-{id}")
		})
		.enable_all()
		.build()
		.expect("failed to start the worker runtime")
}

/// Starts the worker runtime with an explicit configuration.
///
/// Calling this is optional. The first handler invocation lazily starts
/// the runtime with the default configuration if it is not running yet.
pub fn initialize_worker_runtime(config: RuntimesConfig) -> anyhow::Result<()> {
	WORKER_RUNTIME.get_or_init(|| start_worker_runtime(config));
	Ok(())
}

pub fn worker_runtime_handle() -> tokio::runtime::Handle {
	WORKER_RUNTIME
		.get_or_init(|| {
			#[cfg(any(test, feature = "testsuite"))]
			{
				tracing::warn!("starting the worker runtime for tests");
				start_worker_runtime(RuntimesConfig::light_for_tests())
			}
			#[cfg(not(any(test, feature = "testsuite")))]
			{
				start_worker_runtime(RuntimesConfig::default())
			}
		})
		.handle()
		.clone()
}
