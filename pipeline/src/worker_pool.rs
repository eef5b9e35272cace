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

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use common::{metrics::GaugeGuard, retry, KillSwitch};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
	config::{EffectiveOptions, StageId},
	error::PipelineError,
	handler::StageHandlerKind,
	metrics::PIPELINE_METRICS,
	semaphore::Semaphore,
	worker::run_isolated,
};

/// Admits, isolates and time-bounds handler invocations.
///
/// One pool serves the whole pipeline: admission goes through the
/// global semaphore, or through a lazily-created per-stage semaphore
/// when the stage declares its own concurrency cap.
///
/// It is lightweight to clone.
#[derive(Clone)]
pub struct WorkerPool {
	inner: Arc<InnerPool>,
}

struct InnerPool {
	global_semaphore: Semaphore,
	stage_semaphores: Mutex<HashMap<StageId, Semaphore>>,
	kill_switch: KillSwitch,
	shutdown: AtomicBool,
	// Mirrors the number of invocations between admission and
	// finalisation, so `shutdown` can await the drain.
	in_flight_tx: watch::Sender<usize>,
}

/// Holds the admission slot and the in-flight accounting of one
/// invocation. Dropping it finalises both, exactly once, on every exit
/// path.
struct AdmissionGuard {
	pool: Arc<InnerPool>,
	semaphore: Semaphore,
	_active_workers_gauge_guard: GaugeGuard,
}

impl AdmissionGuard {
	fn new(pool: Arc<InnerPool>, semaphore: Semaphore) -> AdmissionGuard {
		pool.in_flight_tx.send_modify(|in_flight| *in_flight += 1);
		AdmissionGuard {
			pool,
			semaphore,
			_active_workers_gauge_guard: GaugeGuard::from_gauge(
				&PIPELINE_METRICS.active_workers,
			),
		}
	}
}

impl Drop for AdmissionGuard {
	fn drop(&mut self) {
		self.pool
			.in_flight_tx
			.send_modify(|in_flight| *in_flight = in_flight.saturating_sub(1));
		if let Err(release_error) = self.semaphore.release() {
			warn!(error=?release_error, "semaphore release failed");
		}
	}
}

impl WorkerPool {
	pub fn new(
		global_max_concurrency: Option<usize>,
		kill_switch: KillSwitch,
	) -> Result<WorkerPool, PipelineError> {
		let global_semaphore = match global_max_concurrency {
			Some(max_concurrency) => Semaphore::new(max_concurrency)?,
			None => Semaphore::unbounded(),
		};
		let (in_flight_tx, _in_flight_rx) = watch::channel(0);
		Ok(WorkerPool {
			inner: Arc::new(InnerPool {
				global_semaphore,
				stage_semaphores: Mutex::default(),
				kill_switch,
				shutdown: AtomicBool::new(false),
				in_flight_tx,
			}),
		})
	}

	/// Runs one handler invocation: admission, isolation, timeout and
	/// the optional worker-level retry.
	///
	/// The admission slot is held across retry attempts, so concurrency
	/// caps bound concurrent handlers, not attempts.
	pub async fn run_worker(
		&self,
		handler: &StageHandlerKind,
		value: Value,
		options: &EffectiveOptions,
		stage: &StageId,
	) -> Result<Value, PipelineError> {
		if self.inner.shutdown.load(Ordering::SeqCst) {
			return Err(PipelineError::PoolShutdown);
		}
		let semaphore = self.admission_semaphore(stage, options.stage_max_concurrency)?;
		semaphore.acquire().await?;
		let _admission_guard = AdmissionGuard::new(self.inner.clone(), semaphore);
		let worker_kill_switch = self.inner.kill_switch.child();
		let result = match options.retry {
			Some(retry_params) => {
				retry(&retry_params, || {
					run_isolated(
						handler,
						value.clone(),
						options.worker_timeout,
						&worker_kill_switch,
						stage,
					)
				})
				.await
			},
			None =>
				run_isolated(handler, value, options.worker_timeout, &worker_kill_switch, stage)
					.await,
		};
		PIPELINE_METRICS.stage_executions_total.with_label_values([stage.as_str()]).inc();
		if result.is_err() {
			PIPELINE_METRICS.stage_errors_total.with_label_values([stage.as_str()]).inc();
		}
		result
	}

	fn admission_semaphore(
		&self,
		stage: &StageId,
		stage_max_concurrency: Option<usize>,
	) -> Result<Semaphore, PipelineError> {
		let Some(max_concurrency) = stage_max_concurrency else {
			return Ok(self.inner.global_semaphore.clone());
		};
		let mut stage_semaphores = self.inner.stage_semaphores.lock().unwrap();
		if let Some(semaphore) = stage_semaphores.get(stage) {
			return Ok(semaphore.clone());
		}
		let semaphore = Semaphore::new(max_concurrency)?;
		stage_semaphores.insert(stage.clone(), semaphore.clone());
		Ok(semaphore)
	}

	/// Number of invocations currently admitted by the stage's
	/// semaphore, or by the global one when the stage has no cap of its
	/// own.
	pub fn active_workers(&self, stage_opt: Option<&StageId>) -> usize {
		if let Some(stage) = stage_opt {
			let stage_semaphores = self.inner.stage_semaphores.lock().unwrap();
			if let Some(semaphore) = stage_semaphores.get(stage) {
				return semaphore.current_concurrency();
			}
		}
		self.inner.global_semaphore.current_concurrency()
	}

	pub fn in_flight(&self) -> usize {
		*self.inner.in_flight_tx.borrow()
	}

	pub fn is_shutdown(&self) -> bool {
		self.inner.shutdown.load(Ordering::SeqCst)
	}

	/// Stops admitting work and waits until in-flight invocations have
	/// finalised. On expiry of `timeout`, aborts whatever is left and
	/// fails with [`PipelineError::ShutdownTimeout`].
	pub async fn shutdown(&self, timeout: Duration) -> Result<(), PipelineError> {
		self.inner.shutdown.store(true, Ordering::SeqCst);
		self.inner.global_semaphore.begin_shutdown();
		for semaphore in self.inner.stage_semaphores.lock().unwrap().values() {
			semaphore.begin_shutdown();
		}
		let mut in_flight_rx = self.inner.in_flight_tx.subscribe();
		let drained = async move {
			while *in_flight_rx.borrow_and_update() > 0 {
				if in_flight_rx.changed().await.is_err() {
					break;
				}
			}
		};
		match tokio::time::timeout(timeout, drained).await {
			Ok(()) => Ok(()),
			Err(_) => {
				warn!(timeout_ms=%timeout.as_millis(), "worker pool drain timed out, aborting workers");
				self.abort_all_workers();
				Err(PipelineError::ShutdownTimeout(timeout.as_millis() as u64))
			},
		}
	}

	/// Aborts every in-flight worker and force-shuts the semaphores, so
	/// pending acquires fail and active counts drop to zero.
	pub fn abort_all_workers(&self) {
		debug!("abort-all-workers");
		self.inner.shutdown.store(true, Ordering::SeqCst);
		self.inner.kill_switch.kill();
		self.inner.global_semaphore.force_shutdown();
		for semaphore in self.inner.stage_semaphores.lock().unwrap().values() {
			semaphore.force_shutdown();
		}
	}

	/// Best-effort release of everything the pool still holds.
	/// Idempotent.
	pub fn cleanup(&self) {
		self.inner.shutdown.store(true, Ordering::SeqCst);
		self.inner.global_semaphore.force_shutdown();
		let mut stage_semaphores = self.inner.stage_semaphores.lock().unwrap();
		for semaphore in stage_semaphores.values() {
			semaphore.force_shutdown();
		}
		stage_semaphores.clear();
	}
}
