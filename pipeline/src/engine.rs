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
	collections::{HashMap, HashSet},
	sync::Arc,
	time::{Duration, Instant},
};

use async_trait::async_trait;
use common::{metrics::GaugeGuard, new_quid, KillSwitch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
	config::{EffectiveOptions, PipelineOptions, StageConfig, StageId, DEFAULT_MAX_RETRIES},
	engine_state::{AtomicEngineState, EngineState},
	error::PipelineError,
	metrics::PIPELINE_METRICS,
	monitor::{
		unix_timestamp_ms, EventBroker, EventContext, EventSubscriptionHandle, PipelineEvent,
		PipelineEventKind,
	},
	policy::{ErrorAction, ErrorContext, PipelineState},
	worker_pool::WorkerPool,
};

/// The entry point of a pipeline execution: the stage to start from and
/// the value handed to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
	pub current_stage: StageId,
	pub value: Value,
}

impl StageInput {
	pub fn new(current_stage: impl ToString, value: Value) -> StageInput {
		StageInput { current_stage: current_stage.to_string(), value }
	}
}

/// Hooks awaited at the milestones of a graceful shutdown.
#[async_trait]
pub trait ShutdownObserver: Send + Sync + 'static {
	async fn on_shutdown_start(&self) {}

	async fn on_shutdown_complete(&self) {}

	async fn on_timeout(&self) {}
}

pub struct ShutdownOptions {
	pub timeout: Duration,
	pub observer: Option<Arc<dyn ShutdownObserver>>,
}

impl Default for ShutdownOptions {
	fn default() -> Self {
		ShutdownOptions { timeout: *crate::DEFAULT_SHUTDOWN_TIMEOUT, observer: None }
	}
}

impl ShutdownOptions {
	pub fn with_timeout(timeout: Duration) -> ShutdownOptions {
		ShutdownOptions { timeout, observer: None }
	}

	pub fn observer(mut self, observer: Arc<dyn ShutdownObserver>) -> ShutdownOptions {
		self.observer = Some(observer);
		self
	}
}

/// Assembles a [`Pipeline`] from an ordered stage list and
/// pipeline-wide options.
#[derive(Default)]
pub struct PipelineBuilder {
	stages: Vec<StageConfig>,
	options: PipelineOptions,
}

impl PipelineBuilder {
	pub fn new() -> PipelineBuilder {
		PipelineBuilder::default()
	}

	pub fn stage(mut self, stage: StageConfig) -> PipelineBuilder {
		self.stages.push(stage);
		self
	}

	pub fn options(mut self, options: PipelineOptions) -> PipelineBuilder {
		self.options = options;
		self
	}

	pub fn build(self) -> Result<Pipeline, PipelineError> {
		let mut stage_indices: HashMap<StageId, usize> = HashMap::new();
		for (stage_index, stage) in self.stages.iter().enumerate() {
			if stage.name.is_empty() {
				return Err(PipelineError::InvalidConfig(
					"stage names must not be empty".to_string(),
				));
			}
			if stage_indices.insert(stage.name.clone(), stage_index).is_some() {
				return Err(PipelineError::InvalidConfig(format!(
					"duplicate stage name `{}`",
					stage.name
				)));
			}
			if stage.options.as_ref().and_then(|options| options.max_concurrency) == Some(0) {
				return Err(PipelineError::InvalidConfig(format!(
					"stage `{}`: max concurrency must be greater than zero",
					stage.name
				)));
			}
		}
		if self.options.max_concurrency == Some(0) {
			return Err(PipelineError::InvalidConfig(
				"max concurrency must be greater than zero".to_string(),
			));
		}
		let kill_switch = KillSwitch::default();
		let pool = WorkerPool::new(self.options.max_concurrency, kill_switch.child())?;
		let (state_tx, _state_rx) = watch::channel(EngineState::Running);
		let (active_executions_tx, _active_executions_rx) = watch::channel(0);
		let pipeline_id = new_quid("pipeline");
		info!(pipeline_id=%pipeline_id, num_stages=%self.stages.len(), "pipeline-created");
		Ok(Pipeline {
			inner: Arc::new(InnerPipeline {
				pipeline_id,
				stages: self.stages,
				stage_indices,
				options: self.options,
				pool,
				broker: EventBroker::default(),
				state: AtomicEngineState::default(),
				state_tx,
				active_executions_tx,
				kill_switch,
			}),
		})
	}
}

/// A staged data-processing pipeline engine.
///
/// Stages run strictly sequentially within one execution; concurrent
/// executions share the worker pool and its admission semaphores. The
/// engine is lightweight to clone: clones share the same state,
/// listeners and pool.
#[derive(Clone)]
pub struct Pipeline {
	inner: Arc<InnerPipeline>,
}

struct InnerPipeline {
	pipeline_id: String,
	stages: Vec<StageConfig>,
	stage_indices: HashMap<StageId, usize>,
	options: PipelineOptions,
	pool: WorkerPool,
	broker: EventBroker,
	state: AtomicEngineState,
	state_tx: watch::Sender<EngineState>,
	// Mirrors the number of in-flight executions so shutdown can await
	// the drain.
	active_executions_tx: watch::Sender<usize>,
	kill_switch: KillSwitch,
}

impl Drop for InnerPipeline {
	fn drop(&mut self) {
		self.kill_switch.kill();
	}
}

struct ExecutionGuard {
	inner: Arc<InnerPipeline>,
	_active_executions_gauge_guard: GaugeGuard,
}

impl ExecutionGuard {
	fn new(inner: Arc<InnerPipeline>) -> ExecutionGuard {
		inner.active_executions_tx.send_modify(|active| *active += 1);
		ExecutionGuard {
			inner,
			_active_executions_gauge_guard: GaugeGuard::from_gauge(
				&PIPELINE_METRICS.active_executions,
			),
		}
	}
}

impl Drop for ExecutionGuard {
	fn drop(&mut self) {
		self.inner
			.active_executions_tx
			.send_modify(|active| *active = active.saturating_sub(1));
	}
}

/// Where and how an execution frame died. The orchestrator turns this
/// into the terminal `Error` event before surfacing the error.
struct FrameFailure {
	stage: Option<StageId>,
	value: Value,
	retry_count: usize,
	error: PipelineError,
}

impl Pipeline {
	pub fn builder() -> PipelineBuilder {
		PipelineBuilder::new()
	}

	pub fn pipeline_id(&self) -> &str {
		&self.inner.pipeline_id
	}

	pub fn stage_names(&self) -> Vec<StageId> {
		self.inner.stages.iter().map(|stage| stage.name.clone()).collect()
	}

	/// Registers a listener for all engine and per-stage events.
	#[must_use]
	pub fn on_event(
		&self,
		listener: impl Fn(&PipelineEvent) + Send + Sync + 'static,
	) -> EventSubscriptionHandle {
		self.inner.broker.subscribe(listener)
	}

	pub fn get_state(&self) -> EngineState {
		self.inner.state.get_state()
	}

	pub fn is_shutting_down(&self) -> bool {
		self.get_state().is_shutting_down()
	}

	pub fn is_shutdown(&self) -> bool {
		self.get_state().is_shutdown()
	}

	pub fn get_active_executions(&self) -> usize {
		*self.inner.active_executions_tx.borrow()
	}

	pub fn get_active_workers(&self, stage_opt: Option<&StageId>) -> usize {
		self.inner.pool.active_workers(stage_opt)
	}

	/// Runs one value through the pipeline, starting at
	/// `input.current_stage` and walking the stage list sequentially.
	///
	/// The call resolves with the last stage's output or fails with
	/// exactly one error, after a terminal `Error` event has been
	/// emitted to the listeners.
	pub async fn process(&self, input: StageInput) -> Result<Value, PipelineError> {
		let state = self.inner.state.get_state();
		if !state.is_running() {
			let error = PipelineError::EngineState(state);
			self.emit_engine_event(
				PipelineEventKind::Error,
				Value::String(error.to_string()),
			);
			return Err(error);
		}
		let execution_id = new_quid("exec");
		let _execution_guard = ExecutionGuard::new(self.inner.clone());
		debug!(
			pipeline_id=%self.inner.pipeline_id,
			execution_id=%execution_id,
			stage=%input.current_stage,
			"execution-start"
		);
		match self.run_frame(input, &execution_id).await {
			Ok(value) => Ok(value),
			Err(frame_failure) => {
				let FrameFailure { stage, value, retry_count, error } = frame_failure;
				error!(
					pipeline_id=%self.inner.pipeline_id,
					execution_id=%execution_id,
					stage=?stage,
					error=%error,
					"execution-failed"
				);
				let cancelled_by_shutdown = self.is_shutting_down() &&
					matches!(
						error,
						PipelineError::WorkerAbort |
							PipelineError::PoolShutdown |
							PipelineError::SemaphoreShutdown
					);
				let kind = if cancelled_by_shutdown {
					PipelineEventKind::ExecutionCancelled
				} else {
					PipelineEventKind::Error
				};
				self.inner.broker.emit(PipelineEvent {
					kind,
					timestamp: unix_timestamp_ms(),
					duration: 0,
					stage: stage.clone(),
					data: json!({
						"error": error.to_string(),
						"value": value,
						"retry_count": retry_count,
						"pipeline_state": {
							"current_stage": stage,
							"stages": self.stage_names(),
						},
					}),
					context: EventContext {
						pipeline_id: self.inner.pipeline_id.clone(),
						execution_id,
						attempt: retry_count + 1,
					},
				});
				Err(error)
			},
		}
	}

	/// Runs a batch of inputs, one execution frame per element, bounded
	/// by the worker pool's admission semaphores.
	///
	/// Results are per-element and order-preserving: one element's
	/// failure never cancels its siblings.
	pub async fn process_batch(
		&self,
		inputs: Vec<StageInput>,
	) -> Vec<Result<Value, PipelineError>> {
		futures::future::join_all(inputs.into_iter().map(|input| self.process(input))).await
	}

	async fn run_frame(
		&self,
		input: StageInput,
		execution_id: &str,
	) -> Result<Value, FrameFailure> {
		let inner = &self.inner;
		let mut value = input.value;
		let mut current_stage_opt = Some(input.current_stage);
		let mut visited_stages: HashSet<StageId> = HashSet::new();
		let mut retry_count = 0usize;

		while let Some(current_stage) = current_stage_opt.take() {
			let Some(&stage_index) = inner.stage_indices.get(&current_stage) else {
				return Err(FrameFailure {
					stage: Some(current_stage.clone()),
					value,
					retry_count,
					error: PipelineError::StageNotFound(current_stage),
				});
			};
			let stage = &inner.stages[stage_index];
			visited_stages.insert(stage.name.clone());
			let effective_options =
				EffectiveOptions::resolve(&inner.options, stage.options.as_ref());
			let event_context = EventContext {
				pipeline_id: inner.pipeline_id.clone(),
				execution_id: execution_id.to_string(),
				attempt: retry_count + 1,
			};
			let invocation = inner.pool.run_worker(
				&stage.handler,
				value.clone(),
				&effective_options,
				&stage.name,
			);
			match inner.broker.track_stage(&stage.name, event_context, invocation).await {
				Ok(output) => {
					value = output;
					retry_count = 0;
					current_stage_opt =
						inner.stages.get(stage_index + 1).map(|next| next.name.clone());
				},
				Err(invocation_error) => {
					let Some(error_policy) = stage.error_policy.clone() else {
						return Err(FrameFailure {
							stage: Some(stage.name.clone()),
							value,
							retry_count,
							error: invocation_error,
						});
					};
					let error_ctx = ErrorContext {
						stage: stage.name.clone(),
						value: value.clone(),
						error: invocation_error.to_string(),
						retry_count,
						pipeline_state: PipelineState {
							current_stage: stage.name.clone(),
							stages: self.stage_names(),
						},
					};
					let mut action = error_policy.on_error(&invocation_error, &error_ctx).await;
					// A resolver gets one shot at producing a concrete
					// action; a nested `Custom` degrades to `Stop`.
					let terminal_error_opt = loop {
						match action {
							ErrorAction::Retry { max_retries } => {
								let retry_budget = max_retries
									.or_else(|| effective_options.max_retries())
									.unwrap_or(DEFAULT_MAX_RETRIES);
								if retry_count >= retry_budget {
									warn!(
										stage=%stage.name,
										retry_count=%retry_count,
										"retry budget exhausted"
									);
									break Some(invocation_error);
								}
								error_policy.on_retry(&error_ctx).await;
								retry_count += 1;
								current_stage_opt = Some(stage.name.clone());
								break None;
							},
							ErrorAction::Continue { next_stage } => {
								if visited_stages.contains(&next_stage) {
									break Some(PipelineError::InfiniteLoop(next_stage));
								}
								error_policy.on_continue(&error_ctx).await;
								retry_count = 0;
								current_stage_opt = Some(next_stage);
								break None;
							},
							ErrorAction::Stop => {
								error_policy.on_stop(&error_ctx).await;
								break Some(invocation_error);
							},
							ErrorAction::Custom(resolver) => {
								let resolved =
									resolver.resolve(&invocation_error, &error_ctx).await;
								action = match resolved {
									ErrorAction::Custom(_) => ErrorAction::Stop,
									concrete_action => concrete_action,
								};
							},
						}
					};
					if let Some(terminal_error) = terminal_error_opt {
						return Err(FrameFailure {
							stage: Some(stage.name.clone()),
							value,
							retry_count,
							error: terminal_error,
						});
					}
				},
			}
		}
		Ok(value)
	}

	/// Gracefully shuts the engine down with the default deadline.
	pub async fn shutdown(&self) -> Result<(), PipelineError> {
		self.shutdown_with(ShutdownOptions::default()).await
	}

	/// Gracefully shuts the engine down: Running → Draining → Shutdown.
	///
	/// New executions are rejected as soon as the call starts; in-flight
	/// ones get `options.timeout` to drain, after which every worker is
	/// force-aborted. The call itself resolves either way, once the
	/// engine has reached `Shutdown`; the outcome is reported through
	/// the event stream (`ShutdownComplete`, `ShutdownTimeout` or
	/// `ShutdownError`) and the observer hooks. Idempotent: concurrent
	/// and repeated calls await the same transition.
	pub async fn shutdown_with(&self, options: ShutdownOptions) -> Result<(), PipelineError> {
		match self.inner.state.begin_drain() {
			EngineState::Shutdown => return Ok(()),
			EngineState::Draining => {
				// Another shutdown is in flight: await its completion.
				let mut state_rx = self.inner.state_tx.subscribe();
				while !state_rx.borrow_and_update().is_shutdown() {
					if state_rx.changed().await.is_err() {
						break;
					}
				}
				return Ok(());
			},
			EngineState::Running => {},
		}
		let _ = self.inner.state_tx.send(EngineState::Draining);
		info!(
			pipeline_id=%self.inner.pipeline_id,
			timeout_ms=%options.timeout.as_millis(),
			"shutdown-start"
		);
		self.emit_engine_event(PipelineEventKind::ShutdownStart, Value::Null);
		if let Some(observer) = &options.observer {
			observer.on_shutdown_start().await;
		}
		let shutdown_started_at = Instant::now();
		let pool = self.inner.pool.clone();
		let mut active_executions_rx = self.inner.active_executions_tx.subscribe();
		let drain_deadline = options.timeout;
		let drained = async move {
			while *active_executions_rx.borrow_and_update() > 0 {
				if active_executions_rx.changed().await.is_err() {
					break;
				}
			}
			let remaining_budget = drain_deadline.saturating_sub(shutdown_started_at.elapsed());
			pool.shutdown(remaining_budget).await
		};
		match tokio::time::timeout(options.timeout, drained).await {
			Ok(Ok(())) => {
				self.complete_shutdown();
				info!(pipeline_id=%self.inner.pipeline_id, "shutdown-complete");
				self.emit_engine_event(PipelineEventKind::ShutdownComplete, Value::Null);
				if let Some(observer) = &options.observer {
					observer.on_shutdown_complete().await;
				}
			},
			Ok(Err(pool_error)) => {
				warn!(pipeline_id=%self.inner.pipeline_id, error=%pool_error, "shutdown-error");
				let kind = if matches!(pool_error, PipelineError::ShutdownTimeout(_)) {
					PipelineEventKind::ShutdownTimeout
				} else {
					PipelineEventKind::ShutdownError
				};
				self.emit_engine_event(kind, Value::String(pool_error.to_string()));
				self.inner.pool.abort_all_workers();
				self.emit_engine_event(PipelineEventKind::WorkerAborted, Value::Null);
				if let Some(observer) = &options.observer {
					observer.on_timeout().await;
				}
				self.complete_shutdown();
			},
			Err(_elapsed) => {
				warn!(
					pipeline_id=%self.inner.pipeline_id,
					timeout_ms=%options.timeout.as_millis(),
					"shutdown-timeout"
				);
				self.emit_engine_event(
					PipelineEventKind::ShutdownTimeout,
					Value::String(format!(
						"shutdown timed out after {}ms",
						options.timeout.as_millis()
					)),
				);
				self.inner.pool.abort_all_workers();
				self.emit_engine_event(PipelineEventKind::WorkerAborted, Value::Null);
				if let Some(observer) = &options.observer {
					observer.on_timeout().await;
				}
				self.complete_shutdown();
			},
		}
		Ok(())
	}

	fn complete_shutdown(&self) {
		self.inner.state.complete_shutdown();
		let _ = self.inner.state_tx.send(EngineState::Shutdown);
	}

	/// Releases pool resources and drops the listeners. The engine is
	/// unusable afterwards.
	pub fn cleanup(&self) {
		debug!(pipeline_id=%self.inner.pipeline_id, "cleanup");
		self.inner.state.complete_shutdown();
		let _ = self.inner.state_tx.send(EngineState::Shutdown);
		self.inner.pool.cleanup();
		self.inner.broker.clear();
	}

	fn emit_engine_event(&self, kind: PipelineEventKind, data: Value) {
		self.inner.broker.emit(PipelineEvent {
			kind,
			timestamp: unix_timestamp_ms(),
			duration: 0,
			stage: None,
			data,
			context: EventContext {
				pipeline_id: self.inner.pipeline_id.clone(),
				execution_id: self.inner.pipeline_id.clone(),
				attempt: 1,
			},
		});
	}
}

#[cfg(test)]
mod tests {
	use crate::handler::StageHandlerKind;

	use super::*;

	fn passthrough_stage(name: &str) -> StageConfig {
		StageConfig::new(name, StageHandlerKind::inline(|value: Value| async move { Ok(value) }))
	}

	#[test]
	fn test_builder_rejects_duplicate_stage_names() {
		let build_result = Pipeline::builder()
			.stage(passthrough_stage("dedup"))
			.stage(passthrough_stage("dedup"))
			.build();
		assert!(matches!(build_result, Err(PipelineError::InvalidConfig(_))));
	}

	#[test]
	fn test_builder_rejects_empty_stage_names() {
		let build_result = Pipeline::builder().stage(passthrough_stage("")).build();
		assert!(matches!(build_result, Err(PipelineError::InvalidConfig(_))));
	}

	#[test]
	fn test_builder_rejects_a_zero_concurrency_cap() {
		let build_result = Pipeline::builder()
			.stage(passthrough_stage("only"))
			.options(PipelineOptions { max_concurrency: Some(0), ..Default::default() })
			.build();
		assert!(matches!(build_result, Err(PipelineError::InvalidConfig(_))));
	}

	#[tokio::test]
	async fn test_process_rejects_an_unknown_starting_stage() {
		let pipeline = Pipeline::builder().stage(passthrough_stage("known")).build().unwrap();
		let process_error = pipeline
			.process(StageInput::new("unknown", Value::Null))
			.await
			.unwrap_err();
		assert!(
			matches!(process_error, PipelineError::StageNotFound(stage) if stage == "unknown")
		);
	}

	#[tokio::test]
	async fn test_process_fails_after_shutdown_with_a_state_error() {
		let pipeline = Pipeline::builder().stage(passthrough_stage("only")).build().unwrap();
		pipeline.shutdown_with(ShutdownOptions::with_timeout(Duration::from_millis(100)))
			.await
			.unwrap();
		assert!(pipeline.is_shutdown());
		let process_error = pipeline
			.process(StageInput::new("only", Value::Null))
			.await
			.unwrap_err();
		assert!(matches!(
			process_error,
			PipelineError::EngineState(EngineState::Shutdown)
		));
	}

	#[tokio::test]
	async fn test_shutdown_is_idempotent() {
		let pipeline = Pipeline::builder().stage(passthrough_stage("only")).build().unwrap();
		pipeline.shutdown_with(ShutdownOptions::with_timeout(Duration::from_millis(100)))
			.await
			.unwrap();
		pipeline.shutdown_with(ShutdownOptions::with_timeout(Duration::from_millis(100)))
			.await
			.unwrap();
		assert!(pipeline.is_shutdown());
	}

	#[tokio::test]
	async fn test_cleanup_drops_listeners() {
		let pipeline = Pipeline::builder().stage(passthrough_stage("only")).build().unwrap();
		let subscription = pipeline.on_event(|_event| {});
		pipeline.cleanup();
		assert!(pipeline.is_shutdown());
		assert_eq!(pipeline.get_active_workers(None), 0);
		subscription.forever();
	}
}
