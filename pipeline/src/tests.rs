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
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::{Duration, Instant},
};

use serde_json::{json, Value};

use crate::{
	policy_fn, resolver_fn, ErrorAction, Pipeline, PipelineError, PipelineEvent,
	PipelineEventKind, PipelineOptions, RetryOptions, ShutdownOptions, StageConfig,
	StageHandlerKind, StageInput, StageOptions,
};

fn arithmetic_pipeline() -> Pipeline {
	Pipeline::builder()
		.stage(StageConfig::new(
			"increment",
			StageHandlerKind::inline(|value: Value| async move {
				Ok(json!(value.as_i64().unwrap() + 1))
			}),
		))
		.stage(StageConfig::new(
			"double",
			StageHandlerKind::inline(|value: Value| async move {
				Ok(json!(value.as_i64().unwrap() * 2))
			}),
		))
		.stage(StageConfig::new(
			"add_ten",
			StageHandlerKind::inline(|value: Value| async move {
				Ok(json!(value.as_i64().unwrap() + 10))
			}),
		))
		.build()
		.unwrap()
}

fn failing_stage(name: &str) -> StageConfig {
	StageConfig::new(
		name,
		StageHandlerKind::inline(|_value: Value| async move {
			Err(anyhow::anyhow!("stage failure"))
		}),
	)
}

fn record_events(pipeline: &Pipeline) -> Arc<Mutex<Vec<PipelineEvent>>> {
	let events = Arc::new(Mutex::new(Vec::new()));
	let events_clone = events.clone();
	pipeline
		.on_event(move |event| events_clone.lock().unwrap().push(event.clone()))
		.forever();
	events
}

fn count_events(events: &Mutex<Vec<PipelineEvent>>, kind: PipelineEventKind) -> usize {
	events.lock().unwrap().iter().filter(|event| event.kind == kind).count()
}

#[tokio::test]
async fn test_pipeline_runs_all_stages_sequentially() {
	let pipeline = arithmetic_pipeline();
	let events = record_events(&pipeline);
	let result = pipeline.process(StageInput::new("increment", json!(1))).await.unwrap();
	// (1 + 1) * 2 + 10
	assert_eq!(result, json!(14));
	assert_eq!(count_events(&events, PipelineEventKind::StepEnd), 3);
	assert_eq!(count_events(&events, PipelineEventKind::StepError), 0);
	assert_eq!(count_events(&events, PipelineEventKind::Error), 0);
}

#[tokio::test]
async fn test_pipeline_starts_at_the_requested_stage() {
	let pipeline = arithmetic_pipeline();
	let result = pipeline.process(StageInput::new("double", json!(5))).await.unwrap();
	// 5 * 2 + 10
	assert_eq!(result, json!(20));
}

#[tokio::test]
async fn test_continue_policy_jumps_to_another_stage() {
	let pipeline = Pipeline::builder()
		.stage(
			failing_stage("error_step")
				.with_error_policy(policy_fn(|_error, _ctx| ErrorAction::continue_at("double"))),
		)
		.stage(StageConfig::new(
			"double",
			StageHandlerKind::inline(|value: Value| async move {
				Ok(json!(value.as_i64().unwrap() * 2))
			}),
		))
		.build()
		.unwrap();
	let result = pipeline.process(StageInput::new("error_step", json!(5))).await.unwrap();
	assert_eq!(result, json!(10));
}

#[tokio::test]
async fn test_retry_policy_reruns_the_stage() {
	let invocations = Arc::new(AtomicUsize::new(0));
	let invocations_clone = invocations.clone();
	let pipeline = Pipeline::builder()
		.stage(
			StageConfig::new(
				"flaky",
				StageHandlerKind::inline(move |value: Value| {
					let invocations = invocations_clone.clone();
					async move {
						if invocations.fetch_add(1, Ordering::SeqCst) == 0 {
							return Err(anyhow::anyhow!("transient failure"));
						}
						Ok(value)
					}
				}),
			)
			.with_error_policy(policy_fn(|_error, _ctx| ErrorAction::Retry {
				max_retries: Some(1),
			})),
		)
		.build()
		.unwrap();
	let result = pipeline.process(StageInput::new("flaky", json!(1))).await.unwrap();
	assert_eq!(result, json!(1));
	assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_policy_propagates_the_error_once_exhausted() {
	let invocations = Arc::new(AtomicUsize::new(0));
	let invocations_clone = invocations.clone();
	let pipeline = Pipeline::builder()
		.stage(
			StageConfig::new(
				"hopeless",
				StageHandlerKind::inline(move |_value: Value| {
					let invocations = invocations_clone.clone();
					async move {
						invocations.fetch_add(1, Ordering::SeqCst);
						Err(anyhow::anyhow!("permanent failure"))
					}
				}),
			)
			.with_error_policy(policy_fn(|_error, _ctx| ErrorAction::Retry {
				max_retries: Some(2),
			})),
		)
		.build()
		.unwrap();
	let error =
		pipeline.process(StageInput::new("hopeless", Value::Null)).await.unwrap_err();
	assert_eq!(error.to_string(), "permanent failure");
	// One initial attempt plus two retries.
	assert_eq!(invocations.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_continue_into_a_visited_stage_is_an_infinite_loop() {
	let invocations = Arc::new(AtomicUsize::new(0));
	let invocations_clone = invocations.clone();
	let pipeline = Pipeline::builder()
		.stage(
			StageConfig::new(
				"error_step",
				StageHandlerKind::inline(move |_value: Value| {
					let invocations = invocations_clone.clone();
					async move {
						invocations.fetch_add(1, Ordering::SeqCst);
						Err(anyhow::anyhow!("stage failure"))
					}
				}),
			)
			.with_error_policy(policy_fn(|_error, _ctx| {
				ErrorAction::continue_at("error_step")
			})),
		)
		.build()
		.unwrap();
	let error =
		pipeline.process(StageInput::new("error_step", json!(5))).await.unwrap_err();
	assert!(matches!(error, PipelineError::InfiniteLoop(_)));
	assert!(error.to_string().contains("Infinite loop"));
	// Loop detection fires before the target handler is re-invoked.
	assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_custom_resolver_decides_the_action() {
	let pipeline = Pipeline::builder()
		.stage(failing_stage("error_step").with_error_policy(policy_fn(|_error, _ctx| {
			ErrorAction::Custom(resolver_fn(|_error, _ctx| ErrorAction::continue_at("double")))
		})))
		.stage(StageConfig::new(
			"double",
			StageHandlerKind::inline(|value: Value| async move {
				Ok(json!(value.as_i64().unwrap() * 2))
			}),
		))
		.build()
		.unwrap();
	let result = pipeline.process(StageInput::new("error_step", json!(21))).await.unwrap();
	assert_eq!(result, json!(42));
}

#[tokio::test]
async fn test_nested_custom_resolvers_degrade_to_stop() {
	let pipeline = Pipeline::builder()
		.stage(failing_stage("error_step").with_error_policy(policy_fn(|_error, _ctx| {
			ErrorAction::Custom(resolver_fn(|_error, _ctx| {
				ErrorAction::Custom(resolver_fn(|_error, _ctx| ErrorAction::Stop))
			}))
		})))
		.build()
		.unwrap();
	let error =
		pipeline.process(StageInput::new("error_step", Value::Null)).await.unwrap_err();
	assert_eq!(error.to_string(), "stage failure");
}

#[tokio::test]
async fn test_policy_hooks_are_invoked_before_the_action_is_applied() {
	struct RecordingPolicy {
		hook_calls: Arc<Mutex<Vec<&'static str>>>,
	}

	#[async_trait::async_trait]
	impl crate::ErrorPolicy for RecordingPolicy {
		async fn on_error(
			&self,
			_error: &PipelineError,
			ctx: &crate::ErrorContext,
		) -> ErrorAction {
			if ctx.retry_count == 0 {
				ErrorAction::retry()
			} else {
				ErrorAction::Stop
			}
		}

		async fn on_retry(&self, _ctx: &crate::ErrorContext) {
			self.hook_calls.lock().unwrap().push("on_retry");
		}

		async fn on_stop(&self, _ctx: &crate::ErrorContext) {
			self.hook_calls.lock().unwrap().push("on_stop");
		}
	}

	let hook_calls = Arc::new(Mutex::new(Vec::new()));
	let pipeline = Pipeline::builder()
		.stage(
			failing_stage("error_step")
				.with_error_policy(Arc::new(RecordingPolicy { hook_calls: hook_calls.clone() })),
		)
		.build()
		.unwrap();
	let error =
		pipeline.process(StageInput::new("error_step", Value::Null)).await.unwrap_err();
	assert_eq!(error.to_string(), "stage failure");
	assert_eq!(*hook_calls.lock().unwrap(), vec!["on_retry", "on_stop"]);
}

#[tokio::test]
async fn test_global_concurrency_cap_bounds_a_batch() {
	let sleep_ms = 100u64;
	let running = Arc::new(AtomicUsize::new(0));
	let observed_max = Arc::new(AtomicUsize::new(0));
	let running_clone = running.clone();
	let observed_max_clone = observed_max.clone();
	let pipeline = Pipeline::builder()
		.stage(StageConfig::new(
			"sleepy",
			StageHandlerKind::inline(move |value: Value| {
				let running = running_clone.clone();
				let observed_max = observed_max_clone.clone();
				async move {
					let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
					observed_max.fetch_max(now_running, Ordering::SeqCst);
					let jitter_ms = rand::random::<u64>() % 10;
					tokio::time::sleep(Duration::from_millis(sleep_ms + jitter_ms)).await;
					running.fetch_sub(1, Ordering::SeqCst);
					Ok(value)
				}
			}),
		))
		.options(PipelineOptions { max_concurrency: Some(2), ..Default::default() })
		.build()
		.unwrap();
	let inputs = (0..5)
		.map(|item| StageInput::new("sleepy", json!(item)))
		.collect::<Vec<_>>();
	let start = Instant::now();
	let results = pipeline.process_batch(inputs).await;
	let elapsed = start.elapsed();
	assert!(results.iter().all(Result::is_ok));
	assert_eq!(observed_max.load(Ordering::SeqCst), 2);
	// Five items at a cap of two need at least three rounds.
	assert!(elapsed >= Duration::from_millis(3 * sleep_ms), "elapsed: {elapsed:?}");
	assert!(elapsed < Duration::from_millis(20 * sleep_ms), "elapsed: {elapsed:?}");
}

#[tokio::test]
async fn test_batch_failures_surface_per_element() {
	let pipeline = Pipeline::builder()
		.stage(StageConfig::new(
			"check_positive",
			StageHandlerKind::inline(|value: Value| async move {
				if value.as_i64().unwrap() < 0 {
					anyhow::bail!("negative input");
				}
				Ok(value)
			}),
		))
		.build()
		.unwrap();
	let results = pipeline
		.process_batch(vec![
			StageInput::new("check_positive", json!(1)),
			StageInput::new("check_positive", json!(-2)),
			StageInput::new("check_positive", json!(3)),
		])
		.await;
	assert_eq!(results.len(), 3);
	assert_eq!(results[0].as_ref().unwrap(), &json!(1));
	assert!(results[1].is_err());
	assert_eq!(results[2].as_ref().unwrap(), &json!(3));
}

#[tokio::test]
async fn test_worker_timeout_preempts_a_slow_handler() {
	let pipeline = Pipeline::builder()
		.stage(
			StageConfig::new(
				"slow",
				StageHandlerKind::inline(|value: Value| async move {
					tokio::time::sleep(Duration::from_secs(5)).await;
					Ok(value)
				}),
			)
			.with_options(StageOptions {
				worker_timeout_ms: Some(100),
				..Default::default()
			}),
		)
		.build()
		.unwrap();
	let events = record_events(&pipeline);
	let start = Instant::now();
	let error = pipeline.process(StageInput::new("slow", Value::Null)).await.unwrap_err();
	let elapsed = start.elapsed();
	assert!(matches!(error, PipelineError::WorkerTimeout { timeout_ms: 100, .. }));
	assert!(elapsed < Duration::from_millis(500), "elapsed: {elapsed:?}");
	assert_eq!(count_events(&events, PipelineEventKind::StepError), 1);
	assert_eq!(count_events(&events, PipelineEventKind::StepEnd), 0);
	assert_eq!(count_events(&events, PipelineEventKind::Error), 1);
}

#[tokio::test]
async fn test_worker_level_retry_pays_the_backoff() {
	let backoff_ms = 50u64;
	let pipeline = Pipeline::builder()
		.stage(
			failing_stage("hopeless").with_options(StageOptions {
				retry: Some(RetryOptions { max_retries: 2, backoff_ms }),
				..Default::default()
			}),
		)
		.build()
		.unwrap();
	let start = Instant::now();
	let error =
		pipeline.process(StageInput::new("hopeless", Value::Null)).await.unwrap_err();
	let elapsed = start.elapsed();
	assert_eq!(error.to_string(), "stage failure");
	// Two backoff sleeps: backoff_ms * 2^0 + backoff_ms * 2^1.
	assert!(elapsed >= Duration::from_millis(3 * backoff_ms), "elapsed: {elapsed:?}");
}

#[tokio::test]
async fn test_shutdown_with_a_hung_worker_times_out_and_aborts() {
	let pipeline = Pipeline::builder()
		.stage(StageConfig::new(
			"hang",
			StageHandlerKind::inline(|value: Value| async move {
				tokio::time::sleep(Duration::from_secs(60)).await;
				Ok(value)
			}),
		))
		.build()
		.unwrap();
	let events = record_events(&pipeline);
	let pipeline_clone = pipeline.clone();
	let hung_execution = tokio::spawn(async move {
		pipeline_clone.process(StageInput::new("hang", Value::Null)).await
	});
	while pipeline.get_active_executions() == 0 {
		tokio::task::yield_now().await;
	}
	let start = Instant::now();
	pipeline
		.shutdown_with(ShutdownOptions::with_timeout(Duration::from_millis(200)))
		.await
		.unwrap();
	let elapsed = start.elapsed();
	assert!(elapsed < Duration::from_millis(1_500), "elapsed: {elapsed:?}");
	assert!(pipeline.is_shutdown());
	assert_eq!(count_events(&events, PipelineEventKind::ShutdownStart), 1);
	assert_eq!(count_events(&events, PipelineEventKind::ShutdownTimeout), 1);
	assert_eq!(pipeline.get_active_workers(None), 0);
	assert!(hung_execution.await.unwrap().is_err());
}

#[tokio::test]
async fn test_graceful_shutdown_lets_executions_drain() {
	let pipeline = Pipeline::builder()
		.stage(StageConfig::new(
			"brief",
			StageHandlerKind::inline(|value: Value| async move {
				tokio::time::sleep(Duration::from_millis(50)).await;
				Ok(value)
			}),
		))
		.build()
		.unwrap();
	let events = record_events(&pipeline);
	let pipeline_clone = pipeline.clone();
	let execution = tokio::spawn(async move {
		pipeline_clone.process(StageInput::new("brief", json!("payload"))).await
	});
	while pipeline.get_active_executions() == 0 {
		tokio::task::yield_now().await;
	}
	pipeline
		.shutdown_with(ShutdownOptions::with_timeout(Duration::from_secs(5)))
		.await
		.unwrap();
	assert_eq!(execution.await.unwrap().unwrap(), json!("payload"));
	assert_eq!(count_events(&events, PipelineEventKind::ShutdownComplete), 1);
	assert_eq!(count_events(&events, PipelineEventKind::ShutdownTimeout), 0);
	assert_eq!(pipeline.get_active_executions(), 0);
}

#[tokio::test]
async fn test_shutdown_observer_hooks_are_awaited() {
	struct RecordingObserver {
		hook_calls: Arc<Mutex<Vec<&'static str>>>,
	}

	#[async_trait::async_trait]
	impl crate::ShutdownObserver for RecordingObserver {
		async fn on_shutdown_start(&self) {
			self.hook_calls.lock().unwrap().push("start");
		}

		async fn on_shutdown_complete(&self) {
			self.hook_calls.lock().unwrap().push("complete");
		}

		async fn on_timeout(&self) {
			self.hook_calls.lock().unwrap().push("timeout");
		}
	}

	let pipeline = Pipeline::builder()
		.stage(StageConfig::new(
			"noop",
			StageHandlerKind::inline(|value: Value| async move { Ok(value) }),
		))
		.build()
		.unwrap();
	let hook_calls = Arc::new(Mutex::new(Vec::new()));
	let observer = Arc::new(RecordingObserver { hook_calls: hook_calls.clone() });
	pipeline
		.shutdown_with(
			ShutdownOptions::with_timeout(Duration::from_millis(500)).observer(observer),
		)
		.await
		.unwrap();
	assert_eq!(*hook_calls.lock().unwrap(), vec!["start", "complete"]);
}

#[cfg(unix)]
mod artefact {
	use std::path::PathBuf;

	use super::*;

	fn write_artefact_script(body: &str) -> (tempfile::TempDir, PathBuf) {
		use std::os::unix::fs::PermissionsExt;

		let scratch_dir = tempfile::tempdir().unwrap();
		let script_path = scratch_dir.path().join("artefact.sh");
		std::fs::write(&script_path, body).unwrap();
		let mut permissions = std::fs::metadata(&script_path).unwrap().permissions();
		permissions.set_mode(0o755);
		std::fs::set_permissions(&script_path, permissions).unwrap();
		(scratch_dir, script_path)
	}

	#[tokio::test]
	async fn test_artefact_worker_round_trip() {
		let (_scratch_dir, script_path) =
			write_artefact_script("#!/bin/sh\nread input\necho '{\"processed\": true}'\n");
		let pipeline = Pipeline::builder()
			.stage(StageConfig::new("external", StageHandlerKind::artefact(&script_path)))
			.build()
			.unwrap();
		let result =
			pipeline.process(StageInput::new("external", json!({"raw": 1}))).await.unwrap();
		assert_eq!(result, json!({"processed": true}));
	}

	#[tokio::test]
	async fn test_artefact_error_envelope_becomes_a_handler_error() {
		let (_scratch_dir, script_path) = write_artefact_script(
			"#!/bin/sh\nread input\necho '{\"error\": \"artefact failure\"}'\n",
		);
		let pipeline = Pipeline::builder()
			.stage(StageConfig::new("external", StageHandlerKind::artefact(&script_path)))
			.build()
			.unwrap();
		let error =
			pipeline.process(StageInput::new("external", Value::Null)).await.unwrap_err();
		assert_eq!(error.to_string(), "artefact failure");
	}

	#[tokio::test]
	async fn test_artefact_non_zero_exit_is_a_worker_exit() {
		let (_scratch_dir, script_path) = write_artefact_script("#!/bin/sh\nexit 7\n");
		let pipeline = Pipeline::builder()
			.stage(StageConfig::new("external", StageHandlerKind::artefact(&script_path)))
			.build()
			.unwrap();
		let error =
			pipeline.process(StageInput::new("external", Value::Null)).await.unwrap_err();
		assert!(matches!(error, PipelineError::WorkerExit(7)));
	}

	#[tokio::test]
	async fn test_artefact_worker_times_out() {
		let (_scratch_dir, script_path) =
			write_artefact_script("#!/bin/sh\nread input\nsleep 60\n");
		let pipeline = Pipeline::builder()
			.stage(
				StageConfig::new("external", StageHandlerKind::artefact(&script_path))
					.with_options(StageOptions {
						worker_timeout_ms: Some(100),
						..Default::default()
					}),
			)
			.build()
			.unwrap();
		let start = Instant::now();
		let error =
			pipeline.process(StageInput::new("external", Value::Null)).await.unwrap_err();
		assert!(matches!(error, PipelineError::WorkerTimeout { .. }));
		assert!(start.elapsed() < Duration::from_millis(1_000));
	}
}
