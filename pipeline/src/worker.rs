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

use std::{path::Path, process::Stdio, sync::Arc, time::Duration};

use common::{worker_runtime_handle, KillSwitch};
use serde_json::Value;
use tokio::{
	io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
	process::Command,
};
use tracing::debug;

use crate::{
	config::StageId,
	error::PipelineError,
	handler::{StageHandler, StageHandlerKind},
};

/// How long to keep reading after the artefact exits, to drain a result
/// it wrote right before exiting.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Messages travelling from the orchestrator to an artefact worker.
enum WorkerCommand {
	Input(String),
	Abort,
}

/// Messages travelling back from an artefact worker.
enum WorkerMessage {
	Output(String),
	Eof,
	ReadFailed(String),
}

/// Runs a single handler invocation in isolation.
///
/// Inline handlers run as a task on the dedicated worker runtime;
/// artefact handlers run as a child process. Either way the invocation
/// is bounded by `worker_timeout` and cancellable through
/// `kill_switch`, and the unit is terminated once a terminal outcome is
/// known.
pub(crate) async fn run_isolated(
	handler: &StageHandlerKind,
	value: Value,
	worker_timeout: Option<Duration>,
	kill_switch: &KillSwitch,
	stage: &StageId,
) -> Result<Value, PipelineError> {
	match handler {
		StageHandlerKind::Inline(stage_handler) =>
			run_inline(stage_handler.clone(), value, worker_timeout, kill_switch, stage).await,
		StageHandlerKind::Artefact(path) =>
			run_artefact(path, value, worker_timeout, kill_switch, stage).await,
	}
}

async fn run_inline(
	stage_handler: Arc<dyn StageHandler>,
	value: Value,
	worker_timeout: Option<Duration>,
	kill_switch: &KillSwitch,
	stage: &StageId,
) -> Result<Value, PipelineError> {
	let mut join_handle =
		worker_runtime_handle().spawn(async move { stage_handler.run(value).await });
	tokio::select! {
		join_result = &mut join_handle => {
			match join_result {
				Ok(Ok(output)) => Ok(output),
				Ok(Err(handler_error)) => Err(PipelineError::from_handler_error(handler_error)),
				Err(join_error) if join_error.is_cancelled() => Err(PipelineError::WorkerAbort),
				Err(join_error) => Err(PipelineError::from_handler_error(anyhow::anyhow!(
					"stage handler panicked: {join_error}"
				))),
			}
		},
		_ = sleep_or_never(worker_timeout) => {
			join_handle.abort();
			Err(PipelineError::WorkerTimeout {
				stage: stage.clone(),
				timeout_ms: worker_timeout.unwrap_or_default().as_millis() as u64,
			})
		},
		_ = kill_switch.killed() => {
			join_handle.abort();
			Err(PipelineError::WorkerAbort)
		},
	}
}

async fn run_artefact(
	path: &Path,
	value: Value,
	worker_timeout: Option<Duration>,
	kill_switch: &KillSwitch,
	stage: &StageId,
) -> Result<Value, PipelineError> {
	let mut child = Command::new(path)
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.kill_on_drop(true)
		.spawn()
		.map_err(|spawn_error| {
			PipelineError::from_handler_error(anyhow::anyhow!(
				"failed to spawn artefact `{}`: {spawn_error}",
				path.display()
			))
		})?;
	let mut stdin = child.stdin.take().expect("stdin should be piped");
	let stdout = child.stdout.take().expect("stdout should be piped");

	// The writer task owns stdin, so a worker that stops reading its
	// input can never block the orchestrator.
	let (command_tx, command_rx) = flume::bounded::<WorkerCommand>(2);
	let writer_task = tokio::spawn(async move {
		while let Ok(command) = command_rx.recv_async().await {
			let line = match command {
				WorkerCommand::Input(line) => line,
				WorkerCommand::Abort => "abort\n".to_string(),
			};
			if stdin.write_all(line.as_bytes()).await.is_err() {
				break;
			}
			let _ = stdin.flush().await;
		}
	});
	let (message_tx, message_rx) = flume::bounded::<WorkerMessage>(1);
	let reader_task = tokio::spawn(async move {
		let mut lines = BufReader::new(stdout).lines();
		let message = match lines.next_line().await {
			Ok(Some(line)) => WorkerMessage::Output(line),
			Ok(None) => WorkerMessage::Eof,
			Err(read_error) => WorkerMessage::ReadFailed(read_error.to_string()),
		};
		let _ = message_tx.send_async(message).await;
	});

	let mut input_line = serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string());
	input_line.push('\n');
	let _ = command_tx.try_send(WorkerCommand::Input(input_line));

	let mut output_closed = false;
	// Pinned outside the loop: an EOF iteration must not restart the
	// timeout clock.
	let timeout_fut = sleep_or_never(worker_timeout);
	tokio::pin!(timeout_fut);
	let result = loop {
		tokio::select! {
			biased;
			message = message_rx.recv_async(), if !output_closed => {
				match message {
					Ok(WorkerMessage::Output(line)) => break parse_output_line(&line),
					Ok(WorkerMessage::ReadFailed(read_error)) =>
						break Err(PipelineError::from_handler_error(anyhow::anyhow!(
							"failed to read artefact output: {read_error}"
						))),
					Ok(WorkerMessage::Eof) | Err(_) => {
						output_closed = true;
					},
				}
			},
			exit_result = child.wait() => {
				if !output_closed {
					// The artefact may have written its result right
					// before exiting.
					if let Ok(Ok(WorkerMessage::Output(line))) =
						tokio::time::timeout(OUTPUT_DRAIN_GRACE, message_rx.recv_async()).await
					{
						break parse_output_line(&line);
					}
				}
				break match exit_result {
					Ok(exit_status) if exit_status.success() =>
						Err(PipelineError::from_handler_error(anyhow::anyhow!(
							"artefact `{}` exited without producing a result",
							path.display()
						))),
					Ok(exit_status) =>
						Err(PipelineError::WorkerExit(exit_status.code().unwrap_or(-1))),
					Err(wait_error) => Err(PipelineError::from_handler_error(anyhow::anyhow!(
						"failed to wait for artefact `{}`: {wait_error}",
						path.display()
					))),
				};
			},
			_ = &mut timeout_fut => {
				let _ = command_tx.try_send(WorkerCommand::Abort);
				let _ = child.start_kill();
				break Err(PipelineError::WorkerTimeout {
					stage: stage.clone(),
					timeout_ms: worker_timeout.unwrap_or_default().as_millis() as u64,
				});
			},
			_ = kill_switch.killed() => {
				let _ = command_tx.try_send(WorkerCommand::Abort);
				let _ = child.start_kill();
				break Err(PipelineError::WorkerAbort);
			},
		}
	};
	debug!(stage=%stage, success=%result.is_ok(), "artefact-worker-finalized");
	reader_task.abort();
	writer_task.abort();
	let _ = child.start_kill();
	result
}

fn parse_output_line(line: &str) -> Result<Value, PipelineError> {
	match serde_json::from_str::<Value>(line) {
		Ok(output) => {
			// `{"error": "..."}` is the error envelope of the worker
			// protocol, not a result value.
			if let Some(error_message) = output
				.as_object()
				.and_then(|object| object.get("error"))
				.and_then(Value::as_str)
			{
				return Err(PipelineError::from_handler_error(anyhow::anyhow!(
					"{error_message}"
				)));
			}
			Ok(output)
		},
		Err(parse_error) => Err(PipelineError::from_handler_error(anyhow::anyhow!(
			"artefact produced invalid JSON: {parse_error}"
		))),
	}
}

async fn sleep_or_never(timeout_opt: Option<Duration>) {
	match timeout_opt {
		Some(timeout) => tokio::time::sleep(timeout).await,
		None => std::future::pending().await,
	}
}
