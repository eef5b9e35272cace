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
	future::Future,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex, Weak,
	},
	time::{Instant, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::{config::StageId, error::PipelineError};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineEventKind {
	StepEnd,
	StepError,
	Error,
	ShutdownStart,
	ShutdownComplete,
	ShutdownError,
	ShutdownTimeout,
	WorkerAborted,
	ExecutionCancelled,
}

/// Correlation data attached to every event. `attempt` is 1-based.
#[derive(Debug, Clone, Serialize)]
pub struct EventContext {
	pub pipeline_id: String,
	pub execution_id: String,
	pub attempt: usize,
}

/// An immutable record describing one observable engine moment.
///
/// `timestamp` is milliseconds since the unix epoch; `duration` is the
/// wall time of the tracked invocation in milliseconds (zero for
/// engine-level events).
#[derive(Debug, Clone, Serialize)]
pub struct PipelineEvent {
	pub kind: PipelineEventKind,
	pub timestamp: u64,
	pub duration: u64,
	pub stage: Option<StageId>,
	pub data: Value,
	pub context: EventContext,
}

pub(crate) fn unix_timestamp_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|elapsed| elapsed.as_millis() as u64)
		.unwrap_or(0)
}

type EventListener = Arc<dyn Fn(&PipelineEvent) + Send + Sync + 'static>;

/// The event bus of a single engine instance.
///
/// Listeners are called synchronously, in registration order. A
/// panicking listener is isolated: the panic is caught and logged, and
/// the remaining listeners still observe the event.
///
/// It is lightweight to clone. There is deliberately no process-wide
/// broker: every engine owns its own, so independent engines (and unit
/// tests) never leak listeners into each other.
#[derive(Clone, Default)]
pub struct EventBroker {
	inner: Arc<InnerEventBroker>,
}

#[derive(Default)]
struct InnerEventBroker {
	listener_sequence: AtomicUsize,
	listeners: Mutex<Vec<(usize, EventListener)>>,
}

impl EventBroker {
	/// Registers a listener for all events.
	#[must_use]
	pub fn subscribe(
		&self,
		listener: impl Fn(&PipelineEvent) + Send + Sync + 'static,
	) -> EventSubscriptionHandle {
		let listener_id = self.inner.listener_sequence.fetch_add(1, Ordering::Relaxed);
		self.inner
			.listeners
			.lock()
			.expect("lock should not be poisoned")
			.push((listener_id, Arc::new(listener)));
		EventSubscriptionHandle { listener_id, broker: Arc::downgrade(&self.inner) }
	}

	/// Delivers an event to the current snapshot of listeners.
	pub fn emit(&self, event: PipelineEvent) {
		let listeners: Vec<EventListener> = self
			.inner
			.listeners
			.lock()
			.expect("lock should not be poisoned")
			.iter()
			.map(|(_, listener)| listener.clone())
			.collect();
		for listener in listeners {
			if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
				warn!(kind=?event.kind, "event listener panicked");
			}
		}
	}

	/// Runs a stage invocation and emits its terminal event.
	///
	/// Exactly one of `StepEnd`/`StepError` is emitted per call, with the
	/// invocation's wall time.
	pub(crate) async fn track_stage<Fut>(
		&self,
		stage: &StageId,
		context: EventContext,
		invocation: Fut,
	) -> Result<Value, PipelineError>
	where
		Fut: Future<Output = Result<Value, PipelineError>>,
	{
		let start = Instant::now();
		let result = invocation.await;
		let duration = start.elapsed().as_millis() as u64;
		let (kind, data) = match &result {
			Ok(value) => (PipelineEventKind::StepEnd, value.clone()),
			Err(error) => (PipelineEventKind::StepError, Value::String(error.to_string())),
		};
		self.emit(PipelineEvent {
			kind,
			timestamp: unix_timestamp_ms(),
			duration,
			stage: Some(stage.clone()),
			data,
			context,
		});
		result
	}

	/// Drops every listener. Used by the engine's `cleanup`.
	pub(crate) fn clear(&self) {
		self.inner.listeners.lock().expect("lock should not be poisoned").clear();
	}
}

pub struct EventSubscriptionHandle {
	listener_id: usize,
	broker: Weak<InnerEventBroker>,
}

impl EventSubscriptionHandle {
	pub fn cancel(self) {}

	/// By default, dropping a subscription handle cancels the
	/// subscription. `forever` consumes the handle and leaves the
	/// subscription in place for the lifetime of the broker.
	pub fn forever(mut self) {
		self.broker = Weak::new();
	}
}

impl Drop for EventSubscriptionHandle {
	fn drop(&mut self) {
		if let Some(broker) = self.broker.upgrade() {
			let mut listeners = broker.listeners.lock().expect("lock should not be poisoned");
			listeners.retain(|(listener_id, _)| *listener_id != self.listener_id);
		}
	}
}
