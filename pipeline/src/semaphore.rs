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
	collections::VecDeque,
	sync::{Arc, Mutex},
	time::Duration,
};

use tokio::sync::{oneshot, watch};

use crate::error::PipelineError;

/// A FIFO-fair counting semaphore with a shutdown handshake.
///
/// Unlike `tokio::sync::Semaphore`, a freed slot is handed directly to
/// the longest waiter, and shutting the semaphore down rejects every
/// queued waiter and lets the caller await the drain of the held slots.
///
/// It is lightweight to clone.
#[derive(Clone)]
pub struct Semaphore {
	inner: Arc<Inner>,
}

struct Inner {
	max_concurrency: usize,
	state: Mutex<State>,
	// Mirrors `held` so that `shutdown` can await the drain.
	occupancy_tx: watch::Sender<usize>,
}

struct State {
	held: usize,
	waiters: VecDeque<oneshot::Sender<Result<(), PipelineError>>>,
	shutdown: bool,
}

impl Semaphore {
	pub fn new(max_concurrency: usize) -> Result<Semaphore, PipelineError> {
		if max_concurrency == 0 {
			return Err(PipelineError::InvalidConfig(
				"semaphore max concurrency must be greater than zero".to_string(),
			));
		}
		Ok(Self::with_max(max_concurrency))
	}

	/// A semaphore that never queues: used where no cap is configured,
	/// to keep admission accounting uniform.
	pub(crate) fn unbounded() -> Semaphore {
		Self::with_max(usize::MAX)
	}

	fn with_max(max_concurrency: usize) -> Semaphore {
		let (occupancy_tx, _occupancy_rx) = watch::channel(0);
		Semaphore {
			inner: Arc::new(Inner {
				max_concurrency,
				state: Mutex::new(State {
					held: 0,
					waiters: VecDeque::new(),
					shutdown: false,
				}),
				occupancy_tx,
			}),
		}
	}

	/// Acquires a slot, waiting in line if none is free.
	///
	/// Fails with [`PipelineError::SemaphoreShutdown`] if the semaphore
	/// is shut down at the time of the call or while waiting.
	pub async fn acquire(&self) -> Result<(), PipelineError> {
		let permit_rx = {
			let mut state = self.inner.state.lock().unwrap();
			if state.shutdown {
				return Err(PipelineError::SemaphoreShutdown);
			}
			if state.held < self.inner.max_concurrency && state.waiters.is_empty() {
				state.held += 1;
				let _ = self.inner.occupancy_tx.send(state.held);
				return Ok(());
			}
			let (permit_tx, permit_rx) = oneshot::channel();
			state.waiters.push_back(permit_tx);
			permit_rx
		};
		match permit_rx.await {
			Ok(permit) => permit,
			// The sender only disappears through a forced shutdown.
			Err(_) => Err(PipelineError::SemaphoreShutdown),
		}
	}

	/// Releases a slot.
	///
	/// Fails with [`PipelineError::ReleasedTooMany`] when no slot is
	/// held, except during shutdown where the extra release is ignored.
	pub fn release(&self) -> Result<(), PipelineError> {
		let mut state = self.inner.state.lock().unwrap();
		if state.held == 0 {
			if state.shutdown {
				return Ok(());
			}
			return Err(PipelineError::ReleasedTooMany);
		}
		// The freed slot is handed directly to the longest waiter: it
		// never transits through the `held < max` fast path, so a waiter
		// cannot be overtaken by a fresh `acquire` call.
		while let Some(waiter) = state.waiters.pop_front() {
			if waiter.send(Ok(())).is_ok() {
				return Ok(());
			}
		}
		state.held -= 1;
		let _ = self.inner.occupancy_tx.send(state.held);
		Ok(())
	}

	pub fn current_concurrency(&self) -> usize {
		self.inner.state.lock().unwrap().held
	}

	pub fn pending(&self) -> usize {
		self.inner.state.lock().unwrap().waiters.len()
	}

	/// Rejects all queued waiters and refuses new `acquire` calls.
	/// Idempotent. Held slots remain until released.
	pub fn begin_shutdown(&self) {
		let mut state = self.inner.state.lock().unwrap();
		state.shutdown = true;
		for waiter in state.waiters.drain(..) {
			let _ = waiter.send(Err(PipelineError::SemaphoreShutdown));
		}
	}

	/// Shuts down and waits until every held slot has been released.
	///
	/// With a timeout, the wait fails with
	/// [`PipelineError::ShutdownTimeout`] once it elapses; the semaphore
	/// stays shut down either way.
	pub async fn shutdown(&self, timeout_opt: Option<Duration>) -> Result<(), PipelineError> {
		self.begin_shutdown();
		let mut occupancy_rx = self.inner.occupancy_tx.subscribe();
		let drained = async move {
			while *occupancy_rx.borrow_and_update() > 0 {
				if occupancy_rx.changed().await.is_err() {
					break;
				}
			}
		};
		match timeout_opt {
			Some(timeout) => tokio::time::timeout(timeout, drained)
				.await
				.map_err(|_| PipelineError::ShutdownTimeout(timeout.as_millis() as u64)),
			None => {
				drained.await;
				Ok(())
			},
		}
	}

	/// Synchronous last resort: rejects the waiters, drops the held
	/// count to zero and unblocks any pending `shutdown` call.
	pub fn force_shutdown(&self) {
		let mut state = self.inner.state.lock().unwrap();
		state.shutdown = true;
		for waiter in state.waiters.drain(..) {
			let _ = waiter.send(Err(PipelineError::SemaphoreShutdown));
		}
		state.held = 0;
		let _ = self.inner.occupancy_tx.send(0);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use super::*;

	#[test]
	fn test_semaphore_requires_a_positive_cap() {
		assert!(matches!(Semaphore::new(0), Err(PipelineError::InvalidConfig(_))));
		assert!(Semaphore::new(1).is_ok());
	}

	#[tokio::test]
	async fn test_semaphore_grants_up_to_max_concurrency() {
		let semaphore = Semaphore::new(2).unwrap();
		semaphore.acquire().await.unwrap();
		semaphore.acquire().await.unwrap();
		assert_eq!(semaphore.current_concurrency(), 2);
		assert_eq!(semaphore.pending(), 0);

		let semaphore_clone = semaphore.clone();
		let blocked = tokio::spawn(async move { semaphore_clone.acquire().await });
		while semaphore.pending() != 1 {
			tokio::task::yield_now().await;
		}
		semaphore.release().unwrap();
		blocked.await.unwrap().unwrap();
		// The slot was handed over: still two holders.
		assert_eq!(semaphore.current_concurrency(), 2);
	}

	#[tokio::test]
	async fn test_semaphore_is_fifo_fair() {
		let semaphore = Semaphore::new(1).unwrap();
		semaphore.acquire().await.unwrap();

		let completion_order = Arc::new(Mutex::new(Vec::new()));
		let mut join_handles = Vec::new();
		for waiter_id in 0..5 {
			let semaphore_clone = semaphore.clone();
			let completion_order_clone = completion_order.clone();
			join_handles.push(tokio::spawn(async move {
				semaphore_clone.acquire().await.unwrap();
				completion_order_clone.lock().unwrap().push(waiter_id);
				semaphore_clone.release().unwrap();
			}));
			// Wait until the task is queued so the enqueue order is the
			// spawn order.
			while semaphore.pending() != waiter_id + 1 {
				tokio::task::yield_now().await;
			}
		}
		semaphore.release().unwrap();
		for join_handle in join_handles {
			join_handle.await.unwrap();
		}
		assert_eq!(*completion_order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
	}

	#[test]
	fn test_release_without_acquire_is_an_error() {
		let semaphore = Semaphore::new(1).unwrap();
		assert!(matches!(semaphore.release(), Err(PipelineError::ReleasedTooMany)));
	}

	#[tokio::test]
	async fn test_release_after_shutdown_is_a_no_op() {
		let semaphore = Semaphore::new(1).unwrap();
		semaphore.shutdown(None).await.unwrap();
		assert!(semaphore.release().is_ok());
	}

	#[tokio::test]
	async fn test_acquire_after_shutdown_fails() {
		let semaphore = Semaphore::new(1).unwrap();
		semaphore.begin_shutdown();
		assert!(matches!(
			semaphore.acquire().await,
			Err(PipelineError::SemaphoreShutdown)
		));
	}

	#[tokio::test]
	async fn test_shutdown_rejects_queued_waiters() {
		let semaphore = Semaphore::new(1).unwrap();
		semaphore.acquire().await.unwrap();
		let semaphore_clone = semaphore.clone();
		let waiter = tokio::spawn(async move { semaphore_clone.acquire().await });
		while semaphore.pending() != 1 {
			tokio::task::yield_now().await;
		}
		semaphore.begin_shutdown();
		assert!(matches!(
			waiter.await.unwrap(),
			Err(PipelineError::SemaphoreShutdown)
		));
	}

	#[tokio::test]
	async fn test_shutdown_waits_for_the_drain() {
		let semaphore = Semaphore::new(1).unwrap();
		semaphore.acquire().await.unwrap();
		let semaphore_clone = semaphore.clone();
		let shutdown = tokio::spawn(async move { semaphore_clone.shutdown(None).await });
		tokio::task::yield_now().await;
		assert!(!shutdown.is_finished());
		semaphore.release().unwrap();
		shutdown.await.unwrap().unwrap();
		assert_eq!(semaphore.current_concurrency(), 0);
		assert_eq!(semaphore.pending(), 0);
	}

	#[tokio::test]
	async fn test_shutdown_with_timeout_reports_the_timeout() {
		let semaphore = Semaphore::new(1).unwrap();
		semaphore.acquire().await.unwrap();
		let shutdown_result = semaphore.shutdown(Some(Duration::from_millis(20))).await;
		assert!(matches!(shutdown_result, Err(PipelineError::ShutdownTimeout(20))));
		// Still shut down: new acquires fail.
		assert!(semaphore.acquire().await.is_err());
	}

	#[tokio::test]
	async fn test_force_shutdown_unblocks_everything() {
		let semaphore = Semaphore::new(1).unwrap();
		semaphore.acquire().await.unwrap();
		let semaphore_clone = semaphore.clone();
		let shutdown = tokio::spawn(async move { semaphore_clone.shutdown(None).await });
		tokio::task::yield_now().await;
		semaphore.force_shutdown();
		shutdown.await.unwrap().unwrap();
		assert_eq!(semaphore.current_concurrency(), 0);
	}
}
