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

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use futures::Future;
use rand::Rng;
use tracing::{debug, warn};

const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(20);

/// Classifies an error as worth retrying or not.
///
/// Permanent errors (cancellation, shutdown, configuration mistakes)
/// must not be retried: retrying them only delays the inevitable.
pub trait Retryable {
	fn is_retryable(&self) -> bool {
		false
	}
}

#[derive(Debug, Clone, Copy)]
pub struct RetryParams {
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub max_retries: usize,
}

impl Default for RetryParams {
	fn default() -> Self {
		Self {
			base_delay: DEFAULT_BASE_DELAY,
			max_delay: DEFAULT_MAX_DELAY,
			max_retries: DEFAULT_MAX_RETRIES,
		}
	}
}

impl RetryParams {
	/// Builds retry parameters from a millisecond base delay, the unit used
	/// at the engine's API boundary.
	pub fn from_millis(backoff_ms: u64, max_retries: usize) -> Self {
		Self {
			base_delay: Duration::from_millis(backoff_ms),
			max_delay: DEFAULT_MAX_DELAY,
			max_retries,
		}
	}

	/// Computes the delay after which a new attempt should be performed.
	/// The delay doubles after each failed attempt, with a uniform jitter of
	/// up to 10% of the base delay added on top, and is capped at `max_delay`.
	///
	/// The caller passes the number of attempts performed so far. Not to be
	/// confused with the number of retries, which is one less than the number
	/// of attempts.
	///
	/// # Panics
	///
	/// Panics if `num_attempts` is zero.
	pub fn compute_delay(&self, num_attempts: usize) -> Duration {
		assert!(num_attempts > 0, "num_attempts should be greater than zero");

		let base_delay_ms = self.base_delay.as_millis() as u64;
		let delay_ms = base_delay_ms.saturating_mul(2u64.saturating_pow(num_attempts as u32 - 1));
		let jitter_ceil_ms = base_delay_ms / 10;
		let jitter_ms = if jitter_ceil_ms > 0 {
			rand::thread_rng().gen_range(0..jitter_ceil_ms)
		} else {
			0
		};
		let jittered_delay_ms =
			delay_ms.saturating_add(jitter_ms).min(self.max_delay.as_millis() as u64);
		Duration::from_millis(jittered_delay_ms)
	}

	#[cfg(any(test, feature = "testsuite"))]
	pub fn for_test() -> Self {
		Self {
			base_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(2),
			..Default::default()
		}
	}
}

#[async_trait]
pub trait MockableSleep {
	async fn sleep(&self, duration: Duration);
}

pub struct TokioSleep;

#[async_trait]
impl MockableSleep for TokioSleep {
	async fn sleep(&self, duration: Duration) {
		tokio::time::sleep(duration).await;
	}
}

/// Runs `f` until it succeeds, a permanent error is hit, or
/// `max_retries + 1` attempts have been made.
pub async fn retry_with_mockable_sleep<U, E, Fut>(
	retry_params: &RetryParams,
	f: impl Fn() -> Fut,
	mockable_sleep: impl MockableSleep,
) -> Result<U, E>
where
	Fut: Future<Output = Result<U, E>>,
	E: Retryable + Debug + 'static,
{
	let mut num_attempts = 0;

	loop {
		let response = f().await;

		let error = match response {
			Ok(response) => {
				return Ok(response);
			},
			Err(error) => error,
		};
		if !error.is_retryable() {
			return Err(error);
		}
		num_attempts += 1;

		if num_attempts > retry_params.max_retries {
			warn!(
				num_attempts=%num_attempts,
				"invocation failed, retries exhausted"
			);
			return Err(error);
		}
		let delay = retry_params.compute_delay(num_attempts);
		debug!(
			num_attempts=%num_attempts,
			delay_ms=%delay.as_millis(),
			error=?error,
			"invocation failed, retrying"
		);
		mockable_sleep.sleep(delay).await;
	}
}

pub async fn retry<U, E, Fut>(retry_params: &RetryParams, f: impl Fn() -> Fut) -> Result<U, E>
where
	Fut: Future<Output = Result<U, E>>,
	E: Retryable + Debug + 'static,
{
	retry_with_mockable_sleep(retry_params, f, TokioSleep).await
}

#[cfg(test)]
mod tests {
	use std::{sync::RwLock, time::Duration};

	use futures::future::ready;

	use super::{retry_with_mockable_sleep, MockableSleep, RetryParams, Retryable};

	#[derive(Debug, Eq, PartialEq)]
	pub enum Retry<E> {
		Permanent(E),
		Transient(E),
	}

	impl<E> Retryable for Retry<E> {
		fn is_retryable(&self) -> bool {
			match self {
				Retry::Permanent(_) => false,
				Retry::Transient(_) => true,
			}
		}
	}

	struct NoopSleep;

	#[async_trait::async_trait]
	impl MockableSleep for NoopSleep {
		async fn sleep(&self, _duration: Duration) {}
	}

	async fn simulate_retries<T>(values: Vec<Result<T, Retry<usize>>>) -> Result<T, Retry<usize>> {
		let values_it = RwLock::new(values.into_iter());
		retry_with_mockable_sleep(
			&RetryParams::default(),
			|| ready(values_it.write().unwrap().next().unwrap()),
			NoopSleep,
		)
		.await
	}

	#[tokio::test]
	async fn test_retry_accepts_ok() {
		assert_eq!(simulate_retries(vec![Ok(())]).await, Ok(()));
	}

	#[tokio::test]
	async fn test_retry_does_retry() {
		assert_eq!(simulate_retries(vec![Err(Retry::Transient(1)), Ok(())]).await, Ok(()));
	}

	#[tokio::test]
	async fn test_retry_stops_retrying_on_permanent_error() {
		assert_eq!(
			simulate_retries(vec![Err(Retry::Permanent(1)), Ok(())]).await,
			Err(Retry::Permanent(1))
		);
	}

	#[tokio::test]
	async fn test_retry_makes_max_retries_plus_one_attempts() {
		// Default budget is 3 retries, so 4 attempts in total.
		let retry_sequence: Vec<Result<(), _>> =
			(0..4).map(|retry_id| Err(Retry::Transient(retry_id))).collect();
		assert_eq!(simulate_retries(retry_sequence).await, Err(Retry::Transient(3)));
	}

	#[tokio::test]
	async fn test_retry_succeeds_on_last_attempt() {
		let retry_sequence: Vec<_> = (0..3)
			.map(|retry_id| Err(Retry::Transient(retry_id)))
			.chain(Some(Ok(())))
			.collect();
		assert_eq!(simulate_retries(retry_sequence).await, Ok(()));
	}

	#[test]
	fn test_compute_delay_doubles_and_caps() {
		let retry_params = RetryParams {
			base_delay: Duration::from_millis(100),
			max_delay: Duration::from_millis(500),
			max_retries: 5,
		};
		for (num_attempts, lower_bound_ms, upper_bound_ms) in
			[(1, 100, 110), (2, 200, 210), (3, 400, 410), (4, 500, 500)]
		{
			let delay_ms = retry_params.compute_delay(num_attempts).as_millis() as u64;
			assert!(delay_ms >= lower_bound_ms, "attempt {num_attempts}: {delay_ms}ms");
			assert!(delay_ms <= upper_bound_ms, "attempt {num_attempts}: {delay_ms}ms");
		}
	}
}
