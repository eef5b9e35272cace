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

use std::{fmt, future::Future, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

/// A stage handler: a unary async transformation from value to value.
///
/// Handlers run on the dedicated worker runtime, out-of-band from the
/// orchestrator, so they may block or burn CPU without stalling the
/// engine.
#[async_trait]
pub trait StageHandler: Send + Sync + 'static {
	async fn run(&self, value: Value) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StageHandler for FnHandler<F>
where
	F: Fn(Value) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
	async fn run(&self, value: Value) -> anyhow::Result<Value> {
		(self.0)(value).await
	}
}

/// Wraps an async closure into a [`StageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StageHandler>
where
	F: Fn(Value) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
	Arc::new(FnHandler(f))
}

/// How a stage's work is dispatched.
#[derive(Clone)]
pub enum StageHandlerKind {
	/// A pre-registered in-process function.
	Inline(Arc<dyn StageHandler>),
	/// A path to an external executable artefact.
	///
	/// Per invocation the artefact is spawned as a child process. It
	/// reads one JSON value on stdin, writes one JSON line on stdout
	/// (either the result value or an `{"error": "..."}` envelope), and
	/// may honor a textual `abort` line on stdin to cancel cooperatively.
	Artefact(PathBuf),
}

impl StageHandlerKind {
	pub fn inline<F, Fut>(f: F) -> StageHandlerKind
	where
		F: Fn(Value) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
	{
		StageHandlerKind::Inline(handler_fn(f))
	}

	pub fn artefact(path: impl Into<PathBuf>) -> StageHandlerKind {
		StageHandlerKind::Artefact(path.into())
	}
}

impl fmt::Debug for StageHandlerKind {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			StageHandlerKind::Inline(_) => f.debug_tuple("Inline").finish(),
			StageHandlerKind::Artefact(path) => f.debug_tuple("Artefact").field(path).finish(),
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[tokio::test]
	async fn test_handler_fn_wraps_a_closure() {
		let handler = handler_fn(|value| async move {
			let incremented = value.as_i64().unwrap() + 1;
			Ok(json!(incremented))
		});
		assert_eq!(handler.run(json!(41)).await.unwrap(), json!(42));
	}
}
