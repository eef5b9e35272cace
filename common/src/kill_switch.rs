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

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc, Mutex, Weak,
};

use tokio::sync::Notify;
use tracing::debug;

/// A hierarchical kill switch.
///
/// Killing a switch kills all of the children derived from it
/// (and transitively their children), but not its parent.
#[derive(Clone, Default)]
pub struct KillSwitch {
	inner: Arc<Inner>,
}

struct Inner {
	alive: AtomicBool,
	notify: Notify,
	children: Mutex<Vec<Weak<Inner>>>,
}

impl Default for Inner {
	fn default() -> Self {
		Self { alive: AtomicBool::new(true), notify: Notify::new(), children: Mutex::default() }
	}
}

impl KillSwitch {
	pub fn is_alive(&self) -> bool {
		self.inner.alive.load(Ordering::Relaxed)
	}

	pub fn is_dead(&self) -> bool {
		!self.is_alive()
	}

	pub fn kill(&self) {
		self.inner.kill();
	}

	/// Waits until the switch is killed.
	///
	/// Returns immediately if the switch is already dead.
	pub async fn killed(&self) {
		loop {
			let notified = self.inner.notify.notified();
			if self.is_dead() {
				return;
			}
			notified.await;
		}
	}

	// Creates a child kill switch.
	//
	// If the parent is dead to begin with, the child is dead too.
	pub fn child(&self) -> KillSwitch {
		let mut children_lock = self.inner.children.lock().unwrap();
		children_lock.retain(|child| Weak::strong_count(child) > 0);
		let child_inner =
			Inner { alive: AtomicBool::new(self.is_alive()), ..Default::default() };
		let child_inner_arc = Arc::new(child_inner);
		children_lock.push(Arc::downgrade(&child_inner_arc));
		KillSwitch { inner: child_inner_arc }
	}
}

impl Inner {
	fn kill(&self) {
		debug!("kill-switch-activated");
		self.alive.store(false, Ordering::Relaxed);
		self.notify.notify_waiters();
		let mut children_lock = self.children.lock().unwrap();
		for weak in children_lock.drain(..) {
			if let Some(inner) = weak.upgrade() {
				inner.kill();
			}
		}
	}
}
