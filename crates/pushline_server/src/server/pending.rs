#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Process-wide count of queued messages not yet written or dropped.
///
/// Eventually consistent: senders add before enqueueing and outbound loops subtract after
/// resolving, so a snapshot may briefly include messages that are already on the wire.
#[derive(Debug, Clone, Default)]
pub struct PendingCounter {
	value: Arc<AtomicI64>,
}

impl PendingCounter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, n: usize) {
		if n == 0 {
			return;
		}
		self.value.fetch_add(n as i64, Ordering::Relaxed);
		metrics::gauge!("pushline_pending_messages").increment(n as f64);
	}

	pub fn sub(&self, n: usize) {
		if n == 0 {
			return;
		}
		self.value.fetch_sub(n as i64, Ordering::Relaxed);
		metrics::gauge!("pushline_pending_messages").decrement(n as f64);
	}

	pub fn load(&self) -> i64 {
		self.value.load(Ordering::Relaxed)
	}
}
