#![forbid(unsafe_code)]

use std::fmt::Write as _;

use crate::server::pending::PendingCounter;
use crate::server::registry::Registry;

/// Content type of the exposition body.
pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Point-in-time values of the two gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
	pub connections: usize,
	pub pending: i64,
}

impl MetricsSnapshot {
	/// Plaintext exposition: `connections` first, then `pending`.
	pub fn render(&self) -> String {
		let mut out = String::with_capacity(192);
		write_gauge(&mut out, "connections", "Number of live connections.", self.connections as i64);
		write_gauge(&mut out, "pending", "Number of messages waiting to be sent.", self.pending);
		out
	}
}

fn write_gauge(out: &mut String, name: &str, help: &str, value: i64) {
	let _ = writeln!(out, "# HELP {name} {help}");
	let _ = writeln!(out, "# TYPE {name} gauge");
	let _ = writeln!(out, "{name} {value}");
}

/// Pull-model reporter over the registry and the pending counter.
#[derive(Debug, Clone)]
pub struct MetricsReporter {
	registry: Registry,
	pending: PendingCounter,
}

impl MetricsReporter {
	pub fn new(registry: Registry, pending: PendingCounter) -> Self {
		Self { registry, pending }
	}

	pub fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			connections: self.registry.live_count(),
			pending: self.pending.load(),
		}
	}

	pub fn render(&self) -> String {
		self.snapshot().render()
	}
}
