#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hyper::StatusCode;

#[derive(Debug, Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	/// Status and body for `/healthz` and `/readyz`; `None` for other paths.
	pub fn respond(&self, path: &str) -> Option<(StatusCode, &'static str)> {
		match path {
			"/healthz" => Some((StatusCode::OK, "ok")),
			"/readyz" => {
				if self.is_ready() {
					Some((StatusCode::OK, "ready"))
				} else {
					Some((StatusCode::SERVICE_UNAVAILABLE, "not-ready"))
				}
			}
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn readiness_flips_once_marked() {
		let health = HealthState::new();
		assert_eq!(health.respond("/healthz"), Some((StatusCode::OK, "ok")));
		assert_eq!(
			health.respond("/readyz"),
			Some((StatusCode::SERVICE_UNAVAILABLE, "not-ready"))
		);

		health.clone().mark_ready();
		assert_eq!(health.respond("/readyz"), Some((StatusCode::OK, "ready")));
		assert_eq!(health.respond("/other"), None);
	}
}
