#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::server::auth::Authenticator;
use crate::server::connection::{ConnectionContext, ConnectionSettings, DeliveryErrorHandler, default_error_handler};
use crate::server::health::HealthState;
use crate::server::message_log::MessageLogger;
use crate::server::metrics::MetricsReporter;
use crate::server::pending::PendingCounter;
use crate::server::registry::{Registry, RegistryConfig};

/// Everything the HTTP front needs, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
	pub connections: ConnectionContext,
	pub authenticator: Arc<dyn Authenticator>,
	pub logger: Arc<dyn MessageLogger>,
	pub metrics: MetricsReporter,
	pub health: HealthState,

	/// `None` blocks senders until the recipient queue has room.
	pub enqueue_timeout: Option<Duration>,

	next_conn_id: Arc<AtomicU64>,
}

/// Builder inputs for `AppState`.
pub struct AppStateConfig {
	pub authenticator: Arc<dyn Authenticator>,
	pub logger: Arc<dyn MessageLogger>,
	pub settings: ConnectionSettings,
	pub registry: RegistryConfig,
	pub enqueue_timeout: Option<Duration>,
	pub error_handler: Option<DeliveryErrorHandler>,
}

impl AppState {
	/// Spawns the registry owner task.
	pub fn new(cfg: AppStateConfig) -> Self {
		let registry = Registry::spawn(cfg.registry);
		let pending = PendingCounter::new();
		let metrics = MetricsReporter::new(registry.clone(), pending.clone());

		Self {
			connections: ConnectionContext {
				registry,
				pending,
				error_handler: cfg.error_handler.unwrap_or_else(default_error_handler),
				settings: cfg.settings,
			},
			authenticator: cfg.authenticator,
			logger: cfg.logger,
			metrics,
			health: HealthState::new(),
			enqueue_timeout: cfg.enqueue_timeout,
			next_conn_id: Arc::new(AtomicU64::new(1)),
		}
	}

	pub fn registry(&self) -> &Registry {
		&self.connections.registry
	}

	pub fn pending(&self) -> &PendingCounter {
		&self.connections.pending
	}

	pub fn next_conn_id(&self) -> u64 {
		self.next_conn_id.fetch_add(1, Ordering::Relaxed)
	}
}
