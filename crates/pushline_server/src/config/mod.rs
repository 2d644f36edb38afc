#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use pushline_domain::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::connection::{
	ConnectionSettings, DEFAULT_AUTH_ERROR_WRITE_WAIT, DEFAULT_MAX_INBOUND_MESSAGE_SIZE, DEFAULT_WRITE_WAIT,
};
use crate::server::registry::DEFAULT_QUEUE_CAPACITY;

/// Default listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:8181";

/// Default config path: `~/.pushline/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".pushline").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub message_log: MessageLogSettings,
}

/// Listener, auth and per-connection settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// HTTP listen address (host:port).
	pub bind: String,
	/// HMAC secret for access tokens.
	pub jwt_secret: Option<SecretString>,
	/// Outbound queue capacity per connection.
	pub queue_capacity: usize,
	/// Deadline for a single outbound frame.
	pub write_wait: Duration,
	/// Largest inbound message accepted from a peer.
	pub max_inbound_message_size: usize,
	/// Deadline for the authentication error frame.
	pub auth_error_write_wait: Duration,
	/// Give up on a full recipient queue after this long; `None` waits forever.
	pub enqueue_timeout: Option<Duration>,
	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLogBackend {
	Stdout,
	Database,
	None,
}

impl MessageLogBackend {
	fn parse(s: &str) -> Option<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"stdout" => Some(Self::Stdout),
			"database" | "db" => Some(Self::Database),
			"none" | "off" => Some(Self::None),
			_ => None,
		}
	}
}

/// Where delivery attempts are recorded.
#[derive(Debug, Clone)]
pub struct MessageLogSettings {
	pub backend: MessageLogBackend,
	/// Database URL (sqlite:, postgres:, mysql:).
	pub database_url: Option<String>,
}

impl ServerConfig {
	pub fn connection_settings(&self) -> ConnectionSettings {
		ConnectionSettings {
			queue_capacity: self.server.queue_capacity,
			write_wait: self.server.write_wait,
			max_inbound_message_size: self.server.max_inbound_message_size,
			auth_error_write_wait: self.server.auth_error_write_wait,
		}
	}
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	message_log: FileMessageLogSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	jwt_secret: Option<String>,
	queue_capacity: Option<usize>,
	write_wait_ms: Option<u64>,
	max_inbound_message_size: Option<usize>,
	auth_error_write_ms: Option<u64>,
	enqueue_timeout_ms: Option<u64>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileMessageLogSettings {
	backend: Option<String>,
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let backend = match file.message_log.backend.as_deref() {
			None => MessageLogBackend::Stdout,
			Some(raw) => MessageLogBackend::parse(raw).unwrap_or_else(|| {
				warn!(backend = %raw, "message log: unknown backend; using stdout");
				MessageLogBackend::Stdout
			}),
		};

		Self {
			server: ServerSettings {
				bind: file
					.server
					.bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_BIND.to_string()),
				jwt_secret: file.server.jwt_secret.filter(|s| !s.is_empty()).map(SecretString::new),
				queue_capacity: file
					.server
					.queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_QUEUE_CAPACITY),
				write_wait: file
					.server
					.write_wait_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(DEFAULT_WRITE_WAIT),
				max_inbound_message_size: file
					.server
					.max_inbound_message_size
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_MAX_INBOUND_MESSAGE_SIZE),
				auth_error_write_wait: file
					.server
					.auth_error_write_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(DEFAULT_AUTH_ERROR_WRITE_WAIT),
				enqueue_timeout: file
					.server
					.enqueue_timeout_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			message_log: MessageLogSettings {
				backend,
				database_url: file.message_log.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => Ok(Some(parse_toml(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	apply_overrides(cfg, |name| std::env::var(name).ok());
}

/// Apply `PUSHLINE_*` overrides read through `lookup`; blank values are ignored.
fn apply_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let env_string = |name: &str| {
		lookup(name)
			.map(|v| v.trim().to_string())
			.filter(|v| !v.is_empty())
	};

	if let Some(v) = env_string("PUSHLINE_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = env_string("PUSHLINE_JWT_SECRET") {
		cfg.server.jwt_secret = Some(SecretString::new(v));
		info!("server auth: jwt_secret overridden by env");
	} else if let Some(v) = env_string("JWT_SECRET") {
		cfg.server.jwt_secret = Some(SecretString::new(v));
		info!("server auth: jwt_secret taken from JWT_SECRET");
	}

	if let Some(v) = env_string("PUSHLINE_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.queue_capacity = capacity;
		info!(capacity, "server config: queue_capacity overridden by env");
	}

	if let Some(v) = env_string("PUSHLINE_WRITE_WAIT_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.server.write_wait = Duration::from_millis(ms);
		info!(ms, "server config: write_wait overridden by env");
	}

	if let Some(v) = env_string("PUSHLINE_MAX_INBOUND_MESSAGE_SIZE")
		&& let Ok(size) = v.parse::<usize>()
		&& size > 0
	{
		cfg.server.max_inbound_message_size = size;
		info!(size, "server config: max_inbound_message_size overridden by env");
	}

	if let Some(v) = env_string("PUSHLINE_ENQUEUE_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.server.enqueue_timeout = (ms > 0).then(|| Duration::from_millis(ms));
		info!(ms, "server config: enqueue_timeout overridden by env");
	}

	if let Some(v) = env_string("PUSHLINE_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("PUSHLINE_MESSAGE_LOG") {
		match MessageLogBackend::parse(&v) {
			Some(backend) => {
				cfg.message_log.backend = backend;
				info!(?backend, "message log: backend overridden by env");
			}
			None => warn!(backend = %v, "message log: ignoring unknown backend from env"),
		}
	}

	if let Some(v) = env_string("PUSHLINE_DATABASE_URL") {
		cfg.message_log.database_url = Some(v);
		info!("message log: database_url overridden by env");
	}

	if cfg.message_log.backend == MessageLogBackend::Database && cfg.message_log.database_url.is_none() {
		warn!("message log: database backend selected but no database_url configured");
	}

	if cfg.server.enqueue_timeout.is_none() {
		info!("server config: senders block while a recipient queue is full (no enqueue_timeout)");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	#[test]
	fn defaults_match_documented_values() {
		let cfg = ServerConfig::default();
		assert_eq!(cfg.server.bind, DEFAULT_BIND);
		assert!(cfg.server.jwt_secret.is_none());
		assert_eq!(cfg.server.queue_capacity, 128);
		assert_eq!(cfg.server.write_wait, Duration::from_secs(10));
		assert_eq!(cfg.server.max_inbound_message_size, 512);
		assert_eq!(cfg.server.auth_error_write_wait, Duration::from_secs(1));
		assert_eq!(cfg.server.enqueue_timeout, None);
		assert_eq!(cfg.message_log.backend, MessageLogBackend::Stdout);
	}

	#[test]
	fn file_values_override_defaults() {
		let file = parse_toml(
			r#"
			[server]
			bind = "0.0.0.0:9000"
			jwt_secret = "s3cret"
			queue_capacity = 4
			write_wait_ms = 250
			enqueue_timeout_ms = 500

			[message_log]
			backend = "database"
			database_url = "sqlite://log.db"
			"#,
		)
		.unwrap();
		let cfg = ServerConfig::from_file(file);

		assert_eq!(cfg.server.bind, "0.0.0.0:9000");
		assert_eq!(cfg.server.jwt_secret.as_ref().map(SecretString::expose), Some("s3cret"));
		assert_eq!(cfg.server.queue_capacity, 4);
		assert_eq!(cfg.server.write_wait, Duration::from_millis(250));
		assert_eq!(cfg.server.enqueue_timeout, Some(Duration::from_millis(500)));
		assert_eq!(cfg.message_log.backend, MessageLogBackend::Database);
		assert_eq!(cfg.message_log.database_url.as_deref(), Some("sqlite://log.db"));

		let settings = cfg.connection_settings();
		assert_eq!(settings.queue_capacity, 4);
		assert_eq!(settings.max_inbound_message_size, 512);
	}

	#[test]
	fn zero_and_blank_values_fall_back() {
		let file = parse_toml(
			r#"
			[server]
			bind = "  "
			queue_capacity = 0
			enqueue_timeout_ms = 0

			[message_log]
			backend = "carrier-pigeon"
			"#,
		)
		.unwrap();
		let cfg = ServerConfig::from_file(file);

		assert_eq!(cfg.server.bind, DEFAULT_BIND);
		assert_eq!(cfg.server.queue_capacity, DEFAULT_QUEUE_CAPACITY);
		assert_eq!(cfg.server.enqueue_timeout, None);
		assert_eq!(cfg.message_log.backend, MessageLogBackend::Stdout);
	}

	fn overrides(vars: &[(&str, &str)]) -> ServerConfig {
		let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		let mut cfg = ServerConfig::from_file(
			parse_toml(
				r#"
				[server]
				jwt_secret = "from-file"
				enqueue_timeout_ms = 500
				"#,
			)
			.unwrap(),
		);
		apply_overrides(&mut cfg, |name| vars.get(name).cloned());
		cfg
	}

	#[test]
	fn pushline_secret_wins_over_generic_secret() {
		let cfg = overrides(&[("PUSHLINE_JWT_SECRET", "specific"), ("JWT_SECRET", "generic")]);
		assert_eq!(cfg.server.jwt_secret.as_ref().map(SecretString::expose), Some("specific"));

		let cfg = overrides(&[("JWT_SECRET", "generic")]);
		assert_eq!(cfg.server.jwt_secret.as_ref().map(SecretString::expose), Some("generic"));

		let cfg = overrides(&[("PUSHLINE_JWT_SECRET", "  ")]);
		assert_eq!(cfg.server.jwt_secret.as_ref().map(SecretString::expose), Some("from-file"));
	}

	#[test]
	fn zero_enqueue_timeout_from_env_clears_it() {
		assert_eq!(overrides(&[]).server.enqueue_timeout, Some(Duration::from_millis(500)));

		let cfg = overrides(&[("PUSHLINE_ENQUEUE_TIMEOUT_MS", "0")]);
		assert_eq!(cfg.server.enqueue_timeout, None);

		let cfg = overrides(&[("PUSHLINE_ENQUEUE_TIMEOUT_MS", "75")]);
		assert_eq!(cfg.server.enqueue_timeout, Some(Duration::from_millis(75)));
	}

	#[test]
	fn unknown_message_log_backend_from_env_is_ignored() {
		let cfg = overrides(&[("PUSHLINE_MESSAGE_LOG", "carrier-pigeon")]);
		assert_eq!(cfg.message_log.backend, MessageLogBackend::Stdout);

		let cfg = overrides(&[("PUSHLINE_MESSAGE_LOG", "none")]);
		assert_eq!(cfg.message_log.backend, MessageLogBackend::None);
	}

	#[test]
	fn numeric_overrides_skip_invalid_values() {
		let cfg = overrides(&[
			("PUSHLINE_BIND", "0.0.0.0:9999"),
			("PUSHLINE_QUEUE_CAPACITY", "not-a-number"),
			("PUSHLINE_WRITE_WAIT_MS", "0"),
			("PUSHLINE_MAX_INBOUND_MESSAGE_SIZE", "1024"),
		]);
		assert_eq!(cfg.server.bind, "0.0.0.0:9999");
		assert_eq!(cfg.server.queue_capacity, DEFAULT_QUEUE_CAPACITY);
		assert_eq!(cfg.server.write_wait, DEFAULT_WRITE_WAIT);
		assert_eq!(cfg.server.max_inbound_message_size, 1024);
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let dir = tempfile::tempdir().unwrap();
		assert!(read_toml_if_exists(&dir.path().join("absent.toml")).unwrap().is_none());
	}
}
