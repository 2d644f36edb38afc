#![forbid(unsafe_code)]

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{MessageLogBackend, ServerConfig};
use crate::server::auth::JwtAuthenticator;
use crate::server::message_log::{DbMessageLogger, MessageLogger, NullMessageLogger, StdoutMessageLogger};
use crate::server::registry::RegistryConfig;
use crate::server::state::{AppState, AppStateConfig};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: pushline_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    HTTP listen address (default: 127.0.0.1:8181)\n\
\t--config  Config file (default: ~/.pushline/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" | "--addr" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pushline_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("pushline_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn build_message_logger(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn MessageLogger>> {
	let logger: Arc<dyn MessageLogger> = match cfg.message_log.backend {
		MessageLogBackend::Stdout => Arc::new(StdoutMessageLogger),
		MessageLogBackend::None => Arc::new(NullMessageLogger),
		MessageLogBackend::Database => {
			let Some(database_url) = cfg.message_log.database_url.as_deref() else {
				return Err(anyhow!("message log backend is database but no database_url configured"));
			};
			Arc::new(DbMessageLogger::connect(database_url).await?)
		}
	};
	info!(backend = ?cfg.message_log.backend, "message log ready");
	Ok(logger)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = args.bind {
		server_cfg.server.bind = bind;
	}

	let Some(secret) = server_cfg.server.jwt_secret.clone() else {
		return Err(anyhow!(
			"no JWT secret configured (set server.jwt_secret or PUSHLINE_JWT_SECRET)"
		));
	};

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let logger = build_message_logger(&server_cfg).await?;

	let state = AppState::new(AppStateConfig {
		authenticator: Arc::new(JwtAuthenticator::new(secret)),
		logger,
		settings: server_cfg.connection_settings(),
		registry: RegistryConfig::default(),
		enqueue_timeout: server_cfg.server.enqueue_timeout,
		error_handler: None,
	});

	let listener = TcpListener::bind(&server_cfg.server.bind)
		.await
		.with_context(|| format!("bind {}", server_cfg.server.bind))?;
	info!(addr = %listener.local_addr()?, "pushline_server: listening");

	state.health.mark_ready();

	tokio::select! {
		res = crate::server::http::serve(listener, state) => res,
		res = tokio::signal::ctrl_c() => {
			res.context("listen for ctrl-c")?;
			info!("shutdown requested");
			Ok(())
		}
	}
}
