#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use pushline_domain::PushMessage;
use tracing::{info, warn};

/// Records delivery attempts. Failures are reported but never fail a send.
#[async_trait]
pub trait MessageLogger: Send + Sync {
	async fn log(&self, entry: &PushMessage) -> anyhow::Result<()>;
}

/// Log entries through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct StdoutMessageLogger;

#[async_trait]
impl MessageLogger for StdoutMessageLogger {
	async fn log(&self, entry: &PushMessage) -> anyhow::Result<()> {
		info!(target: "pushline::message_log", "send message: {}", entry.to_log_json());
		Ok(())
	}
}

/// Drops every entry.
#[derive(Debug, Clone, Default)]
pub struct NullMessageLogger;

#[async_trait]
impl MessageLogger for NullMessageLogger {
	async fn log(&self, _entry: &PushMessage) -> anyhow::Result<()> {
		Ok(())
	}
}

/// Writes entries into a `message_log` table.
#[derive(Clone)]
pub struct DbMessageLogger {
	backend: DbBackend,
}

#[derive(Clone)]
enum DbBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

/// Delivery status written for new rows.
const STATUS_ACCEPTED: i32 = 0;

impl DbMessageLogger {
	/// Connect and make sure the `message_log` table exists.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			DbBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			DbBackend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			DbBackend::Mysql(pool)
		} else {
			return Err(anyhow!("unsupported database_url for message log"));
		};

		let logger = Self { backend };
		logger.ensure_schema().await?;
		Ok(logger)
	}

	async fn ensure_schema(&self) -> anyhow::Result<()> {
		match &self.backend {
			DbBackend::Sqlite(pool) => {
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS message_log (\
					id INTEGER PRIMARY KEY AUTOINCREMENT, \
					uid TEXT NOT NULL, \
					message TEXT NOT NULL, \
					status INTEGER NOT NULL, \
					created_at INTEGER NOT NULL)",
				)
				.execute(pool)
				.await
				.context("create message_log (sqlite)")?;
			}
			DbBackend::Postgres(pool) => {
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS message_log (\
					id BIGSERIAL PRIMARY KEY, \
					uid TEXT NOT NULL, \
					message TEXT NOT NULL, \
					status INTEGER NOT NULL, \
					created_at TIMESTAMPTZ NOT NULL)",
				)
				.execute(pool)
				.await
				.context("create message_log (postgres)")?;
			}
			DbBackend::Mysql(pool) => {
				sqlx::query(
					"CREATE TABLE IF NOT EXISTS message_log (\
					id BIGINT AUTO_INCREMENT PRIMARY KEY, \
					uid VARCHAR(255) NOT NULL, \
					message TEXT NOT NULL, \
					status INT NOT NULL, \
					created_at DATETIME NOT NULL)",
				)
				.execute(pool)
				.await
				.context("create message_log (mysql)")?;
			}
		}

		Ok(())
	}
}

#[async_trait]
impl MessageLogger for DbMessageLogger {
	async fn log(&self, entry: &PushMessage) -> anyhow::Result<()> {
		let uid = entry.recipient.as_str();
		let message = entry.text.as_str();

		match &self.backend {
			DbBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO message_log (uid, message, status, created_at) \
					VALUES (?, ?, ?, strftime('%s','now'))",
				)
				.bind(uid)
				.bind(message)
				.bind(STATUS_ACCEPTED)
				.execute(pool)
				.await
				.context("insert message_log (sqlite)")?;
			}
			DbBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO message_log (uid, message, status, created_at) \
					VALUES ($1, $2, $3, NOW())",
				)
				.bind(uid)
				.bind(message)
				.bind(STATUS_ACCEPTED)
				.execute(pool)
				.await
				.context("insert message_log (postgres)")?;
			}
			DbBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO message_log (uid, message, status, created_at) \
					VALUES (?, ?, ?, NOW())",
				)
				.bind(uid)
				.bind(message)
				.bind(STATUS_ACCEPTED)
				.execute(pool)
				.await
				.context("insert message_log (mysql)")?;
			}
		}

		Ok(())
	}
}

/// Run `logger` off the send path; errors are logged and counted.
pub fn log_detached(logger: &Arc<dyn MessageLogger>, entry: PushMessage) {
	let logger = Arc::clone(logger);
	tokio::spawn(async move {
		if let Err(e) = logger.log(&entry).await {
			metrics::counter!("pushline_message_log_errors_total").increment(1);
			warn!(uid = %entry.recipient, error = %e, "message log failed");
		}
	});
}

#[cfg(test)]
mod tests {
	use super::*;
	use pushline_domain::Identifier;
	use sqlx::Row;

	fn entry(uid: &str, text: &str) -> PushMessage {
		PushMessage::new(Identifier::new(uid).unwrap(), text)
	}

	#[tokio::test]
	async fn sqlite_logger_persists_entries() {
		let dir = tempfile::tempdir().unwrap();
		let url = format!("sqlite://{}?mode=rwc", dir.path().join("log.db").display());

		let logger = DbMessageLogger::connect(&url).await.unwrap();
		logger.log(&entry("123", "Hello World")).await.unwrap();
		logger.log(&entry("456", "second")).await.unwrap();

		let DbBackend::Sqlite(pool) = &logger.backend else {
			panic!("expected sqlite backend");
		};
		let row = sqlx::query("SELECT uid, message, status FROM message_log ORDER BY id LIMIT 1")
			.fetch_one(pool)
			.await
			.unwrap();
		assert_eq!(row.get::<String, _>("uid"), "123");
		assert_eq!(row.get::<String, _>("message"), "Hello World");
		assert_eq!(row.get::<i32, _>("status"), 0);

		let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message_log")
			.fetch_one(pool)
			.await
			.unwrap();
		assert_eq!(count, 2);
	}

	#[tokio::test]
	async fn reconnecting_keeps_existing_schema() {
		let dir = tempfile::tempdir().unwrap();
		let url = format!("sqlite://{}?mode=rwc", dir.path().join("log.db").display());

		DbMessageLogger::connect(&url)
			.await
			.unwrap()
			.log(&entry("1", "a"))
			.await
			.unwrap();
		let again = DbMessageLogger::connect(&url).await.unwrap();
		again.log(&entry("1", "b")).await.unwrap();
	}

	#[tokio::test]
	async fn rejects_unknown_database_scheme() {
		let err = DbMessageLogger::connect("redis://localhost").await.err().expect("error");
		assert!(err.to_string().contains("unsupported"));
	}

	#[tokio::test]
	async fn stdout_and_null_loggers_never_fail() {
		StdoutMessageLogger.log(&entry("1", "x")).await.unwrap();
		NullMessageLogger.log(&entry("1", "x")).await.unwrap();
	}
}
