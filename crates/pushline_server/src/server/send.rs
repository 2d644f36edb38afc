#![forbid(unsafe_code)]

use hyper::StatusCode;
use pushline_domain::{Identifier, PushMessage};
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::server::message_log::log_detached;
use crate::server::registry::EnqueueError;
use crate::server::state::AppState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
	#[error("uid is required")]
	MissingRecipient,
	#[error("client not found: {0}")]
	UnknownRecipient(String),
	#[error("recipient queue full: {0}")]
	QueueFull(Identifier),
}

impl SendError {
	pub fn status(&self) -> StatusCode {
		match self {
			SendError::MissingRecipient | SendError::UnknownRecipient(_) => StatusCode::BAD_REQUEST,
			SendError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
		}
	}
}

/// Queue `text` for the connection currently registered under `uid`.
///
/// Returns once the message is in the recipient's queue, which may wait for space when the
/// queue is full. This is not a delivery acknowledgement.
pub async fn send_message(state: &AppState, uid: Option<&str>, text: String) -> Result<(), SendError> {
	let uid = uid.unwrap_or_default();
	let recipient = Identifier::new(uid).map_err(|_| SendError::MissingRecipient)?;
	let handle = state
		.registry()
		.lookup(&recipient)
		.ok_or_else(|| SendError::UnknownRecipient(uid.to_string()))?;
	if handle.is_closed() {
		return Err(SendError::UnknownRecipient(uid.to_string()));
	}

	let msg = PushMessage::new(recipient.clone(), text);
	log_detached(&state.logger, msg.clone());

	let pending = state.pending();
	pending.add(1);

	let result = match state.enqueue_timeout {
		None => handle.enqueue(msg).await,
		Some(limit) => match timeout(limit, handle.enqueue(msg)).await {
			Ok(r) => r,
			Err(_) => {
				pending.sub(1);
				metrics::counter!("pushline_send_queue_full_total").increment(1);
				debug!(uid = %recipient, queued = handle.queue_len(), "recipient queue full; giving up");
				return Err(SendError::QueueFull(recipient));
			}
		},
	};

	match result {
		Ok(()) => {
			metrics::counter!("pushline_messages_accepted_total").increment(1);
			Ok(())
		}
		Err(EnqueueError::Closed) => {
			pending.sub(1);
			debug!(uid = %recipient, conn_id = handle.conn_id(), "recipient disconnected before enqueue");
			Err(SendError::UnknownRecipient(uid.to_string()))
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::time::Duration;

	use pushline_domain::SecretString;

	use super::*;
	use crate::server::auth::JwtAuthenticator;
	use crate::server::connection::ConnectionSettings;
	use crate::server::message_log::NullMessageLogger;
	use crate::server::registry::{ConnectionHandle, RegistryConfig};
	use crate::server::state::AppStateConfig;

	fn state(enqueue_timeout: Option<Duration>) -> AppState {
		AppState::new(AppStateConfig {
			authenticator: Arc::new(JwtAuthenticator::new(SecretString::new("secret"))),
			logger: Arc::new(NullMessageLogger),
			settings: ConnectionSettings::default(),
			registry: RegistryConfig::default(),
			enqueue_timeout,
			error_handler: None,
		})
	}

	#[tokio::test]
	async fn full_queue_times_out_and_is_not_counted() {
		let state = state(Some(Duration::from_millis(30)));
		let (handle, _queue) = ConnectionHandle::new(1, Identifier::new("123").unwrap(), 1);
		state.registry().register(handle).await.unwrap();

		send_message(&state, Some("123"), "first".to_string()).await.unwrap();
		assert_eq!(state.pending().load(), 1);

		let err = send_message(&state, Some("123"), "second".to_string()).await.unwrap_err();
		assert_eq!(err, SendError::QueueFull(Identifier::new("123").unwrap()));
		assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(err.to_string(), "recipient queue full: 123");
		assert_eq!(state.pending().load(), 1);
	}

	#[tokio::test]
	async fn closed_queue_reads_as_unknown_recipient() {
		let state = state(None);
		let (handle, _queue) = ConnectionHandle::new(1, Identifier::new("123").unwrap(), 4);
		state.registry().register(handle.clone()).await.unwrap();
		handle.close_queue();

		let err = send_message(&state, Some("123"), "late".to_string()).await.unwrap_err();
		assert_eq!(err, SendError::UnknownRecipient("123".to_string()));
		assert_eq!(err.status(), StatusCode::BAD_REQUEST);
		assert_eq!(state.pending().load(), 0);
	}

	#[tokio::test]
	async fn missing_recipient_is_rejected_before_lookup() {
		let state = state(None);
		assert_eq!(
			send_message(&state, None, "x".to_string()).await,
			Err(SendError::MissingRecipient)
		);
		assert_eq!(
			send_message(&state, Some(""), "x".to_string()).await,
			Err(SendError::MissingRecipient)
		);
	}
}
