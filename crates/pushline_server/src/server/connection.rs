#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use pushline_domain::{Identifier, PushMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::server::pending::PendingCounter;
use crate::server::registry::{ConnectionHandle, DEFAULT_QUEUE_CAPACITY, OutboundQueue, Registry, RegistryError};

/// Deadline for a single outbound frame.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Largest message a peer may send.
pub const DEFAULT_MAX_INBOUND_MESSAGE_SIZE: usize = 512;

/// Deadline for the error frame sent to a peer that failed authentication.
pub const DEFAULT_AUTH_ERROR_WRITE_WAIT: Duration = Duration::from_secs(1);

/// Close codes below this are normal/going-away and are not reported.
const ABNORMAL_CLOSE_CODE: u16 = 1002;

/// Called when an outbound write fails.
pub type DeliveryErrorHandler = Arc<dyn Fn(&PushMessage, &anyhow::Error) + Send + Sync>;

pub fn default_error_handler() -> DeliveryErrorHandler {
	Arc::new(|msg: &PushMessage, err: &anyhow::Error| {
		warn!(message = %msg.to_log_json(), error = %err, "send message failed");
	})
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub queue_capacity: usize,
	pub write_wait: Duration,
	pub max_inbound_message_size: usize,
	pub auth_error_write_wait: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			queue_capacity: DEFAULT_QUEUE_CAPACITY,
			write_wait: DEFAULT_WRITE_WAIT,
			max_inbound_message_size: DEFAULT_MAX_INBOUND_MESSAGE_SIZE,
			auth_error_write_wait: DEFAULT_AUTH_ERROR_WRITE_WAIT,
		}
	}
}

impl ConnectionSettings {
	/// tungstenite limits for accepted sockets.
	pub fn websocket_config(&self) -> WebSocketConfig {
		WebSocketConfig::default()
			.max_message_size(Some(self.max_inbound_message_size))
			.max_frame_size(Some(self.max_inbound_message_size))
	}
}

/// Shared collaborators of every connection.
#[derive(Clone)]
pub struct ConnectionContext {
	pub registry: Registry,
	pub pending: PendingCounter,
	pub error_handler: DeliveryErrorHandler,
	pub settings: ConnectionSettings,
}

/// The two loops of an admitted connection.
#[derive(Debug)]
pub struct ConnectionTasks {
	pub handle: ConnectionHandle,
	pub inbound: JoinHandle<()>,
	pub outbound: JoinHandle<()>,
}

impl ConnectionTasks {
	/// Wait for both loops to finish.
	pub async fn join(self) {
		let _ = self.inbound.await;
		let _ = self.outbound.await;
	}
}

/// Register the connection, then start its inbound and outbound loops.
///
/// The handle is discoverable through the registry before either loop runs.
pub async fn admit<S>(
	conn_id: u64,
	identifier: Identifier,
	ws: WebSocketStream<S>,
	ctx: ConnectionContext,
) -> Result<ConnectionTasks, RegistryError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (handle, queue) = ConnectionHandle::new(conn_id, identifier, ctx.settings.queue_capacity);

	if let Err(e) = ctx.registry.register(handle.clone()).await {
		let mut ws = ws;
		let _ = timeout(ctx.settings.write_wait, ws.close(None)).await;
		return Err(e);
	}

	metrics::counter!("pushline_connections_admitted_total").increment(1);
	info!(conn_id, uid = %handle.identifier(), "connection admitted");

	let (sink, stream) = ws.split();
	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let outbound = tokio::spawn(run_outbound(handle.clone(), sink, queue, shutdown_tx, ctx.clone()));
	let inbound = tokio::spawn(run_inbound(handle.clone(), stream, shutdown_rx, ctx));

	Ok(ConnectionTasks {
		handle,
		inbound,
		outbound,
	})
}

/// Tell a peer why it was not admitted, then close.
pub async fn reject<S>(mut ws: WebSocketStream<S>, reason: &str, write_wait: Duration)
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let text = format!("authenticate error: {reason}");
	match timeout(write_wait, ws.send(Message::Text(text.into()))).await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => debug!(error = %e, "failed to deliver authentication error"),
		Err(_) => debug!("authentication error write timed out"),
	}
	let _ = timeout(write_wait, ws.close(None)).await;
}

/// Drain and discard peer frames until the connection ends, then deregister.
async fn run_inbound<S>(
	handle: ConnectionHandle,
	mut stream: SplitStream<WebSocketStream<S>>,
	mut shutdown: watch::Receiver<bool>,
	ctx: ConnectionContext,
) where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let conn_id = handle.conn_id();

	loop {
		tokio::select! {
			frame = stream.next() => match frame {
				Some(Ok(Message::Close(frame))) => {
					log_close(conn_id, handle.identifier(), frame.as_ref());
					break;
				}
				Some(Ok(_)) => {}
				Some(Err(e)) => {
					debug!(conn_id, uid = %handle.identifier(), error = %e, "connection read ended");
					break;
				}
				None => {
					debug!(conn_id, uid = %handle.identifier(), "connection stream ended");
					break;
				}
			},
			_ = shutdown.changed() => {
				debug!(conn_id, uid = %handle.identifier(), "inbound loop stopping after outbound exit");
				break;
			}
		}
	}

	match ctx.registry.unregister(&handle).await {
		Ok(removed) => {
			if removed {
				info!(conn_id, uid = %handle.identifier(), "connection removed");
			} else {
				debug!(conn_id, uid = %handle.identifier(), "connection was already superseded");
			}
		}
		Err(e) => warn!(conn_id, error = %e, "failed to unregister connection"),
	}
}

/// Write queued messages until the queue is closed or a write fails.
async fn run_outbound<S>(
	handle: ConnectionHandle,
	mut sink: SplitSink<WebSocketStream<S>, Message>,
	mut queue: OutboundQueue,
	shutdown: watch::Sender<bool>,
	ctx: ConnectionContext,
) where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let conn_id = handle.conn_id();

	loop {
		let Some(msg) = queue.next().await else {
			let dropped = queue.shut();
			ctx.pending.sub(dropped);
			debug!(conn_id, uid = %handle.identifier(), dropped, "outbound queue closed");
			break;
		};

		let frame = Message::Text(msg.text.clone().into());
		let result = match timeout(ctx.settings.write_wait, sink.send(frame)).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(e)) => Err(anyhow::Error::from(e)),
			Err(_) => Err(anyhow!("write timed out after {:?}", ctx.settings.write_wait)),
		};

		match result {
			Ok(()) => {
				ctx.pending.sub(1);
				metrics::counter!("pushline_messages_delivered_total").increment(1);
			}
			Err(e) => {
				metrics::counter!("pushline_messages_failed_total").increment(1);
				(ctx.error_handler)(&msg, &e);

				// The failed message is resolved too.
				let dropped = queue.shut();
				ctx.pending.sub(dropped + 1);
				debug!(conn_id, uid = %handle.identifier(), dropped, "outbound loop stopping after write failure");
				break;
			}
		}
	}

	let _ = shutdown.send(true);
	let _ = timeout(ctx.settings.write_wait, sink.close()).await;
}

fn log_close(conn_id: u64, uid: &Identifier, frame: Option<&CloseFrame>) {
	let Some(frame) = frame else {
		debug!(conn_id, uid = %uid, "connection closed by peer");
		return;
	};

	let code = u16::from(frame.code);
	if code >= ABNORMAL_CLOSE_CODE {
		warn!(conn_id, uid = %uid, code, reason = %frame.reason, "connection closed abnormally");
	} else {
		debug!(conn_id, uid = %uid, code, "connection closed by peer");
	}
}
