#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use pushline_domain::{Identifier, PushMessage};
use thiserror::Error;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, info};

/// Default per-connection outbound queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Configuration for `Registry`.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
	/// Buffered admission/removal commands waiting for the owner task.
	pub command_channel_capacity: usize,

	/// Initial table capacity.
	pub initial_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			command_channel_capacity: 64,
			initial_capacity: DEFAULT_QUEUE_CAPACITY,
			debug_logs: false,
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
	#[error("registry owner task is gone")]
	Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnqueueError {
	/// The queue was closed before or while waiting for space.
	#[error("connection queue closed")]
	Closed,
}

/// A live connection as seen by senders: identity plus the producer side of its outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
	inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
	conn_id: u64,
	identifier: Identifier,
	sender: mpsc::Sender<PushMessage>,
	close: Arc<QueueClose>,
}

#[derive(Debug, Default)]
struct QueueClose {
	closed: AtomicBool,
	notify: Notify,
}

/// Consumer side of a connection's outbound queue, owned by its outbound loop.
#[derive(Debug)]
pub struct OutboundQueue {
	rx: mpsc::Receiver<PushMessage>,
	close: Arc<QueueClose>,
}

impl ConnectionHandle {
	/// Create a handle and its queue with room for `capacity` messages.
	pub fn new(conn_id: u64, identifier: Identifier, capacity: usize) -> (Self, OutboundQueue) {
		let (sender, rx) = mpsc::channel(capacity.max(1));
		let close = Arc::new(QueueClose::default());
		let handle = Self {
			inner: Arc::new(HandleInner {
				conn_id,
				identifier,
				sender,
				close: Arc::clone(&close),
			}),
		};
		(handle, OutboundQueue { rx, close })
	}

	pub fn conn_id(&self) -> u64 {
		self.inner.conn_id
	}

	pub fn identifier(&self) -> &Identifier {
		&self.inner.identifier
	}

	/// Messages currently buffered.
	pub fn queue_len(&self) -> usize {
		self.inner.sender.max_capacity() - self.inner.sender.capacity()
	}

	pub fn is_closed(&self) -> bool {
		self.inner.close.closed.load(Ordering::Acquire) || self.inner.sender.is_closed()
	}

	/// Append to the queue, waiting for space while it is full.
	pub async fn enqueue(&self, msg: PushMessage) -> Result<(), EnqueueError> {
		if self.inner.close.closed.load(Ordering::Acquire) {
			return Err(EnqueueError::Closed);
		}
		self.inner.sender.send(msg).await.map_err(|_| EnqueueError::Closed)
	}

	/// Signal the outbound loop that no more messages will be delivered.
	///
	/// Returns `true` only for the call that actually closed the queue.
	pub(crate) fn close_queue(&self) -> bool {
		if self.inner.close.closed.swap(true, Ordering::AcqRel) {
			return false;
		}
		self.inner.close.notify.notify_one();
		true
	}

	fn same_connection(&self, other: &ConnectionHandle) -> bool {
		self.inner.conn_id == other.inner.conn_id
	}
}

impl OutboundQueue {
	/// Next message in FIFO order, or `None` once the queue has been closed.
	pub async fn next(&mut self) -> Option<PushMessage> {
		if self.close.closed.load(Ordering::Acquire) {
			return None;
		}

		tokio::select! {
			biased;
			_ = self.close.notify.notified() => None,
			msg = self.rx.recv() => msg,
		}
	}

	/// Stop accepting messages and discard what is buffered, returning how many were discarded.
	///
	/// Blocked senders are released with `EnqueueError::Closed`.
	pub fn shut(&mut self) -> usize {
		self.close.closed.store(true, Ordering::Release);
		self.rx.close();

		let mut dropped = 0;
		while self.rx.try_recv().is_ok() {
			dropped += 1;
		}
		dropped
	}
}

enum RegistryCommand {
	Register {
		handle: ConnectionHandle,
		done: oneshot::Sender<Option<ConnectionHandle>>,
	},
	Unregister {
		handle: ConnectionHandle,
		done: oneshot::Sender<bool>,
	},
}

type Table = Arc<RwLock<HashMap<Identifier, ConnectionHandle>>>;

/// Identifier to connection table.
///
/// All mutations go through one owner task and are acknowledged before `register` or
/// `unregister` return; lookups read the table directly under a shared lock.
#[derive(Debug, Clone)]
pub struct Registry {
	commands: mpsc::Sender<RegistryCommand>,
	table: Table,
}

impl std::fmt::Debug for RegistryCommand {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RegistryCommand::Register { handle, .. } => f.debug_struct("Register").field("conn_id", &handle.conn_id()).finish(),
			RegistryCommand::Unregister { handle, .. } => {
				f.debug_struct("Unregister").field("conn_id", &handle.conn_id()).finish()
			}
		}
	}
}

impl Registry {
	/// Create the registry and spawn its owner task.
	pub fn spawn(cfg: RegistryConfig) -> Self {
		let (commands, commands_rx) = mpsc::channel(cfg.command_channel_capacity.max(1));
		let table: Table = Arc::new(RwLock::new(HashMap::with_capacity(cfg.initial_capacity)));

		tokio::spawn(run_owner(commands_rx, Arc::clone(&table), cfg.debug_logs));

		Self { commands, table }
	}

	/// Admit `handle`, replacing any entry with the same identifier.
	///
	/// The replaced handle is returned untouched; it is not closed here.
	pub async fn register(&self, handle: ConnectionHandle) -> Result<Option<ConnectionHandle>, RegistryError> {
		let (done, done_rx) = oneshot::channel();
		self.commands
			.send(RegistryCommand::Register { handle, done })
			.await
			.map_err(|_| RegistryError::Closed)?;
		done_rx.await.map_err(|_| RegistryError::Closed)
	}

	/// Remove `handle` if it is still the current entry for its identifier, and close its queue.
	///
	/// Returns whether the table entry was removed.
	pub async fn unregister(&self, handle: &ConnectionHandle) -> Result<bool, RegistryError> {
		let (done, done_rx) = oneshot::channel();
		self.commands
			.send(RegistryCommand::Unregister {
				handle: handle.clone(),
				done,
			})
			.await
			.map_err(|_| RegistryError::Closed)?;
		done_rx.await.map_err(|_| RegistryError::Closed)
	}

	pub fn lookup(&self, identifier: &Identifier) -> Option<ConnectionHandle> {
		self.table.read().get(identifier).cloned()
	}

	pub fn live_count(&self) -> usize {
		self.table.read().len()
	}
}

async fn run_owner(mut commands: mpsc::Receiver<RegistryCommand>, table: Table, debug_logs: bool) {
	while let Some(cmd) = commands.recv().await {
		match cmd {
			RegistryCommand::Register { handle, done } => {
				let conn_id = handle.conn_id();
				let identifier = handle.identifier().clone();
				let (prev, live) = {
					let mut table = table.write();
					let prev = table.insert(identifier.clone(), handle);
					(prev, table.len())
				};
				metrics::gauge!("pushline_connections").set(live as f64);

				if let Some(prev) = &prev {
					info!(
						uid = %identifier,
						conn_id,
						replaced_conn_id = prev.conn_id(),
						"registry: replaced existing connection"
					);
				} else if debug_logs {
					debug!(uid = %identifier, conn_id, live, "registry: registered");
				}

				let _ = done.send(prev);
			}
			RegistryCommand::Unregister { handle, done } => {
				let (removed, live) = {
					let mut table = table.write();
					let current = table.get(handle.identifier()).is_some_and(|cur| cur.same_connection(&handle));
					if current {
						table.remove(handle.identifier());
					}
					(current, table.len())
				};
				handle.close_queue();
				metrics::gauge!("pushline_connections").set(live as f64);

				if debug_logs {
					debug!(
						uid = %handle.identifier(),
						conn_id = handle.conn_id(),
						removed,
						live,
						"registry: unregistered"
					);
				}

				let _ = done.send(removed);
			}
		}
	}

	debug!("registry: command channel closed; owner exiting");
}
