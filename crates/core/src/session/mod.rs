//! Session state machine.
//!
//! A session owns a GPU reservation and every connection opened against it.
//! All of its work runs in one [`TaskGroup`]; cancelling that group is the
//! single "stop" signal, whichever path requested it:
//!
//! - [`Session::cancel`] from the routing layer
//! - the idle ticker, after a full period with no connections
//! - cancellation of the supervising group handed to [`Session::run`]
//!
//! Every path ends in the closing watcher, which performs teardown once:
//! closed flag, join, GPU release, session-closed event.


use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use gpud_protocol::{self as protocol, ConnectionData, SessionState};
use gpud_runtime::{ConcurrentMap, Guarded, TaskGroup};
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{BoxStream, Connection, ConnectionFactory, UNKNOWN_EXIT_STATUS};
use crate::error::{Error, Result};
use crate::events::EventListener;
use crate::gpu::GpuReservation;

/// Idle period after which a non-persistent session without connections closes.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Immutable identity of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
	pub id: String,
	pub version: String,
	pub persistent: bool,
	pub idle_timeout: Duration,
}

impl SessionOptions {
	pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			version: version.into(),
			persistent: false,
			idle_timeout: IDLE_TIMEOUT,
		}
	}

	pub fn with_persistent(mut self, persistent: bool) -> Self {
		self.persistent = persistent;
		self
	}

	pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
		self.idle_timeout = idle_timeout;
		self
	}
}

pub struct Session {
	id: String,
	version: String,
	persistent: bool,
	idle_timeout: Duration,
	/// Taken exactly once, during teardown.
	gpus: Mutex<Option<Box<dyn GpuReservation>>>,
	closed: Guarded<bool>,
	connections: ConcurrentMap<String, Arc<dyn Connection>>,
	connections_changed: Notify,
	/// Fires after the session group has been joined.
	closing: CancellationToken,
	/// Fires once teardown has fully completed.
	finished: CancellationToken,
	tasks: TaskGroup,
	factory: Arc<dyn ConnectionFactory>,
	listener: Arc<dyn EventListener>,
	started: AtomicBool,
}

impl Session {
	/// Creates a session whose group is nested under `parent`.
	///
	/// The reservation is held until teardown. Nothing runs before
	/// [`run`](Self::run).
	pub fn new(
		parent: &TaskGroup,
		options: SessionOptions,
		gpus: Box<dyn GpuReservation>,
		factory: Arc<dyn ConnectionFactory>,
		listener: Arc<dyn EventListener>,
	) -> Arc<Self> {
		Arc::new(Self {
			id: options.id,
			version: options.version,
			persistent: options.persistent,
			idle_timeout: options.idle_timeout,
			gpus: Mutex::new(Some(gpus)),
			closed: Guarded::new(false),
			connections: ConcurrentMap::new(),
			connections_changed: Notify::new(),
			closing: CancellationToken::new(),
			finished: CancellationToken::new(),
			tasks: parent.child(),
			factory,
			listener,
			started: AtomicBool::new(false),
		})
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn version(&self) -> &str {
		&self.version
	}

	pub fn is_persistent(&self) -> bool {
		self.persistent
	}

	pub fn is_closed(&self) -> bool {
		self.closed.with_return(|closed| *closed)
	}

	pub fn connection_count(&self) -> usize {
		self.connections.len()
	}

	/// Starts the closing watcher, and the idle ticker unless persistent.
	///
	/// Both run in `group`, the supervising group of the owner. The watcher
	/// joins the session's own group, so it cannot be a member of it.
	pub fn run(self: &Arc<Self>, group: &TaskGroup) -> Result<()> {
		if self.started.swap(true, Ordering::SeqCst) {
			return Err(Error::AlreadyRunning {
				session_id: self.id.clone(),
			});
		}

		info!(
			target = "gpud.session",
			session = %self.id,
			version = %self.version,
			persistent = self.persistent,
			"session started"
		);

		let session = Arc::clone(self);
		group.spawn(format!("session {} closing", self.id), move |parent| async move {
			session.watch_closing(parent).await
		});

		if !self.persistent {
			let session = Arc::clone(self);
			group.spawn(format!("session {} idle", self.id), move |_| async move {
				session.tick().await;
				Ok(())
			});
		}

		Ok(())
	}

	/// Requests teardown. No-op once the session is closed.
	pub fn cancel(&self) {
		self.closed.with_return(|closed| {
			if !*closed {
				debug!(target = "gpud.session", session = %self.id, "cancel requested");
				self.tasks.cancel();
			}
		});
	}

	/// Routes `stream` to the connection named in `data`, creating it first
	/// if this id is new.
	pub fn connect(self: &Arc<Self>, data: ConnectionData, stream: BoxStream) -> Result<()> {
		self.closed.with_return(|closed| {
			if *closed {
				return Err(Error::SessionClosed {
					session_id: self.id.clone(),
				});
			}

			let connection = match self.connections.get(&data.id) {
				Some(existing) => existing,
				None => self.add_connection(data)?,
			};
			connection.attach(stream)
		})
	}

	fn add_connection(self: &Arc<Self>, data: ConnectionData) -> Result<Arc<dyn Connection>> {
		let pci_address = self
			.gpus
			.lock()
			.as_ref()
			.map(|gpus| gpus.pci_address_string())
			.unwrap_or_default();

		let connection = self.factory.create(data, &pci_address);
		let connection_id = connection.id().to_string();
		let (done, completed) = oneshot::channel();

		connection.start(&self.tasks, done).map_err(|source| Error::ConnectionStart {
			session_id: self.id.clone(),
			connection_id: connection_id.clone(),
			source,
		})?;

		self.connections.set(connection_id.clone(), Arc::clone(&connection));
		self.connections_changed.notify_one();
		self.listener.connection_created(&self.id, connection.data());
		info!(target = "gpud.session", session = %self.id, connection = %connection_id, "connection created");

		let session = Arc::clone(self);
		let watched = Arc::clone(&connection);
		self.tasks.spawn(
			format!("session {} connection {}", self.id, connection_id),
			move |_| async move {
				let status = match completed.await {
					Ok(status) => status,
					Err(_) => {
						warn!(
							target = "gpud.session",
							session = %session.id,
							connection = %watched.id(),
							"connection ended without reporting a status"
						);
						UNKNOWN_EXIT_STATUS
					}
				};

				session
					.connections
					.delete_if(watched.id(), |current| Arc::ptr_eq(current, &watched));
				session.connections_changed.notify_one();
				info!(
					target = "gpud.session",
					session = %session.id,
					connection = %watched.id(),
					status,
					"connection closed"
				);
				session.listener.connection_closed(&session.id, watched.data(), status);
				Ok(())
			},
		);

		Ok(connection)
	}

	/// Point-in-time view for the routing layer.
	///
	/// Built entirely while holding the closed flag, so teardown cannot start
	/// halfway through and an `Active` view always lists live connections.
	pub fn snapshot(&self) -> protocol::Session {
		self.closed.with_return(|closed| {
			if *closed {
				return protocol::Session {
					id: self.id.clone(),
					state: SessionState::Closed,
					version: self.version.clone(),
					gpus: Vec::new(),
					connections: Vec::new(),
					persistent: self.persistent,
				};
			}

			let gpus = self
				.gpus
				.lock()
				.as_ref()
				.map(|gpus| gpus.describe())
				.unwrap_or_default();
			let mut connections: Vec<ConnectionData> = self
				.connections
				.values()
				.iter()
				.map(|connection| connection.data().clone())
				.collect();
			connections.sort_by(|a, b| a.id.cmp(&b.id));

			protocol::Session {
				id: self.id.clone(),
				state: SessionState::Active,
				version: self.version.clone(),
				gpus,
				connections,
				persistent: self.persistent,
			}
		})
	}

	/// Resolves once teardown has completed and session-closed was emitted.
	pub async fn closed(&self) {
		self.finished.cancelled().await;
	}

	async fn watch_closing(self: Arc<Self>, parent: TaskGroup) -> anyhow::Result<()> {
		tokio::select! {
			_ = parent.cancelled() => {
				debug!(target = "gpud.session", session = %self.id, "supervising scope cancelled");
				self.cancel();
			}
			_ = self.tasks.cancelled() => {}
		}

		self.closed.with(|closed| *closed = true);
		info!(target = "gpud.session", session = %self.id, "session closing");

		let joined = self.tasks.wait().await;
		self.closing.cancel();

		let gpus = self.gpus.lock().take();
		if let Some(gpus) = gpus {
			gpus.release();
		}

		self.listener.session_closed(&self.id);
		self.finished.cancel();

		match joined {
			Ok(()) => {
				info!(target = "gpud.session", session = %self.id, "session closed");
				Ok(())
			}
			Err(e) => {
				warn!(target = "gpud.session", session = %self.id, error = %e, "session closed with task failures");
				Err(e.into())
			}
		}
	}

	async fn tick(&self) {
		let idle = tokio::time::sleep(self.idle_timeout);
		tokio::pin!(idle);
		let mut armed = self.connections.is_empty();

		loop {
			tokio::select! {
				_ = self.closing.cancelled() => return,
				_ = &mut idle, if armed => {
					info!(
						target = "gpud.session",
						session = %self.id,
						idle_secs = self.idle_timeout.as_secs(),
						"idle timeout, closing session"
					);
					armed = false;
					self.cancel();
				}
				_ = self.connections_changed.notified() => {
					if self.connections.is_empty() {
						idle.as_mut().reset(Instant::now() + self.idle_timeout);
						armed = true;
					} else {
						armed = false;
					}
				}
			}
		}
	}
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("id", &self.id)
			.field("version", &self.version)
			.field("persistent", &self.persistent)
			.field("connections", &self.connections.len())
			.field("closed", &self.is_closed())
			.finish()
	}
}
