//! Error types for session and connection handling.

use thiserror::Error;

/// Result type alias for gpud operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	/// The session has started tearing down; nothing new is accepted.
	#[error("session {session_id} is closed")]
	SessionClosed { session_id: String },

	/// The connection's workload could not be launched. Nothing was registered.
	#[error("session {session_id} connection {connection_id} failed to start")]
	ConnectionStart {
		session_id: String,
		connection_id: String,
		#[source]
		source: anyhow::Error,
	},

	/// The connection refused a new stream.
	#[error("connection {connection_id} cannot accept a stream: {reason}")]
	Attach { connection_id: String, reason: String },

	#[error("session {session_id} is already running")]
	AlreadyRunning { session_id: String },

	#[error("not enough free GPUs: requested {requested}, {available} available")]
	GpuUnavailable { requested: usize, available: usize },
}

impl Error {
	/// Returns true if the operation hit a session that is closing or closed.
	pub fn is_closed(&self) -> bool {
		matches!(self, Error::SessionClosed { .. })
	}

	/// Returns true if a workload failed to launch.
	pub fn is_start_failure(&self) -> bool {
		matches!(self, Error::ConnectionStart { .. })
	}
}
