//! The contract a session expects from a tunneled connection.

use std::sync::Arc;

use gpud_protocol::ConnectionData;
use gpud_runtime::TaskGroup;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::error::Result;

/// Exit status reported when a connection ends.
pub type ExitStatus = i32;

/// Reported when the real status is unknown (signal death, lost completion).
pub const UNKNOWN_EXIT_STATUS: ExitStatus = -1;

/// A physical duplex byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxStream = Box<dyn Stream>;

/// Receives the single exit status of a connection.
pub type Completion = oneshot::Sender<ExitStatus>;

/// One logical connection, re-attachable to fresh physical streams.
pub trait Connection: Send + Sync {
	fn data(&self) -> &ConnectionData;

	fn id(&self) -> &str {
		&self.data().id
	}

	/// Launches the underlying work under `group`.
	///
	/// Exactly one status must be sent on `completion` once the work ends,
	/// including when `group` is cancelled.
	fn start(&self, group: &TaskGroup, completion: Completion) -> anyhow::Result<()>;

	/// Binds `stream` to this connection, replacing any current stream.
	///
	/// Must not block. On error the stream is dropped, which closes it.
	fn attach(&self, stream: BoxStream) -> Result<()>;
}

/// Creates connections for a session.
pub trait ConnectionFactory: Send + Sync {
	/// `pci_address` lists the session's GPUs, comma separated.
	fn create(&self, data: ConnectionData, pci_address: &str) -> Arc<dyn Connection>;
}
