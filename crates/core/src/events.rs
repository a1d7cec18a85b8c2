use gpud_protocol::ConnectionData;

use crate::connection::ExitStatus;

/// Receives session lifecycle notifications.
///
/// Calls are fire-and-forget and may arrive from any task. Implementations
/// must not call back into the session that emitted the event:
/// `connection_created` runs inside the session's critical section.
pub trait EventListener: Send + Sync {
	fn session_closed(&self, session_id: &str);

	fn connection_created(&self, session_id: &str, connection: &ConnectionData);

	fn connection_closed(&self, session_id: &str, connection: &ConnectionData, exit_status: ExitStatus);
}
