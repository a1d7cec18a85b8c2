//! Session and connection shapes.

use serde::{Deserialize, Serialize};

use crate::gpu::{Gpu, GpuRequirements};

/// Client-side process metadata identifying one tunneled connection.
///
/// The `id` is chosen by the client and is unique within a session; reusing
/// it reattaches a fresh stream to the same logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionData {
	pub id: String,
	/// Client process id, kept as reported (it is never interpreted locally).
	#[serde(default)]
	pub pid: String,
	#[serde(default)]
	pub process_name: String,
}

/// Session state as exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
	Active,
	Closed,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
	pub id: String,
	pub state: SessionState,
	pub version: String,
	/// GPUs held by the session; empty once closed.
	pub gpus: Vec<Gpu>,
	/// Live connections; empty once closed.
	pub connections: Vec<ConnectionData>,
	pub persistent: bool,
}

/// Body of `POST /v1/request/session`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSession {
	/// Client version string, echoed back in session snapshots.
	pub version: String,
	/// Persistent sessions are never closed for being idle.
	#[serde(default)]
	pub persistent: bool,
	/// One entry per GPU wanted.
	#[serde(default)]
	pub gpus: Vec<GpuRequirements>,
}
