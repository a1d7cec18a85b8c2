//! Agent status reporting.

use serde::{Deserialize, Serialize};

use crate::gpu::Gpu;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
	Active,
	Closed,
}

/// Body of `GET /v1/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
	pub id: String,
	pub state: AgentState,
	pub version: String,
	pub hostname: String,
	pub address: String,
	pub max_sessions: usize,
	pub gpus: Vec<Gpu>,
	#[serde(default)]
	pub sessions: Vec<Session>,
}
