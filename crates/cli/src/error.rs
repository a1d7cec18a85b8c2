//! Agent errors and their HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
	#[error("session {0} not found")]
	SessionNotFound(String),

	#[error("agent is at capacity ({max} sessions)")]
	AtCapacity { max: usize },

	#[error("agent is shutting down")]
	ShuttingDown,

	#[error(transparent)]
	Session(#[from] gpud::Error),
}

impl AgentError {
	pub fn status(&self) -> StatusCode {
		match self {
			AgentError::SessionNotFound(_) => StatusCode::NOT_FOUND,
			AgentError::AtCapacity { .. } | AgentError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
			AgentError::Session(gpud::Error::SessionClosed { .. }) => StatusCode::GONE,
			AgentError::Session(gpud::Error::ConnectionStart { .. }) => StatusCode::BAD_GATEWAY,
			AgentError::Session(gpud::Error::GpuUnavailable { .. }) => StatusCode::CONFLICT,
			AgentError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	fn kind(&self) -> &'static str {
		match self {
			AgentError::SessionNotFound(_) => "not_found",
			AgentError::AtCapacity { .. } | AgentError::ShuttingDown => "unavailable",
			AgentError::Session(gpud::Error::SessionClosed { .. }) => "session_closed",
			AgentError::Session(gpud::Error::ConnectionStart { .. }) => "connection_start",
			AgentError::Session(gpud::Error::GpuUnavailable { .. }) => "gpu_unavailable",
			AgentError::Session(_) => "server_error",
		}
	}

	/// The message followed by every source, `: ` separated.
	pub fn chain(&self) -> String {
		let mut message = self.to_string();
		let mut source = std::error::Error::source(self);
		while let Some(cause) = source {
			message.push_str(": ");
			message.push_str(&cause.to_string());
			source = cause.source();
		}
		message
	}
}

impl IntoResponse for AgentError {
	fn into_response(self) -> Response {
		let body = Json(json!({
			"error": {
				"message": self.chain(),
				"type": self.kind(),
			}
		}));

		(self.status(), body).into_response()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_status_mapping() {
		let closed = AgentError::from(gpud::Error::SessionClosed {
			session_id: "s1".into(),
		});
		assert_eq!(closed.status(), StatusCode::GONE);

		let start = AgentError::from(gpud::Error::ConnectionStart {
			session_id: "s1".into(),
			connection_id: "c1".into(),
			source: anyhow::anyhow!("no such file"),
		});
		assert_eq!(start.status(), StatusCode::BAD_GATEWAY);
		assert!(start.chain().ends_with("no such file"));

		let shortage = AgentError::from(gpud::Error::GpuUnavailable {
			requested: 2,
			available: 1,
		});
		assert_eq!(shortage.status(), StatusCode::CONFLICT);

		assert_eq!(AgentError::SessionNotFound("x".into()).status(), StatusCode::NOT_FOUND);
		assert_eq!(AgentError::AtCapacity { max: 1 }.status(), StatusCode::SERVICE_UNAVAILABLE);
	}
}
