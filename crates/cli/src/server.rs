//! HTTP routing for the agent.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gpud_protocol::{AgentStatus, ConnectionData, RequestSession, Session};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::error::AgentError;
use crate::tunnel;

pub fn create_router(agent: Arc<Agent>) -> Router {
	Router::new()
		.route("/v1/status", get(status))
		.route("/v1/request/session", post(request_session))
		.route("/v1/session/{id}", get(get_session).delete(cancel_session))
		.route("/v1/connect/session/{id}", get(connect_session))
		.with_state(agent)
}

/// Serves until `signal` resolves, then cancels every session and waits for
/// their teardown.
pub async fn serve<F>(listener: TcpListener, agent: Arc<Agent>, signal: F) -> Result<()>
where
	F: Future<Output = ()> + Send + 'static,
{
	let addr = listener.local_addr().context("listener has no local address")?;
	info!(target = "gpud.http", %addr, agent = agent.id(), "agent listening");

	let stopping = Arc::clone(&agent);
	let shutdown = async move {
		signal.await;
		stopping.cancel();
	};

	axum::serve(listener, create_router(Arc::clone(&agent)))
		.with_graceful_shutdown(shutdown)
		.await
		.context("HTTP server error")?;

	agent.shutdown().await
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		match signal(SignalKind::terminate()) {
			Ok(mut sigterm) => {
				tokio::select! {
					_ = sigterm.recv() => info!(target = "gpud.agent", "received SIGTERM, shutting down"),
					_ = tokio::signal::ctrl_c() => info!(target = "gpud.agent", "received SIGINT, shutting down"),
				}
				return;
			}
			Err(e) => warn!(target = "gpud.agent", error = %e, "failed to install SIGTERM handler"),
		}
	}

	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(target = "gpud.agent", error = %e, "failed to wait for Ctrl-C");
		std::future::pending::<()>().await;
	}
	info!(target = "gpud.agent", "received SIGINT, shutting down");
}

async fn status(State(agent): State<Arc<Agent>>) -> Json<AgentStatus> {
	Json(agent.status())
}

async fn request_session(
	State(agent): State<Arc<Agent>>,
	Json(request): Json<RequestSession>,
) -> Result<String, AgentError> {
	agent.request_session(request)
}

async fn get_session(State(agent): State<Arc<Agent>>, Path(id): Path<String>) -> Result<Json<Session>, AgentError> {
	Ok(Json(agent.session(&id)?.snapshot()))
}

async fn cancel_session(State(agent): State<Arc<Agent>>, Path(id): Path<String>) -> Result<StatusCode, AgentError> {
	agent.cancel_session(&id)?;
	debug!(target = "gpud.http", session = %id, "cancel requested over HTTP");
	Ok(StatusCode::NO_CONTENT)
}

async fn connect_session(
	State(agent): State<Arc<Agent>>,
	Path(id): Path<String>,
	Query(data): Query<ConnectionData>,
	ws: WebSocketUpgrade,
) -> Result<Response, AgentError> {
	let session = agent.session(&id)?;
	if session.is_closed() {
		return Err(gpud::Error::SessionClosed { session_id: id }.into());
	}

	Ok(ws
		.on_upgrade(move |socket| tunnel::handle_socket(socket, agent, id, data))
		.into_response())
}
