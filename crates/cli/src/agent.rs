//! The host agent: owns the GPU pool and every live session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use gpud::{BoxStream, ConnectionFactory, EventListener, ExitStatus, GpuPool, Session, SessionOptions};
use gpud_protocol::{AgentState, AgentStatus, ConnectionData, RequestSession};
use gpud_runtime::{ConcurrentMap, TaskGroup};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AgentError, Result};

/// Static facts the agent reports about itself.
#[derive(Debug, Clone)]
pub struct AgentInfo {
	pub hostname: String,
	pub address: String,
	pub max_sessions: usize,
	pub idle_timeout: Duration,
}

pub struct Agent {
	id: String,
	info: AgentInfo,
	root: TaskGroup,
	pool: GpuPool,
	sessions: ConcurrentMap<String, Arc<Session>>,
	factory: Arc<dyn ConnectionFactory>,
	listener: Arc<SessionEvents>,
	closed: AtomicBool,
	/// Serializes the capacity check with insertion.
	admission: Mutex<()>,
}

impl Agent {
	pub fn new(info: AgentInfo, pool: GpuPool, factory: Arc<dyn ConnectionFactory>) -> Self {
		let sessions = ConcurrentMap::new();
		let listener = Arc::new(SessionEvents {
			sessions: sessions.clone(),
		});

		Self {
			id: Uuid::new_v4().to_string(),
			info,
			root: TaskGroup::new(),
			pool,
			sessions,
			factory,
			listener,
			closed: AtomicBool::new(false),
			admission: Mutex::new(()),
		}
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	/// Reserves GPUs for a new session and starts it. Returns the session id.
	pub fn request_session(&self, request: RequestSession) -> Result<String> {
		let _admission = self.admission.lock();
		if self.closed.load(Ordering::SeqCst) {
			return Err(AgentError::ShuttingDown);
		}
		if self.sessions.len() >= self.info.max_sessions {
			return Err(AgentError::AtCapacity {
				max: self.info.max_sessions,
			});
		}

		let gpus = self.pool.select(&request.gpus)?;
		let id = Uuid::new_v4().to_string();
		let options = SessionOptions::new(id.clone(), request.version)
			.with_persistent(request.persistent)
			.with_idle_timeout(self.info.idle_timeout);

		let session = Session::new(
			&self.root,
			options,
			Box::new(gpus),
			Arc::clone(&self.factory),
			Arc::clone(&self.listener) as Arc<dyn EventListener>,
		);
		self.sessions.set(id.clone(), Arc::clone(&session));
		session.run(&self.root)?;

		info!(
			target = "gpud.agent",
			session = %id,
			persistent = session.is_persistent(),
			gpus = request.gpus.len(),
			"session requested"
		);
		Ok(id)
	}

	pub fn session(&self, id: &str) -> Result<Arc<Session>> {
		self.sessions
			.get(id)
			.ok_or_else(|| AgentError::SessionNotFound(id.to_string()))
	}

	pub fn connect(&self, id: &str, data: ConnectionData, stream: BoxStream) -> Result<()> {
		let session = self.session(id)?;
		session.connect(data, stream)?;
		Ok(())
	}

	pub fn cancel_session(&self, id: &str) -> Result<()> {
		self.session(id)?.cancel();
		Ok(())
	}

	pub fn status(&self) -> AgentStatus {
		let mut sessions: Vec<_> = self.sessions.values().iter().map(|s| s.snapshot()).collect();
		sessions.sort_by(|a, b| a.id.cmp(&b.id));

		AgentStatus {
			id: self.id.clone(),
			state: if self.closed.load(Ordering::SeqCst) {
				AgentState::Closed
			} else {
				AgentState::Active
			},
			version: env!("CARGO_PKG_VERSION").to_string(),
			hostname: self.info.hostname.clone(),
			address: self.info.address.clone(),
			max_sessions: self.info.max_sessions,
			gpus: self.pool.gpus().to_vec(),
			sessions,
		}
	}

	/// Stops accepting sessions and cancels every live one.
	pub fn cancel(&self) {
		let _admission = self.admission.lock();
		if !self.closed.swap(true, Ordering::SeqCst) {
			info!(target = "gpud.agent", sessions = self.sessions.len(), "agent stopping");
		}
		self.root.cancel();
	}

	/// Cancels everything and waits for every session to finish teardown.
	pub async fn shutdown(&self) -> anyhow::Result<()> {
		self.cancel();
		self.root
			.wait()
			.await
			.context("sessions did not shut down cleanly")?;
		info!(target = "gpud.agent", "agent stopped");
		Ok(())
	}
}

impl std::fmt::Debug for Agent {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Agent")
			.field("id", &self.id)
			.field("sessions", &self.sessions.len())
			.field("pool", &self.pool)
			.finish()
	}
}

/// Logs session events and forgets sessions once they have closed.
struct SessionEvents {
	sessions: ConcurrentMap<String, Arc<Session>>,
}

impl EventListener for SessionEvents {
	fn session_closed(&self, session_id: &str) {
		self.sessions.delete(session_id);
		info!(target = "gpud.agent", session = %session_id, "session closed");
	}

	fn connection_created(&self, session_id: &str, connection: &ConnectionData) {
		debug!(
			target = "gpud.agent",
			session = %session_id,
			connection = %connection.id,
			pid = %connection.pid,
			process = %connection.process_name,
			"connection created"
		);
	}

	fn connection_closed(&self, session_id: &str, connection: &ConnectionData, exit_status: ExitStatus) {
		debug!(
			target = "gpud.agent",
			session = %session_id,
			connection = %connection.id,
			exit_status,
			"connection closed"
		);
	}
}

#[cfg(test)]
mod tests {
	use gpud::{Completion, Connection};
	use gpud_protocol::{Gpu, GpuRequirements, SessionState};

	use super::*;

	struct IdleConnection {
		data: ConnectionData,
	}

	impl Connection for IdleConnection {
		fn data(&self) -> &ConnectionData {
			&self.data
		}

		fn start(&self, group: &TaskGroup, completion: Completion) -> anyhow::Result<()> {
			group.spawn("idle", move |g| async move {
				g.cancelled().await;
				let _ = completion.send(0);
				Ok(())
			});
			Ok(())
		}

		fn attach(&self, _stream: BoxStream) -> gpud::Result<()> {
			Ok(())
		}
	}

	struct IdleFactory;

	impl ConnectionFactory for IdleFactory {
		fn create(&self, data: ConnectionData, _pci_address: &str) -> Arc<dyn Connection> {
			Arc::new(IdleConnection { data })
		}
	}

	fn agent(max_sessions: usize, gpus: usize) -> Agent {
		let pool = GpuPool::new(
			(0..gpus as u32)
				.map(|index| Gpu {
					index,
					name: "test".into(),
					pci_bus: format!("0000:0{index}:00.0"),
					vram: 16,
				})
				.collect(),
		);
		let info = AgentInfo {
			hostname: "host".into(),
			address: "127.0.0.1:0".into(),
			max_sessions,
			idle_timeout: Duration::from_secs(30),
		};
		Agent::new(info, pool, Arc::new(IdleFactory))
	}

	fn request(gpus: usize) -> RequestSession {
		RequestSession {
			version: "1.0".into(),
			persistent: true,
			gpus: vec![GpuRequirements::default(); gpus],
		}
	}

	#[tokio::test]
	async fn test_request_and_cancel_session() {
		let agent = agent(4, 1);
		let id = agent.request_session(request(1)).unwrap();

		let session = agent.session(&id).unwrap();
		assert_eq!(session.snapshot().state, SessionState::Active);
		assert_eq!(agent.status().sessions.len(), 1);

		agent.cancel_session(&id).unwrap();
		session.closed().await;

		assert!(matches!(agent.session(&id), Err(AgentError::SessionNotFound(_))));
		assert!(agent.status().sessions.is_empty());
		agent.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn test_capacity_is_enforced() {
		let agent = agent(1, 2);
		agent.request_session(request(0)).unwrap();

		let err = agent.request_session(request(0)).unwrap_err();
		assert!(matches!(err, AgentError::AtCapacity { max: 1 }));
		agent.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn test_gpu_shortage_is_reported() {
		let agent = agent(4, 1);
		agent.request_session(request(1)).unwrap();

		let err = agent.request_session(request(1)).unwrap_err();
		assert!(matches!(err, AgentError::Session(gpud::Error::GpuUnavailable { .. })));
		agent.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn test_gpus_return_to_pool_after_close() {
		let agent = agent(4, 1);
		let id = agent.request_session(request(1)).unwrap();
		let session = agent.session(&id).unwrap();

		agent.cancel_session(&id).unwrap();
		session.closed().await;

		agent.request_session(request(1)).unwrap();
		agent.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn test_shutdown_closes_sessions_and_rejects_new_ones() {
		let agent = agent(4, 0);
		let id = agent.request_session(request(0)).unwrap();
		let session = agent.session(&id).unwrap();
		let data = ConnectionData {
			id: "c1".into(),
			pid: "1".into(),
			process_name: "p".into(),
		};
		agent.connect(&id, data, Box::new(tokio::io::duplex(8).0)).unwrap();

		agent.shutdown().await.unwrap();

		assert!(session.is_closed());
		assert_eq!(agent.status().state, AgentState::Closed);
		assert!(matches!(agent.request_session(request(0)), Err(AgentError::ShuttingDown)));
	}

	#[tokio::test]
	async fn test_unknown_session() {
		let agent = agent(4, 0);
		assert!(matches!(agent.cancel_session("nope"), Err(AgentError::SessionNotFound(_))));
	}
}
