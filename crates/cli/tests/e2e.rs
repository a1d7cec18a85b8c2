//! End-to-end tests against a live agent on an ephemeral port.
//!
//! The workload is `cat`, so every tunneled byte comes straight back.

#![cfg(unix)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use gpud::WorkloadCommand;
use gpud_cli::commands;
use gpud_cli::config::{AgentConfig, GpuConfig};
use gpud_cli::server;
use gpud_protocol::{Session, SessionState};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

struct TestAgent {
	addr: SocketAddr,
	stop: Option<oneshot::Sender<()>>,
	handle: JoinHandle<anyhow::Result<()>>,
}

impl TestAgent {
	async fn start(max_sessions: usize) -> Self {
		let config = AgentConfig {
			address: "127.0.0.1:0".to_string(),
			max_sessions,
			workload: Some(WorkloadCommand::new("cat")),
			gpus: vec![
				GpuConfig {
					name: "Test GPU".to_string(),
					pci_bus: "0000:01:00.0".to_string(),
					vram: 16 << 30,
				},
				GpuConfig {
					name: "Test GPU".to_string(),
					pci_bus: "0000:02:00.0".to_string(),
					vram: 16 << 30,
				},
			],
			..AgentConfig::default()
		};

		let listener = TcpListener::bind(&config.address).await.unwrap();
		let addr = listener.local_addr().unwrap();
		let agent = Arc::new(commands::build_agent(&config, &listener).unwrap());

		let (stop, stopped) = oneshot::channel::<()>();
		let handle = tokio::spawn(server::serve(listener, agent, async move {
			let _ = stopped.await;
		}));

		Self {
			addr,
			stop: Some(stop),
			handle,
		}
	}

	fn url(&self, path: &str) -> String {
		format!("http://{}{path}", self.addr)
	}

	async fn request_session(&self, gpus: usize) -> reqwest::Response {
		let gpus: Vec<_> = (0..gpus).map(|_| json!({"vramRequired": 0})).collect();
		reqwest::Client::new()
			.post(self.url("/v1/request/session"))
			.json(&json!({"version": "1.0.0", "gpus": gpus}))
			.send()
			.await
			.unwrap()
	}

	async fn session(&self, id: &str) -> reqwest::Response {
		reqwest::get(self.url(&format!("/v1/session/{id}"))).await.unwrap()
	}

	async fn stop(mut self) {
		if let Some(stop) = self.stop.take() {
			let _ = stop.send(());
		}
		tokio::time::timeout(Duration::from_secs(10), self.handle)
			.await
			.expect("agent did not stop")
			.unwrap()
			.unwrap();
	}
}

#[tokio::test]
async fn test_tunnel_round_trip() {
	let agent = TestAgent::start(4).await;

	let response = agent.request_session(1).await;
	assert_eq!(response.status(), 200);
	let id = response.text().await.unwrap();

	let url = format!("ws://{}/v1/connect/session/{id}?id=c1&pid=77&processName=train", agent.addr);
	let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
	ws.send(Message::Binary(b"hello gpu\n".to_vec())).await.unwrap();

	let mut echoed = Vec::new();
	while echoed.len() < 10 {
		let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
			.await
			.expect("no echo")
			.unwrap()
			.unwrap();
		if let Message::Binary(bytes) = msg {
			echoed.extend_from_slice(&bytes);
		}
	}
	assert_eq!(echoed, b"hello gpu\n");

	let session: Session = agent.session(&id).await.json().await.unwrap();
	assert_eq!(session.state, SessionState::Active);
	assert_eq!(session.gpus.len(), 1);
	assert_eq!(session.connections.len(), 1);
	assert_eq!(session.connections[0].pid, "77");
	assert_eq!(session.connections[0].process_name, "train");

	ws.close(None).await.unwrap();

	let response = reqwest::Client::new()
		.delete(agent.url(&format!("/v1/session/{id}")))
		.send()
		.await
		.unwrap();
	assert_eq!(response.status(), 204);

	let mut gone = false;
	for _ in 0..100 {
		if agent.session(&id).await.status() == 404 {
			gone = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	assert!(gone, "closed session was not removed");

	agent.stop().await;
}

#[tokio::test]
async fn test_status_reports_gpus_and_sessions() {
	let agent = TestAgent::start(4).await;
	let id = agent.request_session(0).await.text().await.unwrap();

	let status = commands::status(&agent.addr.to_string()).await.unwrap();
	assert_eq!(status.gpus.len(), 2);
	assert_eq!(status.max_sessions, 4);
	assert_eq!(status.address, agent.addr.to_string());
	assert_eq!(status.sessions.len(), 1);
	assert_eq!(status.sessions[0].id, id);

	agent.stop().await;
}

#[tokio::test]
async fn test_error_statuses() {
	let agent = TestAgent::start(1).await;

	assert_eq!(agent.session("missing").await.status(), 404);

	let shortage = agent.request_session(3).await;
	assert_eq!(shortage.status(), 409);
	let body: serde_json::Value = shortage.json().await.unwrap();
	assert_eq!(body["error"]["type"], "gpu_unavailable");

	assert_eq!(agent.request_session(0).await.status(), 200);
	assert_eq!(agent.request_session(0).await.status(), 503);

	let url = format!("ws://{}/v1/connect/session/missing?id=c1", agent.addr);
	assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());

	agent.stop().await;
}
