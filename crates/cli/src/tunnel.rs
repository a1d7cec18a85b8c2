//! Websocket to byte-stream bridge.
//!
//! A client websocket becomes one end of an in-memory duplex pipe; the other
//! end is handed to the session as the connection's stream. Binary frames
//! carry raw bytes both ways. Text frames are accepted inbound as UTF-8 bytes.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use gpud_protocol::ConnectionData;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::agent::Agent;

/// Capacity of the in-memory pipe in each direction.
const TUNNEL_BUFFER: usize = 64 * 1024;

const CLOSE_POLICY: u16 = 1008;

pub async fn handle_socket(mut socket: WebSocket, agent: Arc<Agent>, session_id: String, data: ConnectionData) {
	let connection_id = data.id.clone();
	let (local, remote) = tokio::io::duplex(TUNNEL_BUFFER);

	if let Err(err) = agent.connect(&session_id, data, Box::new(remote)) {
		warn!(
			target = "gpud.http",
			session = %session_id,
			connection = %connection_id,
			error = %err.chain(),
			"connect rejected"
		);
		let _ = socket
			.send(Message::Close(Some(CloseFrame {
				code: CLOSE_POLICY,
				reason: err.to_string().into(),
			})))
			.await;
		return;
	}

	info!(target = "gpud.http", session = %session_id, connection = %connection_id, "tunnel open");

	let (mut reader, mut writer) = tokio::io::split(local);
	let (mut ws_tx, mut ws_rx) = socket.split();

	let send_task = tokio::spawn(async move {
		let mut buf = vec![0u8; TUNNEL_BUFFER];
		loop {
			match reader.read(&mut buf).await {
				Ok(0) | Err(_) => break,
				Ok(n) => {
					if ws_tx.send(Message::Binary(buf[..n].to_vec().into())).await.is_err() {
						return;
					}
				}
			}
		}
		let _ = ws_tx.send(Message::Close(None)).await;
	});

	while let Some(msg) = ws_rx.next().await {
		let written = match msg {
			Ok(Message::Binary(bytes)) => writer.write_all(&bytes).await,
			Ok(Message::Text(text)) => writer.write_all(text.as_str().as_bytes()).await,
			Ok(Message::Close(_)) => break,
			Ok(_) => Ok(()),
			Err(err) => {
				debug!(target = "gpud.http", connection = %connection_id, error = %err, "websocket error");
				break;
			}
		};
		if written.is_err() {
			debug!(target = "gpud.http", connection = %connection_id, "connection stopped reading");
			break;
		}
	}

	let _ = writer.shutdown().await;
	send_task.abort();
	info!(target = "gpud.http", session = %session_id, connection = %connection_id, "tunnel closed");
}
