//! Connections backed by a local workload process.
//!
//! Each connection launches its own child process. The attached stream feeds
//! the child's stdin and receives its stdout; stderr goes to the log. The
//! stream can be swapped at any time without disturbing the process, and the
//! process keeps running while nothing is attached. Output produced while
//! detached is discarded.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use gpud_protocol::ConnectionData;
use gpud_runtime::TaskGroup;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{BoxStream, Completion, Connection, ConnectionFactory, ExitStatus, UNKNOWN_EXIT_STATUS};
use crate::error::{Error, Result};

pub const ENV_PCI_BUS: &str = "GPUD_PCI_BUS";
pub const ENV_CONNECTION_ID: &str = "GPUD_CONNECTION_ID";
pub const ENV_CLIENT_PID: &str = "GPUD_CLIENT_PID";
pub const ENV_CLIENT_PROCESS_NAME: &str = "GPUD_CLIENT_PROCESS_NAME";

const OUTPUT_CHUNK: usize = 8 * 1024;

/// The program each connection runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadCommand {
	pub program: PathBuf,
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default)]
	pub env: BTreeMap<String, String>,
}

impl WorkloadCommand {
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
			env: BTreeMap::new(),
		}
	}

	pub fn arg(mut self, arg: impl Into<String>) -> Self {
		self.args.push(arg.into());
		self
	}
}

/// Creates a [`ProcessConnection`] per connection id.
#[derive(Debug, Clone)]
pub struct WorkloadLauncher {
	command: Arc<WorkloadCommand>,
}

impl WorkloadLauncher {
	pub fn new(command: WorkloadCommand) -> Self {
		Self {
			command: Arc::new(command),
		}
	}
}

impl ConnectionFactory for WorkloadLauncher {
	fn create(&self, data: ConnectionData, pci_address: &str) -> Arc<dyn Connection> {
		Arc::new(ProcessConnection::new(data, pci_address, Arc::clone(&self.command)))
	}
}

pub struct ProcessConnection {
	data: ConnectionData,
	pci_address: String,
	command: Arc<WorkloadCommand>,
	/// Present once started; closed when the process exits.
	streams: Mutex<Option<mpsc::UnboundedSender<BoxStream>>>,
}

impl ProcessConnection {
	pub fn new(data: ConnectionData, pci_address: &str, command: Arc<WorkloadCommand>) -> Self {
		Self {
			data,
			pci_address: pci_address.to_string(),
			command,
			streams: Mutex::new(None),
		}
	}

	fn build_command(&self) -> Command {
		let mut cmd = Command::new(&self.command.program);
		cmd.args(&self.command.args)
			.envs(&self.command.env)
			.env(ENV_PCI_BUS, &self.pci_address)
			.env(ENV_CONNECTION_ID, &self.data.id)
			.env(ENV_CLIENT_PID, &self.data.pid)
			.env(ENV_CLIENT_PROCESS_NAME, &self.data.process_name)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		cmd
	}
}

impl std::fmt::Debug for ProcessConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProcessConnection")
			.field("id", &self.data.id)
			.field("program", &self.command.program)
			.finish()
	}
}

impl Connection for ProcessConnection {
	fn data(&self) -> &ConnectionData {
		&self.data
	}

	fn start(&self, group: &TaskGroup, completion: Completion) -> anyhow::Result<()> {
		let mut streams = self.streams.lock();
		if streams.is_some() {
			anyhow::bail!("connection {} is already running", self.data.id);
		}

		let mut child = self
			.build_command()
			.spawn()
			.with_context(|| format!("failed to launch {}", self.command.program.display()))?;

		let stdin = child.stdin.take().context("workload stdin was not piped")?;
		let stdout = child.stdout.take().context("workload stdout was not piped")?;
		let stderr = child.stderr.take().context("workload stderr was not piped")?;

		let id = self.data.id.clone();
		info!(
			target = "gpud.connection",
			connection = %id,
			pid = child.id(),
			program = %self.command.program.display(),
			"workload started"
		);

		let stderr_id = id.clone();
		group.spawn(format!("connection {id} stderr"), move |_| async move {
			let mut lines = BufReader::new(stderr).lines();
			loop {
				match lines.next_line().await {
					Ok(Some(line)) => debug!(target = "gpud.connection", connection = %stderr_id, "{line}"),
					Ok(None) => break,
					Err(e) => {
						debug!(target = "gpud.connection", connection = %stderr_id, error = %e, "stderr closed");
						break;
					}
				}
			}
			Ok(())
		});

		let (tx, rx) = mpsc::unbounded_channel();
		*streams = Some(tx);

		let workload = Workload {
			id: id.clone(),
			child,
			stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
			stdout,
			streams: rx,
		};
		group.spawn(format!("connection {id} workload"), move |g| async move {
			let status = workload.supervise(g).await;
			// The receiving watcher may already be gone during teardown.
			let _ = completion.send(status);
			Ok(())
		});

		Ok(())
	}

	fn attach(&self, stream: BoxStream) -> Result<()> {
		let streams = self.streams.lock();
		let Some(tx) = streams.as_ref() else {
			return Err(Error::Attach {
				connection_id: self.data.id.clone(),
				reason: "workload not started".to_string(),
			});
		};

		tx.send(stream).map_err(|_| Error::Attach {
			connection_id: self.data.id.clone(),
			reason: "workload has exited".to_string(),
		})
	}
}

/// State owned by the supervising task of one process.
struct Workload {
	id: String,
	child: Child,
	stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
	stdout: ChildStdout,
	streams: mpsc::UnboundedReceiver<BoxStream>,
}

struct Attached {
	writer: WriteHalf<BoxStream>,
	input: CancellationToken,
}

impl Workload {
	/// Runs until the process has exited and its output is drained, or the
	/// group is cancelled. Returns the exit status.
	async fn supervise(mut self, group: TaskGroup) -> ExitStatus {
		let mut buf = vec![0u8; OUTPUT_CHUNK];
		let mut current: Option<Attached> = None;
		let mut exit: Option<ExitStatus> = None;
		let mut output_open = true;
		let mut accepting = true;

		let status = loop {
			if !output_open {
				if let Some(status) = exit {
					break status;
				}
			}

			tokio::select! {
				_ = group.cancelled() => {
					break match exit {
						Some(status) => status,
						None => self.kill().await,
					};
				}
				waited = self.child.wait(), if exit.is_none() => {
					let status = match waited {
						Ok(status) => status.code().unwrap_or(UNKNOWN_EXIT_STATUS),
						Err(e) => {
							warn!(target = "gpud.connection", connection = %self.id, error = %e, "failed to reap workload");
							UNKNOWN_EXIT_STATUS
						}
					};
					info!(target = "gpud.connection", connection = %self.id, status, "workload exited");
					exit = Some(status);
					self.streams.close();
					accepting = false;
				}
				next = self.streams.recv(), if accepting => match next {
					Some(stream) => {
						if let Some(previous) = current.take() {
							previous.input.cancel();
							debug!(target = "gpud.connection", connection = %self.id, "replacing attached stream");
						}
						current = Some(self.attach(&group, stream));
					}
					None => accepting = false,
				},
				read = self.stdout.read(&mut buf), if output_open => match read {
					Ok(0) | Err(_) => {
						output_open = false;
						if let Some(attached) = current.as_mut() {
							let _ = attached.writer.shutdown().await;
						}
					}
					Ok(n) => {
						if let Some(attached) = current.as_mut() {
							let forwarded = tokio::select! {
								written = forward(&mut attached.writer, &buf[..n]) => written,
								_ = group.cancelled() => Ok(()),
							};
							if let Err(e) = forwarded {
								debug!(target = "gpud.connection", connection = %self.id, error = %e, "stream closed, detaching");
								if let Some(detached) = current.take() {
									detached.input.cancel();
								}
							}
						}
					}
				},
			}
		};

		if let Some(attached) = current.take() {
			attached.input.cancel();
		}
		status
	}

	fn attach(&self, group: &TaskGroup, stream: BoxStream) -> Attached {
		let (mut reader, writer) = tokio::io::split(stream);
		let input = CancellationToken::new();

		let stop = input.clone();
		let stdin = Arc::clone(&self.stdin);
		let id = self.id.clone();
		group.spawn(format!("connection {} input", self.id), move |g| async move {
			let pump = async {
				let mut stdin = stdin.lock().await;
				tokio::io::copy(&mut reader, &mut *stdin).await
			};
			tokio::select! {
				copied = pump => match copied {
					Ok(bytes) => debug!(target = "gpud.connection", connection = %id, bytes, "stream input ended"),
					Err(e) => debug!(target = "gpud.connection", connection = %id, error = %e, "stream input failed"),
				},
				_ = stop.cancelled() => {}
				_ = g.cancelled() => {}
			}
			Ok(())
		});

		debug!(target = "gpud.connection", connection = %self.id, "stream attached");
		Attached { writer, input }
	}

	async fn kill(&mut self) -> ExitStatus {
		info!(target = "gpud.connection", connection = %self.id, "stopping workload");
		if let Err(e) = self.child.start_kill() {
			warn!(target = "gpud.connection", connection = %self.id, error = %e, "failed to signal workload");
		}
		match self.child.wait().await {
			Ok(status) => status.code().unwrap_or(UNKNOWN_EXIT_STATUS),
			Err(_) => UNKNOWN_EXIT_STATUS,
		}
	}
}

async fn forward(writer: &mut WriteHalf<BoxStream>, chunk: &[u8]) -> std::io::Result<()> {
	writer.write_all(chunk).await?;
	writer.flush().await
}
