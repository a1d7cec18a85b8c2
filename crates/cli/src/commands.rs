//! Command implementations.

use std::sync::Arc;

use anyhow::{Context, Result};
use gpud::{GpuPool, WorkloadLauncher};
use gpud_protocol::AgentStatus;
use tokio::net::TcpListener;
use tracing::info;

use crate::agent::{Agent, AgentInfo};
use crate::cli::{Cli, Command, RunArgs};
use crate::config::{self, AgentConfig, Overrides};
use crate::server;

pub async fn dispatch(cli: Cli) -> Result<()> {
	let mut config = AgentConfig::load(cli.config.as_deref())?;

	match cli.command {
		Command::Run(args) => {
			config.apply(overrides(args));
			run(config).await
		}
		Command::Status { address } => {
			let address = address.unwrap_or(config.address);
			let status = status(&address).await?;
			println!("{}", serde_json::to_string_pretty(&status)?);
			Ok(())
		}
		Command::Config { write } => {
			println!("{}", serde_json::to_string_pretty(&config)?);
			if write {
				let path = match cli.config {
					Some(path) => path,
					None => config::default_path().context("no config directory on this platform")?,
				};
				config.save(&path)?;
				info!(target = "gpud.agent", path = %path.display(), "config written");
			}
			Ok(())
		}
	}
}

fn overrides(args: RunArgs) -> Overrides {
	Overrides {
		address: args.address,
		max_sessions: args.max_sessions,
		idle_timeout_secs: args.idle_timeout,
	}
}

pub async fn run(config: AgentConfig) -> Result<()> {
	config.validate()?;

	let listener = TcpListener::bind(&config.address)
		.await
		.with_context(|| format!("failed to bind {}", config.address))?;
	let agent = Arc::new(build_agent(&config, &listener)?);

	server::serve(listener, agent, server::shutdown_signal()).await
}

/// Builds an agent for `config`, reporting the address `listener` is bound to.
pub fn build_agent(config: &AgentConfig, listener: &TcpListener) -> Result<Agent> {
	let workload = config.workload.clone().context("no workload configured")?;
	let address = listener.local_addr().context("listener has no local address")?;

	let info = AgentInfo {
		hostname: config.hostname(),
		address: address.to_string(),
		max_sessions: config.max_sessions,
		idle_timeout: config.idle_timeout(),
	};
	Ok(Agent::new(
		info,
		GpuPool::new(config.gpus()),
		Arc::new(WorkloadLauncher::new(workload)),
	))
}

pub async fn status(address: &str) -> Result<AgentStatus> {
	let url = format!("http://{address}/v1/status");
	reqwest::get(&url)
		.await
		.with_context(|| format!("failed to reach agent at {address}"))?
		.error_for_status()?
		.json()
		.await
		.context("agent returned an invalid status")
}
