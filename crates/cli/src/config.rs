//! Agent configuration.
//!
//! Stored as JSON at `$XDG_CONFIG_HOME/gpud/config.json`. A missing default
//! file means "all defaults"; an explicitly named file must exist.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use gpud::WorkloadCommand;
use gpud_protocol::Gpu;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:43210";
pub const DEFAULT_MAX_SESSIONS: usize = 16;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// A GPU as listed in the config file. Indices follow list order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuConfig {
	pub name: String,
	pub pci_bus: String,
	/// Memory in bytes.
	#[serde(default)]
	pub vram: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
	pub address: String,
	pub max_sessions: usize,
	pub idle_timeout_secs: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub hostname: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub workload: Option<WorkloadCommand>,
	pub gpus: Vec<GpuConfig>,
}

impl Default for AgentConfig {
	fn default() -> Self {
		Self {
			address: DEFAULT_ADDRESS.to_string(),
			max_sessions: DEFAULT_MAX_SESSIONS,
			idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
			hostname: None,
			workload: None,
			gpus: Vec::new(),
		}
	}
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
	pub address: Option<String>,
	pub max_sessions: Option<usize>,
	pub idle_timeout_secs: Option<u64>,
}

impl AgentConfig {
	/// Loads `path`, or the default location when `path` is `None`.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		match path {
			Some(path) => load_json(path),
			None => match default_path() {
				Some(path) if path.exists() => load_json(&path),
				_ => Ok(Self::default()),
			},
		}
	}

	pub fn save(&self, path: &Path) -> Result<()> {
		save_json(path, self)
	}

	pub fn apply(&mut self, overrides: Overrides) {
		if let Some(address) = overrides.address {
			self.address = address;
		}
		if let Some(max_sessions) = overrides.max_sessions {
			self.max_sessions = max_sessions;
		}
		if let Some(idle_timeout_secs) = overrides.idle_timeout_secs {
			self.idle_timeout_secs = idle_timeout_secs;
		}
	}

	pub fn idle_timeout(&self) -> Duration {
		Duration::from_secs(self.idle_timeout_secs)
	}

	pub fn gpus(&self) -> Vec<Gpu> {
		self.gpus
			.iter()
			.enumerate()
			.map(|(index, gpu)| Gpu {
				index: index as u32,
				name: gpu.name.clone(),
				pci_bus: gpu.pci_bus.clone(),
				vram: gpu.vram,
			})
			.collect()
	}

	/// Configured hostname, else the system's.
	pub fn hostname(&self) -> String {
		self.hostname.clone().unwrap_or_else(system_hostname)
	}

	pub fn validate(&self) -> Result<()> {
		if self.max_sessions == 0 {
			bail!("maxSessions must be at least 1");
		}
		if self.idle_timeout_secs == 0 {
			bail!("idleTimeoutSecs must be at least 1");
		}
		if self.workload.is_none() {
			bail!("no workload configured; set `workload.program` in the config file");
		}
		Ok(())
	}
}

/// `$XDG_CONFIG_HOME/gpud/config.json`, or the platform equivalent.
pub fn default_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join("gpud").join("config.json"))
}

fn system_hostname() -> String {
	std::env::var("HOSTNAME")
		.ok()
		.filter(|name| !name.is_empty())
		.or_else(|| {
			fs::read_to_string("/etc/hostname")
				.ok()
				.map(|name| name.trim().to_string())
				.filter(|name| !name.is_empty())
		})
		.unwrap_or_else(|| "localhost".to_string())
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
	let content = fs::read_to_string(path).with_context(|| format!("failed to read config {}", path.display()))?;
	serde_json::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
}

fn save_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}
	fs::write(path, serde_json::to_string_pretty(data)?)?;
	Ok(())
}
