//! GPU descriptors and reservation requirements.

use serde::{Deserialize, Serialize};

/// A physical GPU as reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gpu {
	/// Position of the device in the agent's GPU list.
	pub index: u32,
	/// Marketing name, e.g. "NVIDIA RTX A4000".
	pub name: String,
	/// PCI bus address, e.g. "0000:01:00.0".
	pub pci_bus: String,
	/// Dedicated memory in bytes.
	pub vram: u64,
}

/// Per-GPU requirement in a session request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuRequirements {
	/// Minimum dedicated memory in bytes.
	#[serde(default)]
	pub vram_required: u64,
}
