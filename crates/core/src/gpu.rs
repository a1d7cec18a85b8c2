//! GPU inventory and per-session reservations.

use std::sync::Arc;

use gpud_protocol::{Gpu, GpuRequirements};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A set of GPUs held by one session.
///
/// `release` is consumed, so a reservation can only be returned once.
pub trait GpuReservation: Send + Sync {
	fn describe(&self) -> Vec<Gpu>;

	/// PCI bus ids of the reserved devices, comma separated.
	fn pci_address_string(&self) -> String {
		self.describe().iter().map(|gpu| gpu.pci_bus.as_str()).collect::<Vec<_>>().join(",")
	}

	fn release(self: Box<Self>);
}

/// The host's GPUs and which of them are currently reserved.
#[derive(Clone)]
pub struct GpuPool {
	inner: Arc<PoolInner>,
}

struct PoolInner {
	gpus: Vec<Gpu>,
	reserved: Mutex<Vec<bool>>,
}

impl GpuPool {
	pub fn new(gpus: Vec<Gpu>) -> Self {
		let reserved = Mutex::new(vec![false; gpus.len()]);
		Self {
			inner: Arc::new(PoolInner { gpus, reserved }),
		}
	}

	pub fn gpus(&self) -> &[Gpu] {
		&self.inner.gpus
	}

	/// Number of devices not held by any session.
	pub fn available(&self) -> usize {
		self.inner.reserved.lock().iter().filter(|taken| !**taken).count()
	}

	/// Reserves one device per requirement, or nothing at all.
	///
	/// Requirements are matched largest first against the smallest free
	/// device that satisfies them.
	pub fn select(&self, requirements: &[GpuRequirements]) -> Result<SelectedGpus> {
		let mut reserved = self.inner.reserved.lock();

		let mut order: Vec<&GpuRequirements> = requirements.iter().collect();
		order.sort_by(|a, b| b.vram_required.cmp(&a.vram_required));

		let mut picked: Vec<usize> = Vec::with_capacity(requirements.len());
		for requirement in order {
			let candidate = self
				.inner
				.gpus
				.iter()
				.enumerate()
				.filter(|(i, gpu)| !reserved[*i] && !picked.contains(i) && gpu.vram >= requirement.vram_required)
				.min_by_key(|(_, gpu)| gpu.vram)
				.map(|(i, _)| i);

			match candidate {
				Some(index) => picked.push(index),
				None => {
					let available = reserved.iter().filter(|taken| !**taken).count();
					return Err(Error::GpuUnavailable {
						requested: requirements.len(),
						available,
					});
				}
			}
		}

		for index in &picked {
			reserved[*index] = true;
		}
		picked.sort_unstable();
		debug!(target = "gpud.agent", gpus = ?picked, "reserved GPUs");

		Ok(SelectedGpus {
			pool: self.clone(),
			indices: picked,
		})
	}

	fn give_back(&self, indices: &[usize]) {
		let mut reserved = self.inner.reserved.lock();
		for index in indices {
			reserved[*index] = false;
		}
	}
}

impl std::fmt::Debug for GpuPool {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("GpuPool")
			.field("gpus", &self.inner.gpus.len())
			.field("available", &self.available())
			.finish()
	}
}

/// Devices taken from a [`GpuPool`]. Dropping returns them to the pool.
#[derive(Debug)]
pub struct SelectedGpus {
	pool: GpuPool,
	indices: Vec<usize>,
}

impl GpuReservation for SelectedGpus {
	fn describe(&self) -> Vec<Gpu> {
		self.indices.iter().map(|i| self.pool.inner.gpus[*i].clone()).collect()
	}

	fn release(self: Box<Self>) {
		info!(target = "gpud.agent", gpus = ?self.indices, "releasing GPUs");
	}
}

impl Drop for SelectedGpus {
	fn drop(&mut self) {
		self.pool.give_back(&self.indices);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn gpu(index: u32, vram: u64) -> Gpu {
		Gpu {
			index,
			name: format!("gpu{index}"),
			pci_bus: format!("0000:0{index}:00.0"),
			vram,
		}
	}

	fn needs(vram_required: u64) -> GpuRequirements {
		GpuRequirements { vram_required }
	}

	#[test]
	fn test_select_prefers_smallest_fitting_device() {
		let pool = GpuPool::new(vec![gpu(0, 80), gpu(1, 16), gpu(2, 24)]);

		let selected = pool.select(&[needs(20)]).unwrap();
		let described = selected.describe();
		assert_eq!(described.len(), 1);
		assert_eq!(described[0].index, 2);
		assert_eq!(pool.available(), 2);
	}

	#[test]
	fn test_select_is_all_or_nothing() {
		let pool = GpuPool::new(vec![gpu(0, 16), gpu(1, 16)]);

		let err = pool.select(&[needs(8), needs(32)]).unwrap_err();
		assert!(matches!(err, Error::GpuUnavailable { requested: 2, available: 2 }));
		assert_eq!(pool.available(), 2);
	}

	#[test]
	fn test_large_requirements_are_placed_first() {
		let pool = GpuPool::new(vec![gpu(0, 16), gpu(1, 80)]);

		// Placing 8 first on the 16 GiB card would still leave the 80 GiB one.
		// Placing it on the 80 GiB card would fail the 40 GiB request.
		let selected = pool.select(&[needs(8), needs(40)]).unwrap();
		let mut indices: Vec<u32> = selected.describe().iter().map(|g| g.index).collect();
		indices.sort();
		assert_eq!(indices, vec![0, 1]);
	}

	#[test]
	fn test_release_returns_devices() {
		let pool = GpuPool::new(vec![gpu(0, 16), gpu(1, 16)]);

		let selected: Box<dyn GpuReservation> = Box::new(pool.select(&[needs(0), needs(0)]).unwrap());
		assert_eq!(pool.available(), 0);
		assert_eq!(selected.pci_address_string(), "0000:00:00.0,0000:01:00.0");

		selected.release();
		assert_eq!(pool.available(), 2);
	}

	#[test]
	fn test_empty_request_reserves_nothing() {
		let pool = GpuPool::new(vec![gpu(0, 16)]);

		let selected = pool.select(&[]).unwrap();
		assert!(selected.describe().is_empty());
		assert_eq!(selected.pci_address_string(), "");
		assert_eq!(pool.available(), 1);
	}
}
