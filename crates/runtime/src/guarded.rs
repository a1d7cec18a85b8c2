//! Closure-scoped access to a shared value.
//!
//! The value is never handed out by reference or copy outside a critical
//! section, so a check followed by an action (e.g. "if still open, register
//! a connection") cannot interleave with a writer.

use std::fmt;

use parking_lot::Mutex;

pub struct Guarded<T> {
	value: Mutex<T>,
}

impl<T> Guarded<T> {
	pub fn new(value: T) -> Self {
		Self {
			value: Mutex::new(value),
		}
	}

	/// Runs `f` with exclusive, mutable access to the value.
	pub fn with<F>(&self, f: F)
	where
		F: FnOnce(&mut T),
	{
		let mut value = self.value.lock();
		f(&mut value);
	}

	/// Runs `f` with exclusive access and returns what it computes.
	///
	/// Holds the same lock as [`with`](Self::with); writers are excluded for
	/// the whole call.
	pub fn with_return<R, F>(&self, f: F) -> R
	where
		F: FnOnce(&T) -> R,
	{
		let value = self.value.lock();
		f(&value)
	}
}

impl<T: Default> Default for Guarded<T> {
	fn default() -> Self {
		Self::new(T::default())
	}
}

impl<T> fmt::Debug for Guarded<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Guarded").finish_non_exhaustive()
	}
}
