//! Structured concurrency for session-scoped work.
//!
//! A [`TaskGroup`] pairs a [`CancellationToken`] (the scope) with a
//! [`TaskTracker`] (the join). Units are spawned by name and receive the
//! group itself, so they can nest further work under the same scope.
//!
//! # Semantics
//!
//! - Cancellation is cooperative: units observe [`TaskGroup::cancelled`] and
//!   return. Nothing is aborted.
//! - Child groups are cancelled with their parent, never the reverse.
//! - A failing or panicking unit is recorded and reported by
//!   [`TaskGroup::wait`]; it does not cancel its siblings.
//! - At most [`MAX_RECORDED_FAILURES`] failures are kept per group; later
//!   ones are only counted.


use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{GroupError, TaskError};

/// Failures retained per group. Long-lived groups keep a bounded history.
pub const MAX_RECORDED_FAILURES: usize = 64;

#[derive(Debug, Default)]
struct Failures {
	recorded: Vec<TaskError>,
	omitted: usize,
}

impl Failures {
	fn push(&mut self, failure: TaskError) {
		if self.recorded.len() < MAX_RECORDED_FAILURES {
			self.recorded.push(failure);
		} else {
			self.omitted += 1;
		}
	}
}

/// Supervisor for a set of independently scheduled units sharing one scope.
///
/// Cloning yields another handle to the same group.
#[derive(Clone, Debug)]
pub struct TaskGroup {
	token: CancellationToken,
	tracker: TaskTracker,
	failures: Arc<Mutex<Failures>>,
}

impl Default for TaskGroup {
	fn default() -> Self {
		Self::new()
	}
}

impl TaskGroup {
	/// Creates a root group with its own scope.
	pub fn new() -> Self {
		Self::with_token(CancellationToken::new())
	}

	fn with_token(token: CancellationToken) -> Self {
		Self {
			token,
			tracker: TaskTracker::new(),
			failures: Arc::new(Mutex::new(Failures::default())),
		}
	}

	/// Creates a nested group cancelled whenever this one is.
	///
	/// The child joins only its own units.
	pub fn child(&self) -> Self {
		Self::with_token(self.token.child_token())
	}

	/// Starts `f` under this group.
	///
	/// `f` is handed a clone of the group. Its error, or a panic, is kept for
	/// [`wait`](Self::wait); the caller never sees it directly.
	pub fn spawn<F, Fut>(&self, name: impl Into<String>, f: F)
	where
		F: FnOnce(TaskGroup) -> Fut,
		Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		let name = name.into();
		let failures = Arc::clone(&self.failures);
		let unit = f(self.clone());

		debug!(target = "gpud.task", task = %name, "spawning task");
		self.tracker.spawn(async move {
			let failure = match AssertUnwindSafe(unit).catch_unwind().await {
				Ok(Ok(())) => {
					debug!(target = "gpud.task", task = %name, "task finished");
					return;
				}
				Ok(Err(error)) => TaskError::Failed {
					name,
					error: Arc::new(error),
				},
				Err(payload) => TaskError::Panicked {
					message: panic_message(payload.as_ref()),
					name,
				},
			};

			warn!(target = "gpud.task", task = failure.name(), error = %failure, "task did not complete cleanly");
			failures.lock().push(failure);
		});
	}

	/// Requests every unit in this scope, and every nested scope, to stop.
	pub fn cancel(&self) {
		self.token.cancel();
	}

	pub fn is_cancelled(&self) -> bool {
		self.token.is_cancelled()
	}

	/// Resolves once the scope is cancelled, by this group or an ancestor.
	pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
		self.token.cancelled()
	}

	/// Number of units still running.
	pub fn active(&self) -> usize {
		self.tracker.len()
	}

	/// Waits for every unit to return and reports all recorded failures.
	///
	/// Units spawned while the wait is in progress are joined too. Once the
	/// group has drained, further calls return immediately with the same
	/// aggregate.
	pub async fn wait(&self) -> Result<(), GroupError> {
		self.tracker.close();
		self.tracker.wait().await;

		let failures = self.failures.lock();
		if failures.recorded.is_empty() {
			Ok(())
		} else {
			Err(GroupError::new(failures.recorded.clone(), failures.omitted))
		}
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		(*message).to_string()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"non-string panic payload".to_string()
	}
}
