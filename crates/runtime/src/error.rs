//! Failures reported by supervised tasks.

use std::sync::Arc;

use thiserror::Error;

/// A single unit of work that did not complete cleanly.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
	/// The unit returned an error.
	#[error("task `{name}` failed: {error:#}")]
	Failed {
		name: String,
		error: Arc<anyhow::Error>,
	},

	/// The unit panicked.
	#[error("task `{name}` panicked: {message}")]
	Panicked { name: String, message: String },
}

impl TaskError {
	/// Name the unit was spawned with.
	pub fn name(&self) -> &str {
		match self {
			TaskError::Failed { name, .. } | TaskError::Panicked { name, .. } => name,
		}
	}

	pub fn is_panic(&self) -> bool {
		matches!(self, TaskError::Panicked { .. })
	}
}

/// Every failure collected by a [`TaskGroup`](crate::TaskGroup) join.
#[derive(Debug, Clone, Error)]
#[error("{} task(s) failed: {}", .failures.len() + .omitted, summarize(.failures, .omitted))]
pub struct GroupError {
	failures: Vec<TaskError>,
	omitted: usize,
}

impl GroupError {
	pub(crate) fn new(failures: Vec<TaskError>, omitted: usize) -> Self {
		Self { failures, omitted }
	}

	/// Recorded failures in the order the units finished.
	pub fn failures(&self) -> &[TaskError] {
		&self.failures
	}

	/// Failures counted but not kept once the record was full.
	pub fn omitted(&self) -> usize {
		self.omitted
	}
}

fn summarize(failures: &[TaskError], omitted: &usize) -> String {
	let mut summary = failures
		.iter()
		.map(ToString::to_string)
		.collect::<Vec<_>>()
		.join("; ");
	if *omitted > 0 {
		summary.push_str(&format!("; and {omitted} more"));
	}
	summary
}
