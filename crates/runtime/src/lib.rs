//! gpud runtime - task supervision and shared state
//!
//! Building blocks the session engine composes:
//!
//! - **TaskGroup**: a cancellable scope that supervises named units of work
//!   and joins them, collecting every failure
//! - **Guarded**: a value reachable only through a critical-section callback
//! - **ConcurrentMap**: a sharded map with snapshot iteration
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │   gpud-core      │  Session state machine
//! └────────┬─────────┘
//!          │ spawns into / guards with
//! ┌────────▼─────────┐
//! │  gpud-runtime    │  This crate
//! │  ┌────────────┐  │
//! │  │ TaskGroup  │  │  CancellationToken + TaskTracker
//! │  └────────────┘  │
//! │  ┌────────────┐  │
//! │  │ Guarded    │  │  parking_lot::Mutex behind closures
//! │  └────────────┘  │
//! │  ┌────────────┐  │
//! │  │ Concurrent │  │  DashMap
//! │  │ Map        │  │
//! │  └────────────┘  │
//! └──────────────────┘
//! ```

pub mod concurrent_map;
pub mod error;
pub mod guarded;
pub mod task_group;

pub use concurrent_map::ConcurrentMap;
pub use error::{GroupError, TaskError};
pub use guarded::Guarded;
pub use task_group::TaskGroup;
