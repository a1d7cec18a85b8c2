//! gpud - brokers remote access to local GPUs
//!
//! A client obtains a [`Session`] bound to a [`GpuReservation`], then opens
//! any number of duplex streams into it. Each distinct connection id becomes
//! a [`Connection`] backed by a workload process; the session supervises all
//! of them in one [`TaskGroup`] and tears everything down exactly once.
//!
//! # Lifecycle
//!
//! ```text
//!   Active ──cancel / idle / parent──▶ Closing ──join──▶ Closed
//!            (flag set, connect         (GPUs released,
//!             rejected from here)        SessionClosed fired)
//! ```
//!
//! [`TaskGroup`]: gpud_runtime::TaskGroup

pub mod connection;
pub mod error;
pub mod events;
pub mod gpu;
pub mod process;
pub mod session;

pub use connection::{BoxStream, Completion, Connection, ConnectionFactory, ExitStatus, Stream, UNKNOWN_EXIT_STATUS};
pub use error::{Error, Result};
pub use events::EventListener;
pub use gpu::{GpuPool, GpuReservation, SelectedGpus};
pub use gpud_protocol as protocol;
pub use process::{ProcessConnection, WorkloadCommand, WorkloadLauncher};
pub use session::{IDLE_TIMEOUT, Session, SessionOptions};
