//! Wire types for the gpud host agent.
//!
//! These are the serde shapes exchanged with remote clients and with whatever
//! reports agent state upstream. They carry no behavior beyond
//! serialization; the session engine lives in `gpud-core`.

pub mod agent;
pub mod gpu;
pub mod session;

pub use agent::*;
pub use gpu::*;
pub use session::*;
