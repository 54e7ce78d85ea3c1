//! Switchboard engine: telephone units, the extension directory and the
//! per-connection servicing threads.
//!
//! - `Tu`: one telephone unit per client connection, with its call state
//! - `Pbx`: fixed-capacity extension directory and shutdown coordinator
//! - `session`: blocking accept/servicing loops on plain OS threads

pub mod link;
pub mod pbx;
pub mod session;
pub mod tu;

// Re-export commonly used items
pub use link::Link;
pub use pbx::{Pbx, PbxError};
pub use tu::{ChatError, Tu};

#[cfg(test)]
pub(crate) mod testutil;
