//! Core types for the PBX switchboard
//!
//! This crate provides the vocabulary shared across the PBX stack:
//! - TuState, the call state of a telephone unit
//! - Wire parsing/formatting for the line protocol
//! - Debug and logging utilities

pub mod debug;
pub mod tu_state;
pub mod wire;

// Re-export commonly used items
pub use tu_state::TuState;
pub use wire::Command;

/// Extension number by which a telephone unit is dialed. Assigned once, at
/// registration, and reported to the client in its initial `ON HOOK` line.
pub type Extension = u32;
