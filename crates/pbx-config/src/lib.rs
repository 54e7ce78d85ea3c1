//! PBX server configuration
//!
//! This crate provides configuration loading and parsing for the switchboard
//! daemon:
//! - TOML configuration file parsing with strict unknown-field rejection
//! - The `PbxConfig` structure handed to every component at startup

pub mod server_config;
pub mod toml_config;

pub use server_config::PbxConfig;
pub use toml_config::*;
