/// Ceiling on configurable directory capacity. Extensions are dense slot
/// indices, so a directory of this size is already far beyond what a single
/// process full of blocking connection threads can service.
pub const MAX_EXTENSIONS_CEILING: usize = 65_536;

/// Static configuration of the switchboard daemon, fixed for the lifetime of
/// the process. Built once at startup and passed by reference to every
/// component that needs it; the listening port comes from the CLI instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbxConfig {
    /// Address the listening socket binds to.
    pub bind_addr: String,
    /// Directory capacity; clients are assigned extensions 0..max_extensions.
    pub max_extensions: usize,
    /// Verbose log file; logging stays console-only when unset.
    pub debug_log: Option<String>,
}

impl Default for PbxConfig {
    fn default() -> Self {
        PbxConfig {
            bind_addr: "0.0.0.0".to_string(),
            max_extensions: 256,
            debug_log: None,
        }
    }
}

impl PbxConfig {
    /// Checks consistency beyond what parsing enforces.
    pub fn validate(&self) -> Result<(), String> {
        if self.bind_addr.trim().is_empty() {
            return Err("bind_addr must not be empty".to_string());
        }
        if self.max_extensions == 0 {
            return Err("max_extensions must be at least 1".to_string());
        }
        if self.max_extensions > MAX_EXTENSIONS_CEILING {
            return Err(format!(
                "max_extensions {} exceeds the ceiling of {}",
                self.max_extensions, MAX_EXTENSIONS_CEILING
            ));
        }
        Ok(())
    }
}
