use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::Deserialize;
use toml::Value;

use super::server_config::PbxConfig;

/// Build `PbxConfig` from a TOML string.
pub fn from_toml_str(toml_str: &str) -> Result<PbxConfig, Box<dyn std::error::Error>> {
    let root: TomlConfigRoot = toml::from_str(toml_str)?;

    // Various sanity checks
    let expected_config_version = "1.0";
    if !root.config_version.eq(expected_config_version) {
        return Err(format!(
            "Unrecognized config_version: {}, expect {}",
            root.config_version, expected_config_version
        )
        .into());
    }
    if !root.extra.is_empty() {
        return Err(format!("Unrecognized top-level fields: {:?}", sorted_keys(&root.extra)).into());
    }
    if let Some(ref srv) = root.server {
        if !srv.extra.is_empty() {
            return Err(format!("Unrecognized fields in server: {:?}", sorted_keys(&srv.extra)).into());
        }
    }

    // Build config from defaults and whatever the file overrides
    let mut cfg = PbxConfig::default();
    if let Some(srv) = root.server {
        apply_server_patch(&mut cfg, srv);
    }
    cfg.validate()?;

    Ok(cfg)
}

/// Build `PbxConfig` from any reader.
pub fn from_reader<R: Read>(reader: R) -> Result<PbxConfig, Box<dyn std::error::Error>> {
    let mut contents = String::new();
    let mut reader = BufReader::new(reader);
    reader.read_to_string(&mut contents)?;
    from_toml_str(&contents)
}

/// Build `PbxConfig` from a file path.
pub fn from_file<P: AsRef<Path>>(path: P) -> Result<PbxConfig, Box<dyn std::error::Error>> {
    let f = File::open(path)?;
    let r = BufReader::new(f);
    let cfg = from_reader(r)?;
    Ok(cfg)
}

fn apply_server_patch(dst: &mut PbxConfig, src: ServerDto) {
    if let Some(v) = src.bind_addr {
        dst.bind_addr = v;
    }
    if let Some(v) = src.max_extensions {
        dst.max_extensions = v;
    }
    dst.debug_log = src.debug_log;
}

fn sorted_keys(map: &HashMap<String, Value>) -> Vec<&str> {
    let mut v: Vec<&str> = map.keys().map(|s| s.as_str()).collect();
    v.sort_unstable();
    v
}

/// ----------------------- DTOs for input shape -----------------------

#[derive(Deserialize)]
struct TomlConfigRoot {
    config_version: String,

    #[serde(default)]
    server: Option<ServerDto>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct ServerDto {
    bind_addr: Option<String>,
    max_extensions: Option<usize>,
    debug_log: Option<String>,

    #[serde(flatten)]
    extra: HashMap<String, Value>,
}
