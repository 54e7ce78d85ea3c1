use clap::Parser;

use std::net::TcpListener;
use std::sync::Arc;

use pbx_config::{PbxConfig, toml_config};
use pbx_core::debug;
use pbx_engine::{Pbx, session};
use tracing::{error, info};

/// Load configuration file
fn load_config_from_toml(cfg_path: &str) -> PbxConfig {
    match toml_config::from_file(cfg_path) {
        Ok(c) => c,
        Err(e) => {
            println!("Failed to load configuration from {}: {}", cfg_path, e);
            std::process::exit(1);
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "PBX switchboard daemon",
    long_about = "Serves a software private branch exchange over TCP: every connection becomes a telephone unit with its own extension"
)]
struct Args {
    /// Port to listen on (required)
    #[arg(short, long, help = "TCP port for telephone unit connections")]
    port: u16,

    /// Config file (optional)
    #[arg(long, help = "TOML config with switchboard parameters")]
    config: Option<String>,
}

fn main() {
    eprintln!("░█▀█░█▀▄░█░█░█▀▄");
    eprintln!("░█▀▀░█▀▄░░█░░█░█");
    eprintln!("░▀░░░▀▀░░▀░▀░▀▀░\n");

    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => load_config_from_toml(path),
        None => PbxConfig::default(),
    };
    let _log_guard = debug::setup_logging_default(cfg.debug_log.clone());

    let pbx = Arc::new(Pbx::new(&cfg));

    // Ctrl+C runs the two-phase shutdown before the process exits
    let shutdown_pbx = pbx.clone();
    ctrlc::set_handler(move || {
        info!("interrupt received, shutting down");
        shutdown_pbx.shutdown();
        std::process::exit(0);
    })
    .expect("failed to set Ctrl+C handler");

    let listener = match TcpListener::bind((cfg.bind_addr.as_str(), args.port)) {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}:{}: {}", cfg.bind_addr, args.port, e);
            std::process::exit(1);
        }
    };
    info!("switchboard ready: {} extensions available", cfg.max_extensions);
    if let Err(e) = session::serve(listener, pbx) {
        error!("server terminated: {}", e);
        std::process::exit(1);
    }
}
