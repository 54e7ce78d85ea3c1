//! In-memory stand-ins for client connections, shared by the unit tests.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pbx_config::PbxConfig;

use crate::link::Link;
use crate::pbx::Pbx;
use crate::tu::Tu;

/// A link that collects written lines instead of hitting a socket.
#[derive(Clone)]
pub struct MemLink {
    buf: Arc<Mutex<Vec<u8>>>,
    shutdown: Arc<AtomicBool>,
}

impl MemLink {
    pub fn new() -> MemLink {
        MemLink {
            buf: Arc::new(Mutex::new(Vec::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Everything written since the last call, split into CRLF lines.
    pub fn take_lines(&self) -> Vec<String> {
        let mut buf = self.buf.lock().unwrap();
        let text = String::from_utf8_lossy(&buf).into_owned();
        buf.clear();
        text.split_terminator("\r\n").map(str::to_string).collect()
    }

    pub fn was_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Write for MemLink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for MemLink {
    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub fn test_pbx(max_extensions: usize) -> Pbx {
    let cfg = PbxConfig {
        max_extensions,
        ..PbxConfig::default()
    };
    Pbx::new(&cfg)
}

/// Registers a fresh unit backed by a `MemLink` and hands back both ends.
pub fn register_unit(pbx: &Pbx) -> (Arc<Tu>, MemLink) {
    let link = MemLink::new();
    let tu = Tu::new(Box::new(link.clone()));
    pbx.register(tu.clone()).expect("extension directory full");
    (tu, link)
}
