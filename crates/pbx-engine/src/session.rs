//! Thread-per-connection servicing of client links.

use std::io::{self, BufRead, BufReader};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use pbx_core::Extension;
use pbx_core::wire::Command;
use tracing::{debug, info, trace, warn};

use crate::pbx::Pbx;
use crate::tu::Tu;

/// Accepts connections forever, servicing each one on its own thread.
pub fn serve(listener: TcpListener, pbx: Arc<Pbx>) -> io::Result<()> {
    info!("listening on {}", listener.local_addr()?);
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        let peer = match stream.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "<unknown>".to_string(),
        };
        debug!("connection from {}", peer);
        let pbx = pbx.clone();
        let spawned = thread::Builder::new()
            .name(format!("pbx-client-{}", peer))
            .spawn(move || client_session(stream, pbx));
        if let Err(e) = spawned {
            warn!("failed to spawn servicing thread: {}", e);
        }
    }
    Ok(())
}

/// Owns one client from accept to teardown. The stream is cloned so the
/// command loop reads from one handle while the unit writes to the other.
fn client_session(stream: TcpStream, pbx: Arc<Pbx>) {
    let reader = match stream.try_clone() {
        Ok(clone) => BufReader::new(clone),
        Err(e) => {
            warn!("failed to clone stream for reading: {}", e);
            return;
        }
    };
    let tu = Tu::new(Box::new(stream));
    let Ok(ext) = pbx.register(tu.clone()) else {
        // Dropping both handles closes the turned-away connection
        warn!("turning away connection: no free extension");
        return;
    };
    run_command_loop(reader, ext, &tu, &pbx);
    if let Err(e) = pbx.unregister(&tu) {
        warn!("TU {}: unregister failed: {}", ext, e);
    }
    info!("TU {}: session ended", ext);
}

fn run_command_loop(mut reader: BufReader<TcpStream>, ext: Extension, tu: &Arc<Tu>, pbx: &Pbx) {
    let mut buf = Vec::new();
    loop {
        let line = match read_crlf_line(&mut reader, &mut buf) {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("TU {}: peer closed the connection", ext);
                return;
            }
            Err(e) => {
                debug!("TU {}: read failed ({})", ext, e);
                return;
            }
        };
        trace!("-> TU {}: {}", ext, line);
        let Some(cmd) = Command::parse(&line) else {
            debug!("TU {}: ignoring malformed line {:?}", ext, line);
            continue;
        };
        match cmd {
            Command::Pickup => tu.pickup(),
            Command::Hangup => tu.hangup(),
            Command::Dial(target) => {
                if let Err(e) = pbx.dial(tu, target) {
                    warn!("TU {}: dial failed: {}", ext, e);
                }
            }
            Command::Chat(text) => {
                if let Err(e) = tu.chat(&text) {
                    debug!("TU {}: chat rejected: {}", ext, e);
                }
            }
        }
    }
}

/// Reads one newline-terminated line, tolerating a bare LF from sloppy
/// clients. `Ok(None)` is end of stream; an unterminated trailing fragment
/// is discarded with it.
fn read_crlf_line(reader: &mut impl BufRead, buf: &mut Vec<u8>) -> io::Result<Option<String>> {
    buf.clear();
    let n = reader.read_until(b'\n', buf)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        return Ok(None);
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}
