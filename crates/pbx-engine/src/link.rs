use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};

/// Write half of a client connection, as held by a telephone unit.
///
/// Status lines go through the `Write` impl, always under the owning unit's
/// lock. `shutdown_both` is the abortive close used by the shutdown
/// coordinator: it must make a read blocked on the other half of the same
/// connection return end-of-stream or an error without waiting for data.
/// Dropping the link closes the connection's handle.
pub trait Link: Write + Send {
    fn shutdown_both(&self) -> io::Result<()>;
}

impl Link for TcpStream {
    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}
