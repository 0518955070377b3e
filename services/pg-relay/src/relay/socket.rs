//! Socket creation and configuration.
//!
//! Every socket handed to the multiplexer is non-blocking. The upstream
//! connect is the one blocking call in the relay.

use std::io::{self, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr};

use mio::net::{TcpListener, TcpStream};
use tracing::trace;

/// Bind the listening socket on all local IPv4 addresses.
///
/// The returned listener is already non-blocking.
pub fn bind_listener(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind(listen_addr(port))
}

/// Address the listener binds to for `port`.
pub fn listen_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

/// Connect to the upstream synchronously, then hand the socket over in
/// non-blocking mode.
pub fn connect_upstream(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = std::net::TcpStream::connect(addr)?;
    into_nonblocking(stream)
}

/// Switch a connected std socket to non-blocking and wrap it for the
/// multiplexer.
pub fn into_nonblocking(stream: std::net::TcpStream) -> io::Result<TcpStream> {
    stream.set_nonblocking(true)?;
    Ok(TcpStream::from_std(stream))
}

/// Shut down both directions and release the descriptor.
pub fn close(stream: TcpStream) {
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        // NotConnected is expected when the peer already went away
        trace!(error = %e, "shutdown before close failed");
    }
    drop(stream);
}

/// Write as much of `chunk` as the socket accepts right now.
///
/// Returns the number of bytes written. A would-block stops early; the caller
/// decides what to do with the remainder.
pub fn send_best_effort<W: Write>(stream: &mut W, chunk: &[u8]) -> io::Result<usize> {
    let mut sent = 0;
    while sent < chunk.len() {
        match stream.write(&chunk[sent..]) {
            Ok(0) => break,
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(sent)
}
