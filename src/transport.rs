//! Boundary to the reliable-stream carrier.
//!
//! A transport hands out sessions, either by dialing a remote address or by
//! accepting them on a listener. Each session yields ordered, reliable,
//! bidirectional streams. Everything here takes `&self` so that one thread
//! can block in `read` while another writes or closes.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::addr::Address;

/// An ordered, reliable, bidirectional byte stream.
pub trait Stream: Send + Sync + fmt::Debug {
    /// Reads up to `buf.len()` bytes. `Ok(0)` means the peer closed.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes some prefix of `buf`, returning how much was accepted.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Shuts the stream down in both directions.
    fn close(&self) -> io::Result<()>;
}

/// A transport-level association with one peer.
pub trait Session: Send + Sync + fmt::Debug {
    /// Opens a new outgoing stream.
    fn open_stream(&self) -> io::Result<Box<dyn Stream>>;

    /// Waits for the peer to open a stream.
    fn accept_stream(&self) -> io::Result<Box<dyn Stream>>;

    /// Transport-level address of the peer.
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// A passive listener handing out incoming sessions.
pub trait Listener: Send + Sync + fmt::Debug {
    /// Blocks until the next session arrives or the listener is closed.
    fn accept(&self) -> io::Result<Box<dyn Session>>;

    /// The address the listener is actually bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Closes the listener, waking any thread blocked in `accept`.
    fn close(&self) -> io::Result<()>;
}

/// Factory for sessions and listeners.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Opens a session to `remote`. Pinned paths travel inside the address.
    fn dial(&self, remote: &Address) -> io::Result<Box<dyn Session>>;

    /// Opens a passive listener on `local`.
    fn listen(&self, local: &Address) -> io::Result<Box<dyn Listener>>;
}

/// Loops on `Stream::read` until `buf` is full.
///
/// Fails with `UnexpectedEof` when the peer closes first.
pub(crate) fn read_full(stream: &dyn Stream, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
