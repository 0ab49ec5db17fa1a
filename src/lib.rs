//! # mpath-socket - Multipath Connection Library
//!
//! mpath-socket lets a process keep several logical connections to one peer,
//! each bound to a distinct network path, behind a single socket handle. Every
//! logical connection rides on its own reliable, ordered stream, so the
//! application gets uniform read/write semantics no matter how many paths are
//! in use.
//!
//! ## Key Features
//!
//! - **One connection per path**: `dial_all` opens one connection for every
//!   path handed over by the path-selection layer
//! - **Dial-in handshake**: a dialer can announce its overlay address and the
//!   path it picked; the listener learns both before handing the stream out
//! - **Background admission**: once armed, an accept loop turns every further
//!   incoming stream into a new listen-side connection
//! - **Message framing**: `write_message` / `read_message` put message
//!   boundaries on top of the byte streams
//! - **Per-connection metrics**: bytes and calls in both directions
//!
//! ## How It Works
//!
//! The listening side binds a *bootstrap* connection which owns the passive
//! listener. [`MpSocket::wait_for_dial_in`] arms the accept loop and waits
//! for the first stream with a valid preamble, which is attached to the
//! bootstrap connection; readers that started earlier are released at that
//! point. Every stream after that is admitted as a connection of its own.
//! Preambles are read off the accept thread, so a peer that connects and
//! stays silent never holds up the others.
//!
//! Each dialed stream starts with a one-byte kind tag. Handshake streams
//! follow it with a length-prefixed [`DialPacket`] carrying the dialer's
//! address and path.
//!
//! ## Basic Usage
//!
//! ### Listener
//!
//! ```rust,no_run
//! use mpath_socket::{MpSocket, PathConn};
//!
//! let socket = MpSocket::new("127.0.0.1:40000");
//! socket.listen()?;
//! let peer = socket.wait_for_dial_in(true)?;
//! println!("Peer {:?} dialed in", peer);
//!
//! let first = socket.listen_connections()[0].clone();
//! let mut msg = Vec::new();
//! first.read_message(&mut msg)?;
//! first.write_message(&msg)?;
//! # Ok::<(), mpath_socket::Error>(())
//! ```
//!
//! ### Dialer
//!
//! ```rust,no_run
//! use mpath_socket::{DialOptions, MpSocket, Path, PathConn};
//!
//! let socket = MpSocket::new("127.0.0.1:40001");
//! let remote = "127.0.0.1:40000".parse()?;
//! let options = DialOptions { send_addr_packet: true };
//! for path in [Path::new("path-a"), Path::new("path-b")] {
//!     let conn = socket.dial(&remote, &path, options)?;
//!     conn.write_message(b"hello")?;
//! }
//! for err in socket.close_all() {
//!     eprintln!("close failed: {err}");
//! }
//! # Ok::<(), mpath_socket::Error>(())
//! ```
//!
//! ## Transports
//!
//! Connections talk to the carrier through the [`Transport`] trait family.
//! [`TcpTransport`] is the built-in carrier; it maps every session to one TCP
//! connection. Paths are opaque to this crate: they are recorded, compared and
//! announced, never interpreted.

#![warn(missing_docs)]

use std::sync::{Mutex, MutexGuard, PoisonError};

mod addr;
mod conn;
mod error;
mod gate;
mod handshake;
mod reliable;
mod socket;
mod tcp;
mod transport;

#[cfg(test)]
mod testing;

pub use addr::*;
pub use conn::*;
pub use error::*;
pub use gate::*;
pub use handshake::*;
pub use reliable::*;
pub use socket::*;
pub use tcp::*;
pub use transport::{Listener, Session, Stream, Transport};

/// Locks `mutex`, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
