use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

use crate::addr::{Address, Path};
use crate::error::{Error, Result};
use crate::reliable::ReliableConn;
use crate::transport::{Stream, Transport};

/// Size of the big-endian length prefix in front of every framed message.
pub const MESSAGE_LEN_SIZE: usize = 8;

/// Intermediate buffer size used when assembling a framed message.
pub const READ_CHUNK_SIZE: usize = 9000;

/// Largest payload `write_message` / `read_message` accept.
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Registry tag of [`ReliableConn`].
pub const RELIABLE_KIND: &str = "reliable";

/// Directionality of a connection kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Data flows from the dialer to the listener only.
    Unidirectional,
    /// Both ends read and write.
    Bidirectional,
}

/// Lifecycle of a connection.
///
/// `Unconnected -> Pending -> Established -> Closed`. `Closed` can be entered
/// from any state and is never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Freshly constructed.
    Unconnected,
    /// Dialing, or listening without a stream yet.
    Pending,
    /// A stream is attached.
    Established,
    /// Torn down.
    Closed,
}

/// Snapshot of the traffic counters of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathMetrics {
    /// Bytes returned by successful reads.
    pub read_bytes: u64,
    /// Number of successful read calls.
    pub read_packets: u64,
    /// Bytes accepted by successful writes.
    pub written_bytes: u64,
    /// Number of successful write calls.
    pub written_packets: u64,
}

/// Monotonic counters behind [`PathMetrics`].
#[derive(Debug, Default)]
pub(crate) struct MetricCounters {
    read_bytes: AtomicU64,
    read_packets: AtomicU64,
    written_bytes: AtomicU64,
    written_packets: AtomicU64,
}

impl MetricCounters {
    pub(crate) fn record_read(&self, n: usize) {
        self.read_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.read_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, n: usize) {
        self.written_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.written_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PathMetrics {
        PathMetrics {
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            read_packets: self.read_packets.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            written_packets: self.written_packets.load(Ordering::Relaxed),
        }
    }
}

/// A logical connection bound to one network path.
///
/// Connections are shared between the socket that owns them and the
/// application, so every operation takes `&self`. One thread may block in
/// `read` while another writes.
pub trait PathConn: Send + Sync + fmt::Debug {
    /// Unique identifier of this connection.
    fn id(&self) -> Uuid;

    /// Directionality of this connection kind.
    fn kind(&self) -> ConnectionType;

    /// Current lifecycle state.
    fn state(&self) -> ConnState;

    /// Opens a session to `remote` and one stream on it. When `remote`
    /// carries no path, `path` is pinned on it first.
    fn dial(&self, remote: &Address, path: &Path) -> Result<()>;

    /// Opens a passive listener on `local`. Does not block.
    fn listen(&self, local: &Address) -> Result<()>;

    /// Blocks until a peer opens a stream on this connection's listener and
    /// returns it without attaching it.
    fn accept_stream(&self) -> Result<Box<dyn Stream>>;

    /// Makes `stream` the connection's stream and releases blocked readers.
    fn attach_stream(&self, stream: Box<dyn Stream>) -> Result<()>;

    /// One read on the stream. Waits for a stream to be attached first if
    /// there is none yet.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// One write on the stream.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Closes the stream, and the listener if this connection owns one.
    fn close(&self) -> Result<()>;

    /// Traffic counters.
    fn metrics(&self) -> PathMetrics;

    /// The path this connection runs over, once known.
    fn path(&self) -> Option<Path>;

    /// Records the path, e.g. after it was learned from a handshake.
    fn set_path(&self, path: Path);

    /// The peer's address, once known.
    fn remote(&self) -> Option<Address>;

    /// Records the peer's address.
    fn set_remote(&self, remote: Address);

    /// Our own address as stamped by the socket or bound by `listen`.
    fn local(&self) -> Option<Address>;

    /// Records our own address.
    fn set_local(&self, local: Address);

    /// Writes all of `buf`, looping on short writes.
    fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// Sends `payload` as one framed message: an 8-byte big-endian length
    /// followed by the payload. Returns the payload length.
    fn write_message(&self, payload: &[u8]) -> Result<usize> {
        let len = payload.len() as u64;
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::Framing(format!(
                "message of {len} bytes exceeds limit of {MAX_MESSAGE_SIZE}"
            )));
        }
        self.write_all(&len.to_be_bytes())?;
        self.write_all(payload)?;
        Ok(payload.len())
    }

    /// Receives one framed message into `out`, replacing its content.
    /// Returns the message length.
    fn read_message(&self, out: &mut Vec<u8>) -> Result<usize> {
        let mut prefix = [0u8; MESSAGE_LEN_SIZE];
        let mut filled = 0;
        while filled < MESSAGE_LEN_SIZE {
            match self.read(&mut prefix[filled..])? {
                0 => {
                    return Err(Error::Framing(format!(
                        "stream ended after {filled} of {MESSAGE_LEN_SIZE} length bytes"
                    )));
                }
                n => filled += n,
            }
        }

        let len = u64::from_be_bytes(prefix);
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::Framing(format!(
                "announced message of {len} bytes exceeds limit of {MAX_MESSAGE_SIZE}"
            )));
        }
        let len = len as usize;

        out.clear();
        out.resize(len, 0);
        let mut chunk = vec![0u8; READ_CHUNK_SIZE.min(len)];
        let mut assembled = 0;
        while assembled < len {
            let want = (len - assembled).min(chunk.len());
            let n = self.read(&mut chunk[..want])?;
            if n == 0 {
                return Err(Error::Framing(format!(
                    "stream ended after {assembled} of {len} message bytes"
                )));
            }
            out[assembled..assembled + n].copy_from_slice(&chunk[..n]);
            assembled += n;
        }
        Ok(assembled)
    }
}

/// Builds a connection of some kind on top of a transport.
pub type ConnConstructor = fn(Arc<dyn Transport>) -> Arc<dyn PathConn>;

/// Maps connection kind tags to constructors.
///
/// The default registry knows [`RELIABLE_KIND`].
#[derive(Debug, Clone)]
pub struct ConnRegistry {
    constructors: HashMap<String, ConnConstructor>,
}

impl Default for ConnRegistry {
    fn default() -> Self {
        let mut registry = ConnRegistry::empty();
        registry.register(RELIABLE_KIND, ReliableConn::create);
        registry
    }
}

impl ConnRegistry {
    /// A registry with no kinds at all.
    pub fn empty() -> ConnRegistry {
        ConnRegistry {
            constructors: HashMap::new(),
        }
    }

    /// Registers `constructor` under `tag`, returning the one it replaced.
    pub fn register(
        &mut self,
        tag: impl Into<String>,
        constructor: ConnConstructor,
    ) -> Option<ConnConstructor> {
        self.constructors.insert(tag.into(), constructor)
    }

    /// Looks up the constructor for `tag`.
    pub fn constructor(&self, tag: &str) -> Result<ConnConstructor> {
        self.constructors
            .get(tag)
            .copied()
            .ok_or_else(|| Error::UnknownKind(tag.to_string()))
    }

    /// Builds a connection of kind `tag`.
    pub fn construct(&self, tag: &str, transport: Arc<dyn Transport>) -> Result<Arc<dyn PathConn>> {
        Ok(self.constructor(tag)?(transport))
    }

    /// Registered tags, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::TcpTransport;
    use crate::testing::ScriptedStream;

    fn conn_over(stream: &ScriptedStream) -> Arc<dyn PathConn> {
        let conn = ReliableConn::create(Arc::new(TcpTransport::new()));
        conn.attach_stream(Box::new(stream.clone())).unwrap();
        conn
    }

    #[test]
    fn test_write_message_wire_format() {
        let stream = ScriptedStream::new(b"");
        let conn = conn_over(&stream);

        assert_eq!(conn.write_message(b"abc").unwrap(), 3);
        let written = stream.written();
        assert_eq!(&written[..8], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&written[8..], b"abc");

        let m = conn.metrics();
        assert_eq!(m.written_bytes, 11);
        assert_eq!(m.written_packets, 2);
    }

    #[test]
    fn test_read_message_with_partial_reads() {
        for len in [0usize, 1, 8, 9000, 9001, 20_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let sender = ScriptedStream::new(b"");
            conn_over(&sender).write_message(&payload).unwrap();

            // 1 to 4 bytes per read call
            let receiver = ScriptedStream::new(&sender.written()).with_chunking(4);
            let conn = conn_over(&receiver);
            let mut out = vec![0xAA; 3];
            assert_eq!(conn.read_message(&mut out).unwrap(), len);
            assert_eq!(out, payload);
        }
    }

    #[test]
    fn test_read_message_back_to_back() {
        let sender = ScriptedStream::new(b"");
        let tx = conn_over(&sender);
        tx.write_message(b"first").unwrap();
        tx.write_message(b"second message").unwrap();

        let rx = conn_over(&ScriptedStream::new(&sender.written()).with_chunking(3));
        let mut out = Vec::new();
        rx.read_message(&mut out).unwrap();
        assert_eq!(out, b"first");
        rx.read_message(&mut out).unwrap();
        assert_eq!(out, b"second message");
    }

    #[test]
    fn test_read_message_truncated_payload() {
        let mut wire = 10u64.to_be_bytes().to_vec();
        wire.extend_from_slice(b"only6b");
        let conn = conn_over(&ScriptedStream::new(&wire).with_chunking(2));
        let mut out = Vec::new();
        match conn.read_message(&mut out) {
            Err(Error::Framing(msg)) => assert!(msg.contains("6 of 10"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_read_message_truncated_prefix() {
        let conn = conn_over(&ScriptedStream::new(&[0, 0, 0]));
        let mut out = Vec::new();
        assert!(matches!(conn.read_message(&mut out), Err(Error::Framing(_))));
    }

    #[test]
    fn test_read_message_rejects_oversized_length() {
        let wire = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let conn = conn_over(&ScriptedStream::new(&wire));
        let mut out = Vec::new();
        assert!(matches!(conn.read_message(&mut out), Err(Error::Framing(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_metrics_are_per_connection() {
        let a_stream = ScriptedStream::new(b"0123456789").with_chunking(4);
        let b_stream = ScriptedStream::new(b"xyz");
        let a = conn_over(&a_stream);
        let b = conn_over(&b_stream);

        let mut buf = [0u8; 16];
        let mut total = 0;
        let mut calls = 0;
        let mut last = PathMetrics::default();
        loop {
            let n = a.read(&mut buf).unwrap();
            calls += 1;
            total += n;
            let now = a.metrics();
            assert!(now.read_bytes >= last.read_bytes);
            last = now;
            if n == 0 {
                break;
            }
        }
        assert_eq!(last.read_bytes, total as u64);
        assert_eq!(last.read_packets, calls);
        assert_eq!(b.metrics(), PathMetrics::default());

        b.write(b"hello").unwrap();
        assert_eq!(a.metrics(), last);
        assert_eq!(b.metrics().written_bytes, 5);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ConnRegistry::default();
        assert_eq!(registry.kinds(), vec![RELIABLE_KIND]);

        let conn = registry
            .construct(RELIABLE_KIND, Arc::new(TcpTransport::new()))
            .unwrap();
        assert_eq!(conn.kind(), ConnectionType::Bidirectional);
        assert_eq!(conn.state(), ConnState::Unconnected);

        match registry.construct("datagram", Arc::new(TcpTransport::new())) {
            Err(Error::UnknownKind(tag)) => assert_eq!(tag, "datagram"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(ConnRegistry::empty().kinds().is_empty());
    }
}
