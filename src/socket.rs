use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::addr::{Address, Path};
use crate::conn::{ConnConstructor, ConnRegistry, PathConn, RELIABLE_KIND};
use crate::error::{Error, Result};
use crate::handshake::{DialPacket, PACKET_SIZE, encode_preamble, read_preamble};
use crate::lock;
use crate::reliable::ReliableConn;
use crate::tcp::TcpTransport;
use crate::transport::{Stream, Transport};

/// Name of the background thread admitting incoming streams.
pub const ACCEPT_THREAD_NAME: &str = "mpath-accept";

/// Name of the short-lived threads reading the preamble of one stream.
pub const ADMIT_THREAD_NAME: &str = "mpath-admit";

/// Per-dial options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialOptions {
    /// Announce our address and the chosen path to the listener.
    pub send_addr_packet: bool,
}

/// A socket multiplexing several path-bound connections to a peer.
///
/// The socket keeps two lists. The listen side starts with the bootstrap
/// connection created by [`MpSocket::listen`], which owns the passive
/// listener; every further incoming stream becomes a new connection appended
/// by the accept loop. The dial side holds the connections created by
/// [`MpSocket::dial`], in call order.
///
/// # Example
///
/// ```rust,no_run
/// use mpath_socket::{DialOptions, MpSocket, Path};
///
/// let server = MpSocket::new("127.0.0.1:40000");
/// server.listen()?;
///
/// let client = MpSocket::new("127.0.0.1:40001");
/// client.listen()?;
/// let paths = [Path::new("path-a"), Path::new("path-b")];
/// let remote = "127.0.0.1:40000".parse()?;
/// let conns = client.dial_all(&remote, &paths, DialOptions { send_addr_packet: true })?;
///
/// let peer = server.wait_for_dial_in(true)?;
/// println!("{} dialed in, {} connections", peer.unwrap(), conns.len());
/// # Ok::<(), mpath_socket::Error>(())
/// ```
///
/// Cloning an `MpSocket` yields another handle to the same socket.
#[derive(Debug, Clone)]
pub struct MpSocket {
    inner: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    local: String,
    local_addr: Mutex<Option<Address>>,
    transport: Arc<dyn Transport>,
    constructor: ConnConstructor,
    handshake_size: usize,
    listen_conns: Mutex<Vec<Arc<dyn PathConn>>>,
    dial_conns: Mutex<Vec<Arc<dyn PathConn>>>,
    armed: AtomicBool,
    // Taken by the first stream whose preamble decodes; it becomes the
    // bootstrap's stream.
    first_stream: Mutex<Option<Sender<Option<DialPacket>>>>,
    accept_error: Mutex<Option<Arc<Error>>>,
}

/// Configures an [`MpSocket`].
#[derive(Debug, Clone)]
pub struct SocketBuilder {
    local: String,
    transport: Arc<dyn Transport>,
    registry: ConnRegistry,
    kind: String,
    handshake_size: usize,
}

impl SocketBuilder {
    /// Starts a builder for a socket announcing itself as `local`.
    pub fn new(local: impl Into<String>) -> SocketBuilder {
        SocketBuilder {
            local: local.into(),
            transport: Arc::new(TcpTransport::new()),
            registry: ConnRegistry::default(),
            kind: RELIABLE_KIND.to_string(),
            handshake_size: PACKET_SIZE,
        }
    }

    /// Carrier used by every connection of the socket.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> SocketBuilder {
        self.transport = transport;
        self
    }

    /// Registry to look the connection kind up in.
    pub fn registry(mut self, registry: ConnRegistry) -> SocketBuilder {
        self.registry = registry;
        self
    }

    /// Connection kind tag, [`RELIABLE_KIND`] by default.
    pub fn kind(mut self, kind: impl Into<String>) -> SocketBuilder {
        self.kind = kind.into();
        self
    }

    /// Largest handshake packet sent or accepted.
    pub fn handshake_size(mut self, size: usize) -> SocketBuilder {
        self.handshake_size = size;
        self
    }

    /// Builds the socket. Fails if the kind is not registered.
    pub fn build(self) -> Result<MpSocket> {
        let constructor = self.registry.constructor(&self.kind)?;
        Ok(MpSocket {
            inner: Arc::new(Shared::new(
                self.local,
                self.transport,
                constructor,
                self.handshake_size,
            )),
        })
    }
}

impl MpSocket {
    /// Creates a TCP-backed socket for the local endpoint `local`
    /// (`ip:port`). The address is parsed lazily.
    pub fn new(local: impl Into<String>) -> MpSocket {
        MpSocket {
            inner: Arc::new(Shared::new(
                local.into(),
                Arc::new(TcpTransport::new()),
                ReliableConn::create,
                PACKET_SIZE,
            )),
        }
    }

    /// Starts a [`SocketBuilder`].
    pub fn builder(local: impl Into<String>) -> SocketBuilder {
        SocketBuilder::new(local)
    }

    /// Binds the bootstrap connection on the local address.
    ///
    /// On success the local address becomes the one actually bound, so a
    /// port of 0 is replaced by the kernel's choice.
    pub fn listen(&self) -> Result<()> {
        if !lock(&self.inner.listen_conns).is_empty() {
            return Err(Error::AlreadyListening);
        }
        let local = self.inner.resolve_local()?;
        let conn = self.inner.new_conn();
        let bound = conn.listen(&local);

        let mut listen_conns = lock(&self.inner.listen_conns);
        if !listen_conns.is_empty() {
            // lost a race against a concurrent listen
            if bound.is_ok() {
                let _ = conn.close();
            }
            return Err(Error::AlreadyListening);
        }
        bound?;
        if let Some(bound) = conn.local() {
            *lock(&self.inner.local_addr) = Some(bound);
        }
        log::debug!("Socket listening with bootstrap connection {}", conn.id());
        listen_conns.push(conn);
        Ok(())
    }

    /// Arms the accept loop and waits for the first incoming stream.
    ///
    /// The first stream whose preamble decodes is attached to the bootstrap
    /// connection, which releases readers already blocked on it. Streams
    /// with a garbled preamble are dropped. With `wait` set, the stream must
    /// open with a handshake and the announced remote address is returned;
    /// its path is recorded on the bootstrap connection.
    pub fn wait_for_dial_in(&self, wait: bool) -> Result<Option<Address>> {
        let bootstrap = self.inner.bootstrap()?;
        let first = self.inner.arm()?;
        if let Err(e) = self.inner.spawn_accept_loop(bootstrap) {
            self.inner.disarm();
            return Err(e);
        }

        let packet = first.recv().map_err(|_| self.inner.stopped_error())?;
        if !wait {
            return Ok(None);
        }
        match packet {
            Some(packet) => Ok(Some(packet.addr)),
            None => Err(Error::Handshake(
                "first stream carries no dial packet".to_string(),
            )),
        }
    }

    /// Dials `remote` over `path` and registers the new connection.
    ///
    /// The stream always starts with its kind tag; with
    /// `options.send_addr_packet` the tag is followed by a [`DialPacket`]
    /// announcing our address and `path`.
    pub fn dial(
        &self,
        remote: &Address,
        path: &Path,
        options: DialOptions,
    ) -> Result<Arc<dyn PathConn>> {
        let local = self.inner.resolve_local()?;
        let conn = self.inner.new_conn();
        conn.set_local(local.clone());
        conn.dial(remote, path)?;

        let packet = options.send_addr_packet.then(|| DialPacket {
            addr: local,
            path: path.clone(),
        });
        let sent = encode_preamble(packet.as_ref(), self.inner.handshake_size)
            .and_then(|preamble| conn.write_all(&preamble));
        if let Err(e) = sent {
            let _ = conn.close();
            return Err(e);
        }

        log::debug!("Dialed connection {} to {remote} over {path}", conn.id());
        lock(&self.inner.dial_conns).push(conn.clone());
        Ok(conn)
    }

    /// Arms the accept loop in the background, then dials `remote` once per
    /// path in order, stopping at the first error.
    ///
    /// Returns the bootstrap connection followed by the dialed ones.
    pub fn dial_all(
        &self,
        remote: &Address,
        paths: &[Path],
        options: DialOptions,
    ) -> Result<Vec<Arc<dyn PathConn>>> {
        let bootstrap = self.inner.bootstrap()?;
        // nobody waits for the first stream here
        let _first = self.inner.arm()?;
        if let Err(e) = self.inner.spawn_accept_loop(bootstrap.clone()) {
            self.inner.disarm();
            return Err(e);
        }

        let mut conns = Vec::with_capacity(paths.len() + 1);
        conns.push(bootstrap);
        for path in paths {
            conns.push(self.dial(remote, path, options)?);
        }
        Ok(conns)
    }

    /// Listen-side then dial-side connections, as of now.
    pub fn connections(&self) -> Vec<Arc<dyn PathConn>> {
        let mut conns = self.listen_connections();
        conns.extend(self.dial_connections());
        conns
    }

    /// Dial-side connections, as of now.
    pub fn dial_connections(&self) -> Vec<Arc<dyn PathConn>> {
        lock(&self.inner.dial_conns).clone()
    }

    /// Listen-side connections, as of now. The bootstrap comes first.
    pub fn listen_connections(&self) -> Vec<Arc<dyn PathConn>> {
        lock(&self.inner.listen_conns).clone()
    }

    /// Closes every dial-side connection and returns the errors met on the
    /// way. Listen-side connections are left alone.
    pub fn close_all(&self) -> Vec<Error> {
        self.dial_connections()
            .iter()
            .filter_map(|conn| conn.close().err())
            .collect()
    }

    /// The error that stopped the accept loop, if it has stopped.
    pub fn accept_error(&self) -> Option<Arc<Error>> {
        lock(&self.inner.accept_error).clone()
    }

    /// The parsed local address, once `listen` or `dial` resolved it.
    pub fn local_addr(&self) -> Option<Address> {
        lock(&self.inner.local_addr).clone()
    }
}

impl Shared {
    fn new(
        local: String,
        transport: Arc<dyn Transport>,
        constructor: ConnConstructor,
        handshake_size: usize,
    ) -> Shared {
        Shared {
            local,
            local_addr: Mutex::new(None),
            transport,
            constructor,
            handshake_size,
            listen_conns: Mutex::new(Vec::new()),
            dial_conns: Mutex::new(Vec::new()),
            armed: AtomicBool::new(false),
            first_stream: Mutex::new(None),
            accept_error: Mutex::new(None),
        }
    }

    fn resolve_local(&self) -> Result<Address> {
        let mut local_addr = lock(&self.local_addr);
        if let Some(addr) = local_addr.as_ref() {
            return Ok(addr.clone());
        }
        let addr: Address = self.local.parse()?;
        *local_addr = Some(addr.clone());
        Ok(addr)
    }

    fn new_conn(&self) -> Arc<dyn PathConn> {
        (self.constructor)(self.transport.clone())
    }

    fn bootstrap(&self) -> Result<Arc<dyn PathConn>> {
        lock(&self.listen_conns)
            .first()
            .cloned()
            .ok_or(Error::NotListening)
    }

    /// Claims the accept loop. The receiver yields the first stream's packet.
    fn arm(&self) -> Result<Receiver<Option<DialPacket>>> {
        self.armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::AlreadyArmed)?;
        let (tx, rx) = mpsc::channel();
        *lock(&self.first_stream) = Some(tx);
        Ok(rx)
    }

    fn disarm(&self) {
        lock(&self.first_stream).take();
        self.armed.store(false, Ordering::Release);
    }

    fn record_accept_error(&self, e: Error) {
        *lock(&self.accept_error) = Some(Arc::new(e));
    }

    fn stopped_error(&self) -> Error {
        let reason = lock(&self.accept_error)
            .as_ref()
            .map_or_else(|| "accept loop stopped".to_string(), |e| e.to_string());
        Error::Accept(io::Error::new(io::ErrorKind::NotConnected, reason))
    }

    fn spawn_accept_loop(self: &Arc<Self>, bootstrap: Arc<dyn PathConn>) -> Result<()> {
        let shared = self.clone();
        thread::Builder::new()
            .name(ACCEPT_THREAD_NAME.to_string())
            .spawn(move || shared.accept_loop(bootstrap))?;
        Ok(())
    }

    /// Accepts streams until the listener fails. Each stream's preamble is
    /// read on its own thread, so a silent peer only stalls itself.
    fn accept_loop(self: Arc<Self>, bootstrap: Arc<dyn PathConn>) {
        loop {
            log::debug!("Accepting new stream on listen socket");
            let stream = match bootstrap.accept_stream() {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("Accept loop stopped: {e}");
                    self.record_accept_error(e);
                    lock(&self.first_stream).take();
                    return;
                }
            };

            let shared = self.clone();
            let bootstrap = bootstrap.clone();
            let spawned = thread::Builder::new()
                .name(ADMIT_THREAD_NAME.to_string())
                .spawn(move || {
                    if let Err(e) = shared.admit(&bootstrap, stream) {
                        log::warn!("Dropping incoming stream: {e}");
                    }
                });
            if let Err(e) = spawned {
                log::warn!("Dropping incoming stream: {e}");
            }
        }
    }

    fn admit(&self, bootstrap: &Arc<dyn PathConn>, stream: Box<dyn Stream>) -> Result<()> {
        let preamble = read_preamble(stream.as_ref(), self.handshake_size)?;

        let first = lock(&self.first_stream).take();
        if let Some(first) = first {
            if let Some(packet) = &preamble.packet {
                bootstrap.set_remote(packet.addr.clone());
                bootstrap.set_path(packet.path.clone());
            }
            bootstrap.attach_stream(stream)?;
            log::debug!("Set connection ready");
            let _ = first.send(preamble.packet);
            return Ok(());
        }

        let conn = self.new_conn();
        let local = lock(&self.local_addr).clone();
        if let Some(local) = local {
            conn.set_local(local);
        }
        if let Some(packet) = preamble.packet {
            conn.set_remote(packet.addr);
            conn.set_path(packet.path);
        }
        conn.attach_stream(stream)?;
        log::debug!("Accepted new stream on listen socket as {}", conn.id());
        lock(&self.listen_conns).push(conn);
        Ok(())
    }
}
