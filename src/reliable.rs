use std::io;
use std::sync::{Arc, Mutex, OnceLock};

use uuid::Uuid;

use crate::addr::{Address, Path};
use crate::conn::{ConnState, ConnectionType, MetricCounters, PathConn, PathMetrics};
use crate::error::{Error, Result};
use crate::gate::ReadyGate;
use crate::lock;
use crate::transport::{Listener, Session, Stream, Transport};

/// A connection carried by one reliable, ordered stream.
///
/// On the dial side the stream is opened by [`PathConn::dial`]. On the
/// listen side the socket accepts streams and hands them over with
/// [`PathConn::attach_stream`]; readers that arrive earlier wait on the
/// connection's readiness gate.
#[derive(Debug)]
pub struct ReliableConn {
    id: Uuid,
    transport: Arc<dyn Transport>,
    stream: OnceLock<Box<dyn Stream>>,
    session: OnceLock<Box<dyn Session>>,
    listener: OnceLock<Box<dyn Listener>>,
    state: Mutex<ConnState>,
    path: Mutex<Option<Path>>,
    remote: Mutex<Option<Address>>,
    local: Mutex<Option<Address>>,
    ready: ReadyGate,
    metrics: MetricCounters,
}

impl ReliableConn {
    /// Creates an unconnected connection on top of `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> ReliableConn {
        ReliableConn {
            id: Uuid::new_v4(),
            transport,
            stream: OnceLock::new(),
            session: OnceLock::new(),
            listener: OnceLock::new(),
            state: Mutex::new(ConnState::Unconnected),
            path: Mutex::new(None),
            remote: Mutex::new(None),
            local: Mutex::new(None),
            ready: ReadyGate::new(),
            metrics: MetricCounters::default(),
        }
    }

    /// Registry constructor.
    pub fn create(transport: Arc<dyn Transport>) -> Arc<dyn PathConn> {
        Arc::new(ReliableConn::new(transport))
    }

    fn set_state(&self, state: ConnState) {
        *lock(&self.state) = state;
    }

    fn is_closed(&self) -> bool {
        *lock(&self.state) == ConnState::Closed
    }

    /// The attached stream, waiting on the readiness gate if there is none.
    fn ready_stream(&self) -> Result<&dyn Stream> {
        if self.is_closed() {
            return Err(Error::ClosedConnection);
        }
        if self.stream.get().is_none() {
            log::debug!("Connection {} waiting for its stream", self.id);
            self.ready.wait();
        }
        if self.is_closed() {
            return Err(Error::ClosedConnection);
        }
        self.stream
            .get()
            .map(|s| &**s)
            .ok_or(Error::ClosedConnection)
    }
}

impl PathConn for ReliableConn {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> ConnectionType {
        ConnectionType::Bidirectional
    }

    fn state(&self) -> ConnState {
        *lock(&self.state)
    }

    fn dial(&self, remote: &Address, path: &Path) -> Result<()> {
        match self.state() {
            ConnState::Closed => return Err(Error::ClosedConnection),
            ConnState::Unconnected => {}
            _ => return Err(Error::StreamAttached),
        }

        let mut target = remote.clone();
        if !target.has_path() {
            target.path = Some(path.clone());
        }
        self.set_remote(target.clone());
        self.set_path(path.clone());
        self.set_state(ConnState::Pending);

        log::debug!("Dialing to {target}");
        let dial_err = |source: io::Error| Error::Dial {
            addr: target.to_string(),
            source,
        };
        let opened = self
            .transport
            .dial(&target)
            .and_then(|session| session.open_stream().map(|stream| (session, stream)));
        let (session, stream) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.set_state(ConnState::Unconnected);
                return Err(dial_err(e));
            }
        };
        log::debug!("Opened stream to {target}");

        let _ = self.session.set(session);
        self.attach_stream(stream)
    }

    fn listen(&self, local: &Address) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedConnection);
        }
        if self.listener.get().is_some() {
            return Err(Error::AlreadyListening);
        }

        let listener = self.transport.listen(local).map_err(|source| Error::Bind {
            addr: local.to_string(),
            source,
        })?;
        let bound = match listener.local_addr() {
            Ok(host) => Address {
                host,
                path: local.path.clone(),
            },
            Err(_) => local.clone(),
        };
        log::debug!("Connection {} listening on {bound}", self.id);

        if self.listener.set(listener).is_err() {
            return Err(Error::AlreadyListening);
        }
        self.set_local(bound);
        self.set_state(ConnState::Pending);
        Ok(())
    }

    fn accept_stream(&self) -> Result<Box<dyn Stream>> {
        let listener = self.listener.get().ok_or_else(|| {
            Error::Accept(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection has no listener",
            ))
        })?;
        log::debug!("Accepting on {:?}", listener.local_addr());
        let session = listener.accept().map_err(Error::Accept)?;
        let stream = session.accept_stream().map_err(Error::Accept)?;
        log::debug!("Accepted stream from {:?}", session.peer_addr());
        Ok(stream)
    }

    fn attach_stream(&self, stream: Box<dyn Stream>) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state == ConnState::Closed {
                return Err(Error::ClosedConnection);
            }
            self.stream.set(stream).map_err(|_| Error::StreamAttached)?;
            *state = ConnState::Established;
        }
        self.ready.fire();
        log::debug!("Connection {} established", self.id);
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.ready_stream()?;
        let n = stream.read(buf)?;
        self.metrics.record_read(n);
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::ClosedConnection);
        }
        let stream = self.stream.get().ok_or(Error::NotConnected)?;
        let n = stream.write(buf)?;
        self.metrics.record_write(n);
        Ok(n)
    }

    fn close(&self) -> Result<()> {
        self.set_state(ConnState::Closed);
        self.ready.fire();
        log::debug!("Closing connection {}", self.id);

        let listener = self.listener.get().map_or(Ok(()), |l| l.close());
        let stream = self.stream.get().map_or(Ok(()), |s| s.close());
        stream.and(listener).map_err(Error::from)
    }

    fn metrics(&self) -> PathMetrics {
        self.metrics.snapshot()
    }

    fn path(&self) -> Option<Path> {
        lock(&self.path).clone()
    }

    fn set_path(&self, path: Path) {
        *lock(&self.path) = Some(path);
    }

    fn remote(&self) -> Option<Address> {
        lock(&self.remote).clone()
    }

    fn set_remote(&self, remote: Address) {
        *lock(&self.remote) = Some(remote);
    }

    fn local(&self) -> Option<Address> {
        lock(&self.local).clone()
    }

    fn set_local(&self, local: Address) {
        *lock(&self.local) = Some(local);
    }
}
