use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener as StdTcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::addr::Address;
use crate::lock;
use crate::transport::{Listener, Session, Stream, Transport};

const LISTENER_KEY: usize = 0;

/// Reliable-stream transport over plain TCP.
///
/// Every TCP connection is one session carrying exactly one stream. Paths
/// pinned on an address are carried along but TCP cannot steer by them, so
/// they only matter to the layers above.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    connect_timeout: Option<Duration>,
    io_timeout: Option<Duration>,
}

impl TcpTransport {
    /// Creates a transport with unbounded connect and io operations.
    pub fn new() -> TcpTransport {
        TcpTransport::default()
    }

    /// Bounds the time spent establishing a TCP connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> TcpTransport {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Bounds every read and write on the streams this transport produces.
    pub fn with_io_timeout(mut self, timeout: Duration) -> TcpTransport {
        self.io_timeout = Some(timeout);
        self
    }

    fn prepare(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(self.io_timeout)?;
        stream.set_write_timeout(self.io_timeout)?;
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn dial(&self, remote: &Address) -> io::Result<Box<dyn Session>> {
        log::debug!("Connecting to {remote}");
        let stream = match self.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&remote.host, timeout)?,
            None => TcpStream::connect(remote.host)?,
        };
        self.prepare(&stream)?;
        Ok(Box::new(TcpSession::new(stream)?))
    }

    fn listen(&self, local: &Address) -> io::Result<Box<dyn Listener>> {
        let inner = StdTcpListener::bind(local.host)?;
        inner.set_nonblocking(true)?;
        let poller = polling::Poller::new()?;
        unsafe {
            poller.add(&inner, polling::Event::none(LISTENER_KEY))?;
        }
        log::debug!("Listening on {}", inner.local_addr()?);
        Ok(Box::new(TcpListener {
            inner,
            poller,
            closed: AtomicBool::new(false),
            transport: self.clone(),
        }))
    }
}

/// Non-blocking TCP listener whose `accept` can be interrupted by `close`.
#[derive(Debug)]
pub struct TcpListener {
    inner: StdTcpListener,
    poller: polling::Poller,
    closed: AtomicBool,
    transport: TcpTransport,
}

impl Listener for TcpListener {
    fn accept(&self) -> io::Result<Box<dyn Session>> {
        let mut events = polling::Events::new();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "listener closed",
                ));
            }
            match self.inner.accept() {
                Ok((stream, addr)) => {
                    log::debug!("Accepted connection from: {addr}");
                    stream.set_nonblocking(false)?;
                    self.transport.prepare(&stream)?;
                    return Ok(Box::new(TcpSession::new(stream)?));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    events.clear();
                    self.poller
                        .modify(&self.inner, polling::Event::readable(LISTENER_KEY))?;
                    self.poller.wait(&mut events, None)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn close(&self) -> io::Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("Closing listener on {:?}", self.inner.local_addr());
            self.poller.notify()?;
        }
        Ok(())
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let _ = self.poller.delete(&self.inner);
    }
}

/// One TCP connection, handed out once as a stream.
#[derive(Debug)]
pub struct TcpSession {
    stream: Mutex<Option<TcpStream>>,
    peer: SocketAddr,
}

impl TcpSession {
    fn new(stream: TcpStream) -> io::Result<TcpSession> {
        let peer = stream.peer_addr()?;
        Ok(TcpSession {
            stream: Mutex::new(Some(stream)),
            peer,
        })
    }

    fn take_stream(&self) -> io::Result<Box<dyn Stream>> {
        lock(&self.stream)
            .take()
            .map(|inner| Box::new(TcpStreamHandle { inner }) as Box<dyn Stream>)
            .ok_or_else(|| io::Error::other("tcp session carries a single stream"))
    }
}

impl Session for TcpSession {
    fn open_stream(&self) -> io::Result<Box<dyn Stream>> {
        self.take_stream()
    }

    fn accept_stream(&self) -> io::Result<Box<dyn Stream>> {
        self.take_stream()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
    }
}

#[derive(Debug)]
struct TcpStreamHandle {
    inner: TcpStream,
}

impl Stream for TcpStreamHandle {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn close(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn local() -> Address {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_dial_and_accept_single_stream() {
        let transport = TcpTransport::new();
        let listener = transport.listen(&local()).unwrap();
        let addr = Address::new(listener.local_addr().unwrap());

        let dialer = thread::spawn(move || {
            let session = TcpTransport::new().dial(&addr).unwrap();
            let stream = session.open_stream().unwrap();
            assert!(session.open_stream().is_err());
            assert_eq!(stream.write(b"ping").unwrap(), 4);
            stream
        });

        let session = listener.accept().unwrap();
        let stream = session.accept_stream().unwrap();
        let mut buf = [0u8; 4];
        crate::transport::read_full(stream.as_ref(), &mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        dialer.join().unwrap().close().unwrap();
    }

    #[test]
    fn test_close_wakes_blocked_accept() {
        let listener: Arc<dyn Listener> = Arc::from(TcpTransport::new().listen(&local()).unwrap());
        let acceptor = {
            let listener = listener.clone();
            thread::spawn(move || listener.accept().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));
        listener.close().unwrap();
        let err = acceptor.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_bind_conflict_fails() {
        let transport = TcpTransport::new();
        let first = transport.listen(&local()).unwrap();
        let taken = Address::new(first.local_addr().unwrap());
        assert!(transport.listen(&taken).is_err());
    }
}
