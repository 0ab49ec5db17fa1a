//! In-memory stream used by unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::transport::Stream;

#[derive(Debug, Default)]
struct Script {
    input: Mutex<VecDeque<u8>>,
    written: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    closed: AtomicBool,
}

/// A stream that replays fixed input and records everything written.
///
/// Clones share the same script, so a test can keep a handle after boxing
/// one into a connection.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedStream {
    script: Arc<Script>,
    chunking: Option<usize>,
    fail_close: bool,
}

impl ScriptedStream {
    pub(crate) fn new(input: &[u8]) -> ScriptedStream {
        let stream = ScriptedStream::default();
        lock(&stream.script.input).extend(input.iter().copied());
        stream
    }

    /// Successive reads return 1, 2, .., `max`, 1, 2, .. bytes.
    pub(crate) fn with_chunking(mut self, max: usize) -> ScriptedStream {
        self.chunking = Some(max.max(1));
        self
    }

    pub(crate) fn failing_close(mut self) -> ScriptedStream {
        self.fail_close = true;
        self
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        lock(&self.script.written).clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.script.closed.load(Ordering::SeqCst)
    }
}

impl Stream for ScriptedStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let call = self.script.reads.fetch_add(1, Ordering::SeqCst);
        let limit = match self.chunking {
            Some(max) => 1 + call % max,
            None => buf.len(),
        };
        let mut input = lock(&self.script.input);
        let n = limit.min(buf.len()).min(input.len());
        for (dst, src) in buf.iter_mut().zip(input.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.script.written).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn close(&self) -> io::Result<()> {
        self.script.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(io::Error::other("scripted close failure"));
        }
        Ok(())
    }
}
