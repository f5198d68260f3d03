//! In-memory transport.
//!
//! [`MemoryListener`] hands out [`MemoryConnection`]s whose other end is a
//! [`MemoryClient`]. Tests use the client side to script arbitrary byte
//! streams (including fragmented frames), inspect everything the server
//! wrote, and inject write failures.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use crate::framing::{FrameConfig, FrameDecoder};
use crate::messages::{ClientMessage, MessageError, ServerMessage};
use crate::transport::{Connection, Listener, ReadOutcome};

#[derive(Debug)]
struct Pipe {
    to_server: VecDeque<u8>,
    to_client: Vec<u8>,
    peer_closed: bool,
    closed_with: Option<Duration>,
    fail_writes: bool,
    send_buffer: usize,
    /// Caps a single read so tests can force partial reads.
    read_limit: usize,
    writes: usize,
}

type SharedPipe = Rc<RefCell<Pipe>>;

/// Default send buffer for in-memory connections.
pub const MEMORY_SEND_BUFFER: usize = 1024;

/// Server side of an in-memory stream.
pub struct MemoryConnection {
    pipe: SharedPipe,
}

impl Connection for MemoryConnection {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let mut pipe = self.pipe.borrow_mut();
        if pipe.to_server.is_empty() {
            return Ok(if pipe.peer_closed {
                ReadOutcome::Closed
            } else {
                ReadOutcome::WouldBlock
            });
        }
        let n = buf.len().min(pipe.read_limit).min(pipe.to_server.len());
        for (slot, byte) in buf.iter_mut().zip(pipe.to_server.drain(..n)) {
            *slot = byte;
        }
        Ok(ReadOutcome::Data(n))
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut pipe = self.pipe.borrow_mut();
        if pipe.fail_writes || pipe.peer_closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
        }
        pipe.to_client.extend_from_slice(bytes);
        pipe.writes += 1;
        Ok(())
    }

    fn send_buffer_size(&self) -> usize {
        self.pipe.borrow().send_buffer
    }

    fn receive_buffer_size(&self) -> usize {
        4096
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn close(self: Box<Self>, linger: Duration) {
        self.pipe.borrow_mut().closed_with = Some(linger);
    }
}

/// Client side of an in-memory stream.
#[derive(Clone)]
pub struct MemoryClient {
    pipe: SharedPipe,
    decoder: Rc<RefCell<FrameDecoder>>,
}

impl MemoryClient {
    /// Queue raw bytes for the server to read.
    pub fn send_raw(&self, bytes: &[u8]) {
        self.pipe.borrow_mut().to_server.extend(bytes.iter().copied());
    }

    #[track_caller]
    pub fn send(&self, message: &ClientMessage) {
        self.send_raw(&message.encode());
    }

    /// Take every byte the server has written so far.
    pub fn take_bytes(&self) -> Vec<u8> {
        std::mem::take(&mut self.pipe.borrow_mut().to_client)
    }

    /// Decode every complete message the server has written so far.
    ///
    /// A trailing partial frame stays buffered for the next call.
    pub fn received(&self) -> Result<Vec<ServerMessage>, MessageError> {
        let bytes = self.take_bytes();
        let mut decoder = self.decoder.borrow_mut();
        decoder.feed(&bytes);
        let mut out = Vec::new();
        while let Some(frame) = decoder.next_frame()? {
            out.push(ServerMessage::decode(&frame)?);
        }
        Ok(out)
    }

    /// Close the client end; the server reads end-of-stream.
    pub fn hang_up(&self) {
        self.pipe.borrow_mut().peer_closed = true;
    }

    /// Make every subsequent server write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.pipe.borrow_mut().fail_writes = fail;
    }

    pub fn set_send_buffer(&self, size: usize) {
        self.pipe.borrow_mut().send_buffer = size.max(1);
    }

    pub fn set_read_limit(&self, limit: usize) {
        self.pipe.borrow_mut().read_limit = limit.max(1);
    }

    /// Linger the server passed when closing, if it closed.
    pub fn closed_with(&self) -> Option<Duration> {
        self.pipe.borrow().closed_with
    }

    /// Number of `write_all` calls the server made.
    pub fn write_count(&self) -> usize {
        self.pipe.borrow().writes
    }
}

/// Listener whose pending connections are created by [`MemoryListener::connect`].
#[derive(Clone, Default)]
pub struct MemoryListener {
    pending: Rc<RefCell<VecDeque<MemoryConnection>>>,
}

impl MemoryListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection; the server side is accepted on the next tick.
    pub fn connect(&self) -> MemoryClient {
        let pipe = Rc::new(RefCell::new(Pipe {
            to_server: VecDeque::new(),
            to_client: Vec::new(),
            peer_closed: false,
            closed_with: None,
            fail_writes: false,
            send_buffer: MEMORY_SEND_BUFFER,
            read_limit: usize::MAX,
            writes: 0,
        }));
        self.pending.borrow_mut().push_back(MemoryConnection { pipe: pipe.clone() });
        MemoryClient {
            pipe,
            decoder: Rc::new(RefCell::new(FrameDecoder::new(FrameConfig::server_stream()))),
        }
    }
}

impl Listener for MemoryListener {
    fn accept_pending(&mut self) -> io::Result<Option<Box<dyn Connection>>> {
        Ok(self
            .pending
            .borrow_mut()
            .pop_front()
            .map(|c| Box::new(c) as Box<dyn Connection>))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
