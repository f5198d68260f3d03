//! Polled, non-blocking socket transport.
//!
//! The replication loop is single-threaded: every tick it accepts whatever
//! connections are pending and reads whatever bytes have already arrived,
//! without ever waiting on a socket. [`Listener`] and [`Connection`] are the
//! seams the loop talks to; [`TcpAcceptor`]/[`TcpConnection`] implement them
//! over real sockets and [`crate::memory`] implements them in memory for
//! tests.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};

/// Result of a single non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were copied into the buffer.
    Data(usize),
    /// Nothing is available right now.
    WouldBlock,
    /// The peer closed its end of the stream.
    Closed,
}

/// One duplex client stream.
pub trait Connection {
    /// Read whatever is available without blocking.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    /// Write all bytes. May block up to the configured write timeout.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Preferred size of a single outbound write.
    fn send_buffer_size(&self) -> usize;

    /// Preferred size of a single inbound read.
    fn receive_buffer_size(&self) -> usize;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Close the stream, giving already written bytes up to `linger` to reach
    /// the peer. Never blocks the caller.
    fn close(self: Box<Self>, linger: Duration);
}

/// Source of new connections.
pub trait Listener {
    /// Accept one pending connection, or `None` when nobody is waiting.
    fn accept_pending(&mut self) -> io::Result<Option<Box<dyn Connection>>>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// TCP socket options applied to the listener and every accepted stream.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm for lower latency. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Keepalive idle time before the first probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
    /// Enable `SO_REUSEADDR` on the listener. Default: true except on Windows.
    pub reuse_addr: bool,
    /// Upper bound on a single blocking write. Default: 5s.
    pub write_timeout: Duration,
    /// Listen backlog. Default: 128.
    pub backlog: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            reuse_addr: !cfg!(target_os = "windows"),
            write_timeout: Duration::from_secs(5),
            backlog: 128,
        }
    }
}

// ---------------------------------------------------------------------------
// TCP listener
// ---------------------------------------------------------------------------

/// Non-blocking TCP listener.
pub struct TcpAcceptor {
    listener: TcpListener,
    config: SocketConfig,
}

impl TcpAcceptor {
    /// Bind a listener with `SO_REUSEADDR` and dual-stack IPv6 where
    /// applicable. Fails if the port is already in use.
    pub fn bind(addr: SocketAddr, config: SocketConfig) -> io::Result<Self> {
        let domain = if addr.is_ipv6() {
            socket2::Domain::IPV6
        } else {
            socket2::Domain::IPV4
        };
        let socket =
            socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

        if config.reuse_addr {
            socket.set_reuse_address(true)?;
        }
        if addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }

        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(config.backlog)?;

        Ok(Self {
            listener: socket.into(),
            config,
        })
    }
}

impl Listener for TcpAcceptor {
    fn accept_pending(&mut self) -> io::Result<Option<Box<dyn Connection>>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                let connection = TcpConnection::new(stream, peer, &self.config)?;
                Ok(Some(Box::new(connection)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

// ---------------------------------------------------------------------------
// TCP stream
// ---------------------------------------------------------------------------

/// An accepted client stream.
///
/// The socket stays in blocking mode with a write timeout; reads switch to
/// non-blocking mode for the duration of the call.
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    send_buffer: usize,
    receive_buffer: usize,
}

const FALLBACK_BUFFER_SIZE: usize = 8192;

impl TcpConnection {
    fn new(stream: TcpStream, peer: SocketAddr, config: &SocketConfig) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(config.tcp_nodelay)?;
        stream.set_write_timeout(Some(config.write_timeout))?;

        let sock_ref = SockRef::from(&stream);
        if config.keepalive_enabled {
            let keepalive = TcpKeepalive::new()
                .with_time(config.keepalive_idle)
                .with_interval(config.keepalive_interval);
            sock_ref.set_tcp_keepalive(&keepalive)?;
        }

        let send_buffer = sock_ref
            .send_buffer_size()
            .unwrap_or(FALLBACK_BUFFER_SIZE)
            .max(1);
        let receive_buffer = sock_ref
            .recv_buffer_size()
            .unwrap_or(FALLBACK_BUFFER_SIZE)
            .max(1);

        Ok(Self {
            stream,
            peer,
            send_buffer,
            receive_buffer,
        })
    }
}

impl Connection for TcpConnection {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        self.stream.set_nonblocking(true)?;
        let result = self.stream.read(buf);
        self.stream.set_nonblocking(false)?;

        match result {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(ReadOutcome::WouldBlock)
            }
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    fn send_buffer_size(&self) -> usize {
        self.send_buffer
    }

    fn receive_buffer_size(&self) -> usize {
        self.receive_buffer
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn close(self: Box<Self>, linger: Duration) {
        let stream = self.stream;
        // A lingering close blocks, so it happens off the tick thread.
        let spawned = std::thread::Builder::new()
            .name("meridian-close".into())
            .spawn(move || {
                let sock_ref = SockRef::from(&stream);
                if let Err(e) = sock_ref.set_linger(Some(linger)) {
                    tracing::debug!("set_linger failed: {e}");
                }
                if let Err(e) = stream.shutdown(Shutdown::Both) {
                    tracing::debug!("shutdown failed: {e}");
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("could not spawn close thread: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpStream};
    use std::time::Instant;

    fn loopback() -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
    }

    fn accept_within(acceptor: &mut TcpAcceptor, limit: Duration) -> Box<dyn Connection> {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(conn) = acceptor.accept_pending().unwrap() {
                return conn;
            }
            assert!(Instant::now() < deadline, "no connection accepted");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_accept_pending_is_non_blocking() {
        let mut acceptor = TcpAcceptor::bind(loopback(), SocketConfig::default()).unwrap();
        assert!(acceptor.accept_pending().unwrap().is_none());
        assert!(acceptor.local_addr().unwrap().port() != 0);
    }

    #[test]
    fn test_bind_fails_when_port_taken() {
        let first = TcpAcceptor::bind(loopback(), SocketConfig::default()).unwrap();
        let taken = first.local_addr().unwrap();
        let config = SocketConfig {
            reuse_addr: false,
            ..Default::default()
        };
        assert!(TcpAcceptor::bind(taken, config).is_err());
    }

    #[test]
    fn test_read_write_over_loopback() {
        let mut acceptor = TcpAcceptor::bind(loopback(), SocketConfig::default()).unwrap();
        let mut client = TcpStream::connect(acceptor.local_addr().unwrap()).unwrap();
        let mut server_side = accept_within(&mut acceptor, Duration::from_secs(2));

        let mut buf = vec![0u8; 64];
        assert_eq!(
            server_side.read_available(&mut buf).unwrap(),
            ReadOutcome::WouldBlock
        );

        client.write_all(b"ping").unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let n = loop {
            match server_side.read_available(&mut buf).unwrap() {
                ReadOutcome::Data(n) => break n,
                ReadOutcome::WouldBlock if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(&buf[..n], b"ping");

        server_side.write_all(b"pong").unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");
        assert!(server_side.send_buffer_size() > 0);
    }

    #[test]
    fn test_close_shuts_the_stream_down() {
        let mut acceptor = TcpAcceptor::bind(loopback(), SocketConfig::default()).unwrap();
        let mut client = TcpStream::connect(acceptor.local_addr().unwrap()).unwrap();
        let server_side = accept_within(&mut acceptor, Duration::from_secs(2));
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        server_side.close(Duration::from_secs(1));
        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_peer_close_is_reported() {
        let mut acceptor = TcpAcceptor::bind(loopback(), SocketConfig::default()).unwrap();
        let client = TcpStream::connect(acceptor.local_addr().unwrap()).unwrap();
        let mut server_side = accept_within(&mut acceptor, Duration::from_secs(2));
        drop(client);

        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match server_side.read_available(&mut buf) {
                Ok(ReadOutcome::Closed) | Err(_) => break,
                Ok(_) => {
                    assert!(Instant::now() < deadline, "close never observed");
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }
    }
}
