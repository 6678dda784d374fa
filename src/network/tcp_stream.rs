use std::io::{self, ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{Duration, NonBlockingStream};

/// A non-blocking TCP stream to use with Deltaplay sessions.
///
/// Connecting and accepting block; once constructed the stream is switched to non-blocking
/// mode with Nagle's algorithm disabled, since every frame sends one small input message.
#[derive(Debug)]
pub struct TcpNonBlockingStream {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpNonBlockingStream {
    /// Connects to a host at `addr`.
    pub fn connect(addr: SocketAddr) -> Result<Self, io::Error> {
        Self::from_stream(TcpStream::connect(addr)?)
    }

    /// Connects to a host at `addr`, giving up after `timeout`.
    pub fn connect_timeout(addr: SocketAddr, timeout: Duration) -> Result<Self, io::Error> {
        Self::from_stream(TcpStream::connect_timeout(&addr, timeout)?)
    }

    /// Listens on 0.0.0.0:port and blocks until one peer connects.
    pub fn accept_on_port(port: u16) -> Result<Self, io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let listener = TcpListener::bind(addr)?;
        Self::accept(&listener)
    }

    /// Blocks until `listener` yields a connection.
    pub fn accept(listener: &TcpListener) -> Result<Self, io::Error> {
        let (stream, _) = listener.accept()?;
        Self::from_stream(stream)
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self, io::Error> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self { stream, peer })
    }

    /// The local address of the stream.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.stream.local_addr()
    }
}

impl NonBlockingStream for TcpNonBlockingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "connection to {:?} reset by peer",
                    self.peer
                );
                // treat a reset like an orderly close, the session reports the hangup
                Ok(0)
            },
            other => other,
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[track_caller]
    fn connected_pair() -> (TcpNonBlockingStream, TcpNonBlockingStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpNonBlockingStream::connect(addr).unwrap();
        let server = TcpNonBlockingStream::accept(&listener).unwrap();
        (server, client)
    }

    #[track_caller]
    fn read_exact_polling(stream: &mut TcpNonBlockingStream, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        for _ in 0..1000 {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                },
                Err(err) => panic!("read failed: {err}"),
            }
            if out.len() >= len {
                break;
            }
        }
        out
    }

    #[test]
    #[serial]
    #[cfg(not(miri))] // Miri cannot open sockets
    fn empty_stream_would_block() {
        let (mut server, _client) = connected_pair();
        let mut buf = [0u8; 8];
        let err = server.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    #[serial]
    #[cfg(not(miri))] // Miri cannot open sockets
    fn bytes_arrive_in_order() {
        let (mut server, mut client) = connected_pair();
        assert_eq!(client.write(b"hello").unwrap(), 5);
        assert_eq!(client.write(b" world").unwrap(), 6);
        assert_eq!(read_exact_polling(&mut server, 11), b"hello world");
        assert_eq!(server.peer_addr(), client.local_addr().ok());
    }

    #[test]
    #[serial]
    #[cfg(not(miri))] // Miri cannot open sockets
    fn closed_peer_reads_zero() {
        let (mut server, client) = connected_pair();
        drop(client);
        assert!(read_exact_polling(&mut server, 1).is_empty());
    }
}
