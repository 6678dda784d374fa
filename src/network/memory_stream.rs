//! In-process byte pipe implementing [`NonBlockingStream`].
//!
//! Used by tests, benchmarks and the loopback demo to run two sessions in one process
//! without sockets. Each direction is a bounded byte queue shared by both ends.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::NonBlockingStream;

/// Bytes each direction buffers before `write` starts returning partial counts.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug)]
struct Pipe {
    bytes: VecDeque<u8>,
    capacity: usize,
    closed: bool,
}

impl Pipe {
    fn new(capacity: usize) -> Arc<Mutex<Pipe>> {
        Arc::new(Mutex::new(Pipe {
            bytes: VecDeque::new(),
            capacity,
            closed: false,
        }))
    }
}

/// One end of an in-memory, reliable, ordered byte stream.
///
/// Dropping an end (or calling [`close`](MemoryStream::close)) closes both directions:
/// the other end reads `Ok(0)` once the buffered bytes are consumed, and its writes fail
/// with [`io::ErrorKind::BrokenPipe`].
#[derive(Debug)]
pub struct MemoryStream {
    inbound: Arc<Mutex<Pipe>>,
    outbound: Arc<Mutex<Pipe>>,
}

impl MemoryStream {
    /// Creates two connected ends with [`DEFAULT_PIPE_CAPACITY`] per direction.
    #[must_use]
    pub fn pair() -> (MemoryStream, MemoryStream) {
        Self::pair_with_capacity(DEFAULT_PIPE_CAPACITY)
    }

    /// Creates two connected ends that each buffer at most `capacity` unread bytes.
    ///
    /// A small capacity forces partial writes, which is useful to exercise send buffering.
    #[must_use]
    pub fn pair_with_capacity(capacity: usize) -> (MemoryStream, MemoryStream) {
        let a_to_b = Pipe::new(capacity);
        let b_to_a = Pipe::new(capacity);
        let a = MemoryStream {
            inbound: Arc::clone(&b_to_a),
            outbound: Arc::clone(&a_to_b),
        };
        let b = MemoryStream {
            inbound: a_to_b,
            outbound: b_to_a,
        };
        (a, b)
    }

    /// Closes both directions.
    pub fn close(&self) {
        self.inbound.lock().closed = true;
        self.outbound.lock().closed = true;
    }

    /// Bytes written by the other end and not read yet.
    #[must_use]
    pub fn pending_inbound(&self) -> usize {
        self.inbound.lock().bytes.len()
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl NonBlockingStream for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.inbound.lock();
        if pipe.bytes.is_empty() {
            if pipe.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let count = buf.len().min(pipe.bytes.len());
        for (dst, src) in buf.iter_mut().zip(pipe.bytes.drain(..count)) {
            *dst = src;
        }
        Ok(count)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.outbound.lock();
        if pipe.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let room = pipe.capacity.saturating_sub(pipe.bytes.len());
        if room == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let count = room.min(buf.len());
        pipe.bytes.extend(buf.iter().take(count));
        Ok(count)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
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

    #[test]
    fn bytes_flow_both_ways() {
        let (mut a, mut b) = MemoryStream::pair();
        assert_eq!(a.write(b"ping").unwrap(), 4);
        assert_eq!(b.write(b"pong!").unwrap(), 5);

        let mut buf = [0u8; 16];
        assert_eq!(b.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(a.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"pong!");
    }

    #[test]
    fn empty_pipe_would_block() {
        let (mut a, _b) = MemoryStream::pair();
        let mut buf = [0u8; 4];
        let err = a.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn full_pipe_accepts_partial_writes() {
        let (mut a, mut b) = MemoryStream::pair_with_capacity(3);
        assert_eq!(a.write(b"abcde").unwrap(), 3);
        assert_eq!(
            a.write(b"de").unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        let mut buf = [0u8; 2];
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(a.write(b"de").unwrap(), 2);
        assert_eq!(b.pending_inbound(), 3);
    }

    #[test]
    fn dropped_end_reads_as_closed_after_draining() {
        let (mut a, mut b) = MemoryStream::pair();
        a.write(b"xy").unwrap();
        drop(a);
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(b.read(&mut buf).unwrap(), 0);
        assert_eq!(
            b.write(b"z").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
