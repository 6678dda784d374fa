//! Message framing over a [`NonBlockingStream`].

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::trace;

use crate::network::codec::{self, FrameSplit};
use crate::network::messages::{Message, MessageBody};
use crate::report_violation_to;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{NetplayError, NonBlockingStream, NETPLAY_MAGIC};

/// Bytes requested from the stream per read call.
const READ_CHUNK: usize = 4096;

/// Sends and receives length-prefixed [`Message`]s on one link.
///
/// Writes that the transport does not accept right away stay in a send buffer and are
/// retried on the next [`send`](Self::send) or [`flush`](Self::flush). Received bytes are
/// buffered until a whole frame is present.
///
/// Malformed frames are dropped and reported. More than `max_malformed` of them in a row
/// fail the channel with [`NetplayError::ProtocolViolation`].
pub struct MessageChannel {
    stream: Box<dyn NonBlockingStream>,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    malformed_streak: u32,
    max_malformed: u32,
    remote_closed: bool,
    observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            stream,
            recv_buf,
            send_buf,
            malformed_streak,
            max_malformed,
            remote_closed,
            observer,
        } = self;

        f.debug_struct("MessageChannel")
            .field("peer", &stream.peer_addr())
            .field("recv_buffered", &recv_buf.len())
            .field("send_buffered", &send_buf.len())
            .field("malformed_streak", malformed_streak)
            .field("max_malformed", max_malformed)
            .field("remote_closed", remote_closed)
            .field("has_observer", &observer.is_some())
            .finish()
    }
}

impl MessageChannel {
    /// Wraps `stream`.
    pub fn new(
        stream: Box<dyn NonBlockingStream>,
        max_malformed: u32,
        observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            stream,
            recv_buf: Vec::with_capacity(READ_CHUNK),
            send_buf: Vec::new(),
            malformed_streak: 0,
            max_malformed,
            remote_closed: false,
            observer,
        }
    }

    /// Queues `msg` and writes as much of the send buffer as the transport accepts.
    pub fn send(&mut self, msg: &Message) -> Result<(), NetplayError> {
        codec::encode_frame(msg, &mut self.send_buf).map_err(|err| {
            NetplayError::InternalError {
                context: format!("failed to encode {} message: {}", msg.body.kind(), err),
            }
        })?;
        trace!("queued {} message", msg.body.kind());
        self.flush()
    }

    /// Writes buffered bytes until the send buffer is empty or the transport would block.
    pub fn flush(&mut self) -> Result<(), NetplayError> {
        while !self.send_buf.is_empty() {
            match self.stream.write(&self.send_buf) {
                Ok(0) => {
                    return Err(NetplayError::TransportError {
                        context: "link accepted no bytes".to_owned(),
                    });
                },
                Ok(written) => {
                    self.send_buf.drain(..written.min(self.send_buf.len()));
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(NetplayError::TransportError {
                        context: format!("write failed: {}", err),
                    });
                },
            }
        }
        Ok(())
    }

    /// Reads everything the transport has and returns the complete messages, oldest first.
    ///
    /// After the remote closed the stream the messages it sent before closing are still
    /// returned; check [`remote_closed`](Self::remote_closed) afterwards.
    pub fn receive(&mut self) -> Result<Vec<Message>, NetplayError> {
        self.fill_recv_buf()?;

        let mut messages = Vec::with_capacity(4);
        let mut offset = 0;
        loop {
            let mut broken = None;
            let step = match codec::split_frame(self.recv_buf.get(offset..).unwrap_or(&[])) {
                Ok(FrameSplit::Complete { payload, consumed }) => {
                    Some((codec::decode_exact::<Message>(payload), consumed))
                },
                Ok(FrameSplit::Incomplete) => None,
                Err(err) => {
                    broken = Some(err);
                    None
                },
            };

            if let Some(err) = broken {
                // the frame boundary is lost, nothing after this point can be trusted
                self.recv_buf.clear();
                offset = 0;
                self.malformed(err.to_string())?;
                break;
            }
            let Some((decoded, consumed)) = step else {
                break;
            };
            offset += consumed;
            match decoded {
                Ok(msg)
                    if msg.header.magic == NETPLAY_MAGIC
                        || matches!(msg.body, MessageBody::Hello(_)) =>
                {
                    // a Hello with a foreign magic is left to the handshake to reject
                    self.malformed_streak = 0;
                    messages.push(msg);
                },
                Ok(msg) => {
                    self.malformed(format!(
                        "{} message with magic {:#010x}",
                        msg.body.kind(),
                        msg.header.magic
                    ))?;
                },
                Err(err) => self.malformed(err.to_string())?,
            }
        }
        self.recv_buf.drain(..offset.min(self.recv_buf.len()));
        Ok(messages)
    }

    fn fill_recv_buf(&mut self) -> Result<(), NetplayError> {
        let mut chunk = [0u8; READ_CHUNK];
        while !self.remote_closed {
            match self.stream.read(&mut chunk) {
                Ok(0) => self.remote_closed = true,
                Ok(read) => self
                    .recv_buf
                    .extend_from_slice(chunk.get(..read).unwrap_or(&chunk)),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(NetplayError::TransportError {
                        context: format!("read failed: {}", err),
                    });
                },
            }
        }
        Ok(())
    }

    fn malformed(&mut self, context: String) -> Result<(), NetplayError> {
        self.malformed_streak += 1;
        report_violation_to!(
            &self.observer,
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "dropped malformed packet ({} in a row): {}",
            self.malformed_streak,
            context
        );
        if self.malformed_streak > self.max_malformed {
            return Err(NetplayError::ProtocolViolation {
                context: format!(
                    "{} malformed packets in a row, last: {}",
                    self.malformed_streak, context
                ),
            });
        }
        Ok(())
    }

    /// The remote closed its end of the stream.
    #[must_use]
    pub fn remote_closed(&self) -> bool {
        self.remote_closed
    }

    /// Bytes waiting to be written.
    #[must_use]
    pub fn pending_send(&self) -> usize {
        self.send_buf.len()
    }

    /// Malformed frames received since the last well-formed one.
    #[must_use]
    pub fn malformed_streak(&self) -> u32 {
        self.malformed_streak
    }

    /// The remote address of the underlying stream.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr()
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
    use crate::network::memory_stream::MemoryStream;
    use crate::telemetry::CollectingObserver;
    use crate::{Frame, InputWords};

    fn input(frame: u32) -> Message {
        Message::new(MessageBody::Input {
            frame: Frame::new(frame),
            words: InputWords::new([frame, 0, 0]),
        })
    }

    fn channel(stream: MemoryStream) -> MessageChannel {
        MessageChannel::new(Box::new(stream), 3, None)
    }

    #[test]
    fn messages_arrive_in_order() {
        let (a, b) = MemoryStream::pair();
        let mut tx = channel(a);
        let mut rx = channel(b);
        for frame in 0..5 {
            tx.send(&input(frame)).unwrap();
        }
        assert_eq!(rx.receive().unwrap(), (0..5).map(input).collect::<Vec<_>>());
        assert!(rx.receive().unwrap().is_empty());
    }

    #[test]
    fn partial_writes_are_completed_by_flush() {
        let (a, b) = MemoryStream::pair_with_capacity(7);
        let mut tx = channel(a);
        let mut rx = channel(b);
        tx.send(&input(1)).unwrap();
        tx.send(&input(2)).unwrap();
        assert!(tx.pending_send() > 0);

        let mut received = Vec::new();
        for _ in 0..100 {
            received.extend(rx.receive().unwrap());
            tx.flush().unwrap();
            if received.len() == 2 {
                break;
            }
        }
        assert_eq!(received, vec![input(1), input(2)]);
        assert_eq!(tx.pending_send(), 0);
    }

    #[test]
    fn garbage_frame_is_dropped_and_stream_continues() {
        let (mut raw, b) = MemoryStream::pair();
        let observer = Arc::new(CollectingObserver::new());
        let mut rx = MessageChannel::new(Box::new(b), 3, Some(observer.clone()));

        let mut wire = Vec::new();
        wire.extend_from_slice(&3u32.to_le_bytes());
        wire.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        codec::encode_frame(&input(9), &mut wire).unwrap();
        raw.write(&wire).unwrap();

        assert_eq!(rx.receive().unwrap(), vec![input(9)]);
        assert_eq!(rx.malformed_streak(), 0);
        assert!(observer.has_violation(ViolationKind::NetworkProtocol));
    }

    #[test]
    fn foreign_magic_is_malformed() {
        let (mut raw, b) = MemoryStream::pair();
        let mut rx = channel(b);
        let mut msg = input(1);
        msg.header.magic = 0xDEAD_BEEF;
        let mut wire = Vec::new();
        codec::encode_frame(&msg, &mut wire).unwrap();
        raw.write(&wire).unwrap();
        assert!(rx.receive().unwrap().is_empty());
        assert_eq!(rx.malformed_streak(), 1);
    }

    #[test]
    fn repeated_garbage_is_fatal() {
        let (mut raw, b) = MemoryStream::pair();
        let mut rx = channel(b);
        let mut wire = Vec::new();
        for _ in 0..4 {
            wire.extend_from_slice(&1u32.to_le_bytes());
            wire.push(0xEE);
        }
        raw.write(&wire).unwrap();
        assert!(matches!(
            rx.receive(),
            Err(NetplayError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn oversized_length_clears_buffer() {
        let (mut raw, b) = MemoryStream::pair();
        let mut rx = channel(b);
        raw.write(&u32::MAX.to_le_bytes()).unwrap();
        raw.write(&[1, 2, 3]).unwrap();
        assert!(rx.receive().unwrap().is_empty());
        assert_eq!(rx.malformed_streak(), 1);

        let mut wire = Vec::new();
        codec::encode_frame(&input(4), &mut wire).unwrap();
        raw.write(&wire).unwrap();
        assert_eq!(rx.receive().unwrap(), vec![input(4)]);
    }

    #[test]
    fn close_is_seen_after_last_message() {
        let (a, b) = MemoryStream::pair();
        let mut tx = channel(a);
        let mut rx = channel(b);
        tx.send(&input(0)).unwrap();
        drop(tx);
        assert_eq!(rx.receive().unwrap(), vec![input(0)]);
        assert!(rx.remote_closed());
    }

    #[test]
    fn write_to_closed_link_is_transport_error() {
        let (a, b) = MemoryStream::pair();
        let mut tx = channel(a);
        drop(b);
        assert!(matches!(
            tx.send(&input(0)),
            Err(NetplayError::TransportError { .. })
        ));
    }
}
