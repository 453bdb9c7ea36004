//! `Socket`: one owned [`Transport`] plus its framing buffers.
//!
//! A `Socket` is handed once to a `Connection`, which thereafter owns
//! it exclusively. It does not parse packets itself — that is
//! `codec`'s job — it only manages the raw bytes: a partial-frame
//! receive buffer and a FIFO of fully-built outbound frames.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;

use bytes::Bytes;

use crate::buffer::SegmentedBuffer;
use crate::transport::Transport;

/// An owned transport with receive/send buffering and a soft cap on
/// how much unsent data may queue up.
pub struct Socket<T: Transport> {
    transport: T,
    recv_buf: SegmentedBuffer,
    send_queue: VecDeque<Bytes>,
    send_queue_bytes: usize,
    high_water_bytes: usize,
}

impl<T: Transport> Socket<T> {
    #[must_use]
    pub fn new(transport: T, high_water_bytes: usize) -> Self {
        Self {
            transport,
            recv_buf: SegmentedBuffer::new(),
            send_queue: VecDeque::new(),
            send_queue_bytes: 0,
            high_water_bytes,
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.transport.as_raw_fd()
    }

    /// The receive-side buffer, for the codec to parse frames out of.
    pub fn recv_buf(&mut self) -> &mut SegmentedBuffer {
        &mut self.recv_buf
    }

    /// Pull as many bytes as are currently available into the receive
    /// buffer. Returns `Ok(n)` for bytes read (`0` is a clean EOF from
    /// the peer), or propagates any error that is not `WouldBlock`.
    pub fn pump_read(&mut self) -> io::Result<usize> {
        let mut scratch = [0u8; 8192];
        let mut total = 0;
        loop {
            match self.transport.try_read(&mut scratch) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    self.recv_buf.push(Bytes::copy_from_slice(&scratch[..n]));
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Enqueue a fully-built frame for sending.
    pub fn enqueue(&mut self, frame: Bytes) {
        self.send_queue_bytes += frame.len();
        self.send_queue.push_back(frame);
    }

    /// True once the outbound queue has grown past the soft cap.
    /// Sources should stop reading their local fd while this holds.
    #[must_use]
    pub fn is_backed_up(&self) -> bool {
        self.send_queue_bytes >= self.high_water_bytes
    }

    /// Drain as much of the outbound queue as the transport accepts
    /// right now without blocking.
    pub fn pump_write(&mut self) -> io::Result<()> {
        while let Some(front) = self.send_queue.front_mut() {
            match self.transport.try_write(front) {
                Ok(0) => break,
                Ok(n) if n == front.len() => {
                    self.send_queue_bytes -= front.len();
                    self.send_queue.pop_front();
                }
                Ok(n) => {
                    self.send_queue_bytes -= n;
                    let remaining = front.slice(n..);
                    *front = remaining;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Whether the outbound queue still has bytes to write.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        !self.send_queue.is_empty()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct MemTransport {
        readable: VecDeque<u8>,
        written: Vec<u8>,
        write_cap: usize,
    }

    impl Transport for MemTransport {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.readable.is_empty() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "empty"));
            }
            let n = buf.len().min(self.readable.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.readable.pop_front().unwrap();
            }
            Ok(n)
        }

        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.write_cap);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    #[test]
    fn pump_read_fills_recv_buf() {
        let transport = MemTransport {
            readable: VecDeque::from(vec![b'h', b'i']),
            written: Vec::new(),
            write_cap: usize::MAX,
        };
        let mut socket = Socket::new(transport, 1 << 20);
        let n = socket.pump_read().unwrap();
        assert_eq!(n, 2);
        assert_eq!(socket.recv_buf().len(), 2);
    }

    #[test]
    fn partial_write_keeps_remainder_queued() {
        let transport = MemTransport {
            readable: VecDeque::new(),
            written: Vec::new(),
            write_cap: 2,
        };
        let mut socket = Socket::new(transport, 1 << 20);
        socket.enqueue(Bytes::from_static(b"hello"));
        socket.pump_write().unwrap();
        assert!(socket.has_pending_writes());
        socket.pump_write().unwrap();
        socket.pump_write().unwrap();
        assert!(!socket.has_pending_writes());
        assert_eq!(socket.transport_mut().written, b"hello");
    }

    #[test]
    fn backed_up_once_over_high_water_mark() {
        let transport = MemTransport {
            readable: VecDeque::new(),
            written: Vec::new(),
            write_cap: 0,
        };
        let mut socket = Socket::new(transport, 4);
        assert!(!socket.is_backed_up());
        socket.enqueue(Bytes::from_static(b"hello"));
        assert!(socket.is_backed_up());
    }
}
