//! Transport abstraction: the generic byte stream the core is built on.
//!
//! The core only ever needs non-blocking read/write and, for listener
//! roles, non-blocking accept. [`UnixTransport`] is the one concrete
//! back-end this crate ships; a serial-line or virtio-vsock back-end
//! would implement the same two traits and need no changes above this
//! module.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

/// A bidirectional, non-blocking byte stream owned by a [`crate::socket::Socket`].
pub trait Transport: Send {
    /// Attempt a read. A `WouldBlock` error means "nothing available
    /// right now", not an error condition.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Attempt a write. A `WouldBlock` error means the write should be
    /// retried once the fd is writable again.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// The descriptor to register with the pool's readiness set.
    fn as_raw_fd(&self) -> RawFd;
}

/// A listener that accepts new [`Transport`] connections.
pub trait Listener: Send {
    type Stream: Transport;

    /// Accept one pending connection, if any.
    fn try_accept(&mut self) -> io::Result<Option<Self::Stream>>;

    /// The descriptor to register with the pool's readiness set.
    fn as_raw_fd(&self) -> RawFd;
}

/// A non-blocking `UnixStream`.
pub struct UnixTransport {
    inner: UnixStream,
}

impl UnixTransport {
    fn new(inner: UnixStream) -> io::Result<Self> {
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }
}

impl Transport for UnixTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        self.inner.read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        self.inner.write(buf)
    }

    fn as_raw_fd(&self) -> RawFd {
        AsRawFd::as_raw_fd(&self.inner)
    }
}

/// A non-blocking `UnixListener`, removing a stale socket file at bind
/// time the way a restarted daemon needs to.
pub struct UnixSocketListener {
    inner: UnixListener,
}

impl UnixSocketListener {
    /// Bind to `path`, unlinking a pre-existing socket file first.
    pub fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let inner = UnixListener::bind(path)?;
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }
}

impl Listener for UnixSocketListener {
    type Stream = UnixTransport;

    fn try_accept(&mut self) -> io::Result<Option<Self::Stream>> {
        match self.inner.accept() {
            Ok((stream, _addr)) => Ok(Some(UnixTransport::new(stream)?)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn as_raw_fd(&self) -> RawFd {
        AsRawFd::as_raw_fd(&self.inner)
    }
}
