//! `Channel`: one directional byte conduit between a local fd and one
//! side of a transaction.
//!
//! A source reads a local fd and hands bytes out to the peer; a sink
//! takes bytes from the peer and writes them to a local fd. Each
//! channel fires its EOF hook exactly once — see [`EofHook`] for why
//! that hook is a tagged enum rather than a boxed closure.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use bytes::{Bytes, BytesMut};

/// Which way bytes flow through this channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local fd → peer.
    Source,
    /// Peer → local fd.
    Sink,
}

/// What to do when this channel's EOF fires.
///
/// A transaction never stores a closure here: closures over `&mut
/// Transaction` would make the transaction reference itself, which is
/// exactly the cyclic-reference shape design notes call out. Instead
/// every completion a channel can trigger is named up front; the
/// transaction's `recv`/`on_tick` methods match on this tag and act
/// accordingly, so the channel never needs to know what a transaction
/// is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EofHook {
    /// Nothing special happens; the connection just notices read-EOF
    /// or write-EOF as part of its normal bookkeeping.
    None,
    /// An INJECT sink has flushed and closed: emit `MINOR 0`, done.
    InjectWriteComplete,
    /// An EXTRACT source has hit EOF: emit channel `EOF` + `MINOR 0`, done.
    ExtractReadComplete,
    /// A command's stdin sink closed (peer sent EOF on cid=STDIN).
    CommandStdinClosed,
}

/// One directional local-fd conduit.
pub struct Channel {
    cid: u16,
    fd: RawFd,
    direction: Direction,
    name: &'static str,
    /// Sink only: bytes queued for the local fd that haven't been
    /// written yet.
    pending: BytesMut,
    read_eof: bool,
    write_eof: bool,
    hook: EofHook,
}

impl Channel {
    #[must_use]
    pub fn source(cid: u16, fd: RawFd, name: &'static str) -> Self {
        Self {
            cid,
            fd,
            direction: Direction::Source,
            name,
            pending: BytesMut::new(),
            read_eof: false,
            write_eof: false,
            hook: EofHook::None,
        }
    }

    #[must_use]
    pub fn sink(cid: u16, fd: RawFd, name: &'static str) -> Self {
        Self {
            cid,
            fd,
            direction: Direction::Sink,
            name,
            pending: BytesMut::new(),
            read_eof: false,
            write_eof: false,
            hook: EofHook::None,
        }
    }

    #[must_use]
    pub const fn cid(&self) -> u16 {
        self.cid
    }

    #[must_use]
    pub const fn fd(&self) -> RawFd {
        self.fd
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn is_read_eof(&self) -> bool {
        self.read_eof
    }

    #[must_use]
    pub const fn is_write_eof(&self) -> bool {
        self.write_eof
    }

    pub fn set_hook(&mut self, hook: EofHook) {
        self.hook = hook;
    }

    #[must_use]
    pub const fn hook(&self) -> EofHook {
        self.hook
    }

    /// Sink only: queue bytes received from the peer for writing to
    /// the local fd. Ignored once write-EOF has fired.
    pub fn enqueue(&mut self, data: &[u8]) {
        debug_assert_eq!(self.direction, Direction::Sink);
        if self.write_eof {
            return;
        }
        self.pending.extend_from_slice(data);
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Attempt one non-blocking read on a source's local fd, appending
    /// to `out` on success. Returns `Ok(true)` if read-EOF just fired.
    pub fn try_read(&mut self, out: &mut Vec<u8>) -> io::Result<bool> {
        debug_assert_eq!(self.direction, Direction::Source);
        if self.read_eof {
            return Ok(false);
        }
        let mut file = borrowed_file(self.fd);
        let mut scratch = [0u8; 8192];
        match file.read(&mut scratch) {
            Ok(0) => {
                self.read_eof = true;
                Ok(true)
            }
            Ok(n) => {
                out.extend_from_slice(&scratch[..n]);
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(e) => {
                self.read_eof = true;
                Err(e)
            }
        }
    }

    /// Attempt to drain queued bytes into a sink's local fd
    /// non-blockingly. Call repeatedly as the fd becomes writable.
    pub fn try_write(&mut self) -> io::Result<()> {
        debug_assert_eq!(self.direction, Direction::Sink);
        let mut file = borrowed_file(self.fd);
        while !self.pending.is_empty() {
            match file.write(&self.pending) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = self.pending.split_to(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Write every queued byte synchronously, blocking as needed. Used
    /// at EOF boundaries where latency is acceptable but correctness
    /// (no dropped bytes) is not negotiable.
    pub fn flush(&mut self) -> io::Result<()> {
        debug_assert_eq!(self.direction, Direction::Sink);
        let mut file = borrowed_file(self.fd);
        let buf: Bytes = self.pending.split().freeze();
        file.write_all(&buf)
    }

    /// Mark write-EOF, flushing first. Idempotent. Returns whether
    /// this call is the one that actually fired the transition (the
    /// caller uses that to know whether to run the hook).
    pub fn close_sink(&mut self) -> io::Result<bool> {
        debug_assert_eq!(self.direction, Direction::Sink);
        if self.write_eof {
            return Ok(false);
        }
        self.flush()?;
        self.write_eof = true;
        Ok(true)
    }

    /// Mark read-EOF without having observed a `0`-byte read (used for
    /// cancellation). Idempotent; same return convention as
    /// `close_sink`.
    pub fn close_source(&mut self) -> bool {
        debug_assert_eq!(self.direction, Direction::Source);
        if self.read_eof {
            return false;
        }
        self.read_eof = true;
        true
    }
}

/// Wrap a raw, channel-owned fd in a `File` for the duration of one
/// read/write call without taking ownership (the `Channel` itself is
/// the owner and closes it on `Drop` — not implemented here since
/// launcher-created fds are closed by the transaction that owns the
/// channel; see `transaction.rs`).
fn borrowed_file(fd: RawFd) -> std::mem::ManuallyDrop<std::fs::File> {
    use std::os::unix::io::FromRawFd;
    std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn sink_flush_writes_everything_then_closes() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut sink = Channel::sink(1, write_end.as_raw_fd(), "stdin");
        sink.enqueue(b"hello");
        assert!(sink.close_sink().unwrap());
        assert!(sink.is_write_eof());
        assert!(!sink.close_sink().unwrap()); // idempotent, no double-fire

        let mut out = vec![0u8; 5];
        let mut file = std::mem::ManuallyDrop::new(unsafe {
            <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(read_end.as_raw_fd())
        });
        use std::io::Read;
        file.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn source_eof_fires_exactly_once() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        drop(write_end); // writer closes immediately -> EOF on next read

        let mut source = Channel::source(2, read_end.as_raw_fd(), "stdout");
        let mut buf = Vec::new();
        let fired = source.try_read(&mut buf).unwrap();
        assert!(fired);
        assert!(source.is_read_eof());

        // Further reads are no-ops, never re-fire.
        let fired_again = source.try_read(&mut buf).unwrap();
        assert!(!fired_again);
    }
}
