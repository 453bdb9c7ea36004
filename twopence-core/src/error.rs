//! Error types for the twopence request-servicing core.

use std::io;
use thiserror::Error;

/// Errors produced anywhere in the request-servicing core.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on a socket, pipe, pty, or regular file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A protocol-level complaint not tied to a specific malformed byte
    /// range (unexpected packet type in a given context, and similar).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The header or a dissector rejected a packet outright.
    #[error("malformed packet: {reason}")]
    MalformedPacket { reason: String },

    /// A builder was asked to frame a payload bigger than the wire format
    /// can express. Always an internal bug, never something a peer can
    /// trigger by itself.
    #[error("packet payload too large: {len} bytes (max {max})")]
    OversizePayload { len: usize, max: usize },

    /// `getpwnam`-equivalent lookup came back empty.
    #[error("unknown user \"{0}\"")]
    UnknownUser(String),

    /// Joining a relative path to a home directory would exceed `PATH_MAX`.
    #[error("path too long")]
    PathTooLong,

    /// `fstat` says the opened file isn't `S_ISREG`.
    #[error("not a regular file")]
    NotRegularFile,

    /// `initgroups`/`setegid`/`seteuid` failed while dropping privileges.
    #[error("unable to drop privileges: {0}")]
    PrivilegeDrop(String),

    /// `fork` itself failed.
    #[error("fork failed: {0}")]
    Fork(String),

    /// Something failed between `fork` and `execve` that isn't a
    /// privilege-drop failure (opening a pty slave, building argv, etc).
    #[error("exec setup failed: {0}")]
    ExecSetup(String),
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map this error onto the integer status code the wire protocol
    /// carries in a failing `MAJOR`/`MINOR` reply.
    #[must_use]
    pub fn errno_like(&self) -> i32 {
        match self {
            Error::UnknownUser(_) => libc::ENOENT,
            Error::PathTooLong => libc::ENAMETOOLONG,
            Error::NotRegularFile => libc::EISDIR,
            Error::PrivilegeDrop(_) => libc::EPERM,
            Error::Fork(_) | Error::ExecSetup(_) => libc::EIO,
            Error::MalformedPacket { .. } | Error::Protocol(_) => libc::EINVAL,
            Error::OversizePayload { .. } => libc::EMSGSIZE,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// True for conditions a connection can log and continue past, as
    /// opposed to ones that should fail the whole transaction.
    #[must_use]
    pub const fn is_protocol_level(&self) -> bool {
        matches!(self, Error::MalformedPacket { .. } | Error::Protocol(_))
    }
}
