//! `ConnectionPool`: multiplexes every live connection on one thread
//! using `ppoll`, atomically unmasking `SIGCHLD` only for the
//! duration of the wait. `SIGCHLD` stays masked everywhere else,
//! `SIGPIPE` is ignored process-wide, and the `SIGCHLD` handler is a
//! no-op — its only job is to interrupt the wait so reaping happens at
//! well-defined points (inside a `Connection::tick`, never inside the
//! signal handler itself).
//!
//! Installing a process-wide signal disposition and borrowing raw fds
//! for `ppoll` both require `unsafe`; both are sound because this
//! process is single-threaded and the installation runs exactly once
//! at startup, before the pool's first wait.

#![allow(unsafe_code)]

use std::os::unix::io::RawFd;

use nix::poll::{PollFd, PollFlags};
use nix::sys::signal::{self, SigAction, SigHandler, SigSet, Signal};

use crate::connection::{Connection, ListenerConnection};
use crate::error::Result;
use crate::transport::Listener;
use crate::userdb::UserDb;

extern "C" fn sigchld_noop(_: libc::c_int) {}

/// Install the process-wide signal discipline the pool relies on:
/// `SIGCHLD` masked with a no-op handler (delivery only needs to
/// interrupt `ppoll`), `SIGPIPE` ignored so a write to a closed peer
/// socket surfaces as `EPIPE` instead of killing the process.
///
/// # Safety
///
/// Installs process-wide signal handlers via raw `sigaction`; must run
/// once, before the pool starts polling, and before any other thread
/// (there are none in this process) could observe a different
/// disposition.
#[allow(unsafe_code)]
pub fn install_signal_discipline() -> nix::Result<()> {
    let noop = SigAction::new(
        SigHandler::Handler(sigchld_noop),
        nix::sys::signal::SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGCHLD, &noop)?;
    }

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_block()?;

    unsafe {
        signal::sigaction(Signal::SIGPIPE, &SigAction::new(
            SigHandler::SigIgn,
            nix::sys::signal::SaFlags::empty(),
            SigSet::empty(),
        ))?;
    }

    Ok(())
}

/// Holds every live connection. `run_once` is one tick: build a
/// readiness set, wait with `SIGCHLD` unmasked for the wait's
/// duration only, then service whatever is ready.
pub struct ConnectionPool<L: Listener> {
    listener: ListenerConnection<L>,
    connections: Vec<Connection<L::Stream>>,
    high_water_bytes: usize,
    default_command_timeout_secs: u32,
}

impl<L: Listener> ConnectionPool<L> {
    #[must_use]
    pub fn new(listener: L, high_water_bytes: usize, default_command_timeout_secs: u32) -> Self {
        Self {
            listener: ListenerConnection::new(listener),
            connections: Vec::new(),
            high_water_bytes,
            default_command_timeout_secs,
        }
    }

    #[must_use]
    pub const fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// One iteration: poll, accept, pump. Returns `true` while the
    /// pool should keep running (it always does — the process only
    /// stops via `QUIT`'s `exit(0)` or a fatal signal).
    pub fn run_once(&mut self, db: &dyn UserDb) -> Result<bool> {
        self.wait_for_readiness()?;

        if let Some(conn) = self
            .listener
            .tick(self.high_water_bytes, self.default_command_timeout_secs)?
        {
            tracing::info!(client_id = conn.client_id(), "accepted connection");
            self.connections.push(conn);
        }

        for conn in &mut self.connections {
            if let Err(e) = conn.tick(db) {
                tracing::warn!(client_id = conn.client_id(), error = %e, "connection tick failed");
            }
        }

        self.connections.retain(|c| !c.wants_to_close());

        Ok(true)
    }

    fn wait_for_readiness(&self) -> Result<()> {
        let mut fds: Vec<RawFd> = vec![self.listener.as_raw_fd()];
        for conn in &self.connections {
            fds.push(conn.as_raw_fd());
            fds.extend(conn.channel_fds());
        }

        let mut poll_fds: Vec<PollFd> = fds
            .iter()
            .map(|&fd| {
                PollFd::new(
                    unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
                    PollFlags::POLLIN | PollFlags::POLLOUT,
                )
            })
            .collect();

        // Every signal stays blocked during the wait except SIGCHLD,
        // which this set leaves out so ppoll unmasks exactly it.
        let mut wait_mask = SigSet::all();
        wait_mask.remove(Signal::SIGCHLD);

        match nix::poll::ppoll(&mut poll_fds, None, Some(wait_mask)) {
            Ok(_) | Err(nix::errno::Errno::EINTR) => Ok(()),
            Err(e) => Err(crate::error::Error::Io(e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_signal_discipline_does_not_error() {
        install_signal_discipline().unwrap();
    }
}
