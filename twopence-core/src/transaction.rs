//! `Transaction`: one in-flight request (run/inject/extract).
//!
//! Owns up to three channels, a child pid, a captured wait status, and
//! a `done` flag. The per-request behavior (what `recv`/`on_tick` do)
//! is a tagged `Kind`, never a stored closure — see `channel::EofHook`
//! for why, and `nix::sys::wait::WaitStatus` translation for the
//! command state machine, grounded on `server_run_command_send`/
//! `server_run_command_recv` in the original C server.

use bytes::Bytes;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use smallvec::SmallVec;

use crate::channel::{Channel, Direction, EofHook};
use crate::codec::{self, PacketType, CID_STDERR, CID_STDOUT};
use crate::error::Error;

/// What kind of request this transaction is servicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Inject,
    Extract,
    Command,
}

/// One outbound packet a transaction wants the owning connection to
/// send on its behalf. Built here, framed and queued by `Connection`.
pub struct OutPacket {
    pub kind: PacketType,
    pub cid: u16,
    pub payload: Bytes,
}

/// One in-flight request.
pub struct Transaction {
    pub id: u16,
    pub kind: Kind,
    channels: SmallVec<[Channel; 3]>,
    pid: Option<Pid>,
    wait_status: Option<WaitStatus>,
    done: bool,
    outbox: Vec<OutPacket>,
}

impl Transaction {
    #[must_use]
    pub fn new(id: u16, kind: Kind) -> Self {
        Self {
            id,
            kind,
            channels: SmallVec::new(),
            pid: None,
            wait_status: None,
            done: false,
            outbox: Vec::new(),
        }
    }

    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.done
    }

    pub fn set_pid(&mut self, pid: Pid) {
        self.pid = Some(pid);
    }

    /// Tell the client there's no separate stderr stream coming (a
    /// pty-backed command merges stderr into stdout) by sending an
    /// immediate `EOF` on the stderr channel id, with no channel
    /// actually attached.
    pub fn note_no_separate_stderr(&mut self) {
        self.send_eof(CID_STDERR);
    }

    /// Drain the packets this transaction has queued since the last
    /// call. The connection sends each one and frames it with this
    /// transaction's id.
    pub fn take_outbox(&mut self) -> Vec<OutPacket> {
        std::mem::take(&mut self.outbox)
    }

    fn push(&mut self, kind: PacketType, cid: u16, payload: Bytes) {
        self.outbox.push(OutPacket { kind, cid, payload });
    }

    /// Short status reply acknowledging setup (0 = accepted).
    pub fn send_major(&mut self, status: i32) {
        self.push(PacketType::Major, 0, status_payload(status));
    }

    /// Terminal status reply carrying the application exit code.
    pub fn send_minor(&mut self, status: i32) {
        self.push(PacketType::Minor, 0, status_payload(status));
    }

    pub fn send_timeout(&mut self) {
        self.push(PacketType::Timeout, 0, Bytes::new());
    }

    fn send_eof(&mut self, cid: u16) {
        self.push(PacketType::Eof, cid, Bytes::new());
    }

    /// Terminal failure: a failing `MAJOR` carrying `errno`. Marks
    /// done immediately — used for setup errors before any channel is
    /// attached.
    pub fn fail(&mut self, errno: i32) {
        self.push(PacketType::Major, 0, status_payload(errno));
        self.done = true;
    }

    /// Terminal failure carrying two status codes — used for
    /// mid-transaction failures (signal death, I/O errors) that still
    /// need a major/minor pair.
    pub fn fail2(&mut self, major: i32, minor: i32) {
        self.push(PacketType::Major, 0, status_payload(major));
        self.push(PacketType::Minor, 0, status_payload(minor));
        self.done = true;
    }

    pub fn attach_sink(&mut self, cid: u16, fd: std::os::unix::io::RawFd, name: &'static str) {
        self.channels.push(Channel::sink(cid, fd, name));
    }

    pub fn attach_source(&mut self, cid: u16, fd: std::os::unix::io::RawFd, name: &'static str) {
        self.channels.push(Channel::source(cid, fd, name));
    }

    pub fn find_source_mut(&mut self, cid: u16) -> Option<&mut Channel> {
        self.channels
            .iter_mut()
            .find(|c| c.cid() == cid && c.direction() == Direction::Source)
    }

    pub fn find_sink_mut(&mut self, cid: u16) -> Option<&mut Channel> {
        self.channels
            .iter_mut()
            .find(|c| c.cid() == cid && c.direction() == Direction::Sink)
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.iter_mut()
    }

    /// Fds of channels still relevant to readiness polling: sources
    /// that haven't hit read-EOF, sinks that haven't hit write-EOF.
    pub fn channel_fds_ref(&self) -> impl Iterator<Item = std::os::unix::io::RawFd> + '_ {
        self.channels
            .iter()
            .filter(|c| match c.direction() {
                Direction::Source => !c.is_read_eof(),
                Direction::Sink => !c.is_write_eof(),
            })
            .map(Channel::fd)
    }

    pub fn set_hook(&mut self, cid: u16, direction: Direction, hook: EofHook) {
        if let Some(c) = self
            .channels
            .iter_mut()
            .find(|c| c.cid() == cid && c.direction() == direction)
        {
            c.set_hook(hook);
        }
    }

    /// `cid == 0` closes every sink channel (the "all channels in that
    /// direction" convention for transaction-level cancellation).
    pub fn close_sink(&mut self, cid: u16) {
        for ch in self
            .channels
            .iter_mut()
            .filter(|c| c.direction() == Direction::Sink && (cid == 0 || c.cid() == cid))
        {
            let _ = ch.close_sink();
        }
    }

    /// `cid == 0` closes every source channel.
    pub fn close_source(&mut self, cid: u16) {
        for ch in self
            .channels
            .iter_mut()
            .filter(|c| c.direction() == Direction::Source && (cid == 0 || c.cid() == cid))
        {
            ch.close_source();
        }
    }

    /// Route an incoming packet addressed to this transaction.
    pub fn recv(&mut self, hdr_kind: PacketType, cid: u16, payload: &[u8]) {
        match self.kind {
            Kind::Command => self.command_recv(hdr_kind),
            Kind::Inject | Kind::Extract => {
                if hdr_kind == PacketType::Data {
                    if let Some(sink) = self.find_sink_mut(cid) {
                        sink.enqueue(payload);
                    }
                } else if hdr_kind == PacketType::Eof {
                    if let Some(sink) = self.find_sink_mut(cid) {
                        if sink.close_sink().is_ok() {
                            self.run_hook(sink_hook(self, cid));
                        }
                    }
                } else {
                    tracing::warn!(?hdr_kind, "unexpected packet type for file-transfer transaction");
                }
            }
        }
    }

    fn command_recv(&mut self, hdr_kind: PacketType) {
        if hdr_kind != PacketType::Intr {
            tracing::warn!(?hdr_kind, "unexpected packet type for command transaction");
            return;
        }
        if let Some(pid) = self.pid {
            if !self.done {
                let _ = signal::kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL);
                self.close_sink(0);
                self.close_source(0);
            }
        }
    }

    /// Called once per pool tick; lets the transaction observe
    /// external events (child exit) and emit terminal packets.
    pub fn on_tick(&mut self) {
        if self.kind != Kind::Command {
            return;
        }
        self.command_on_tick();
    }

    fn command_on_tick(&mut self) {
        let pending_output = [CID_STDOUT, CID_STDERR].iter().any(|&cid| {
            self.find_source_mut(cid)
                .map(|c| !c.is_read_eof())
                .unwrap_or(false)
        });

        if let Some(pid) = self.pid {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => {}
                Ok(status) => {
                    tracing::debug!(?status, "child process exited");
                    self.close_sink(0);
                    self.wait_status = Some(status);
                    self.pid = None;
                }
            }
        }

        if !self.done && self.pid.is_none() && !pending_output {
            match self.wait_status {
                Some(WaitStatus::Exited(_, code)) => {
                    self.send_major(0);
                    self.send_minor(code);
                }
                Some(WaitStatus::Signaled(_, Signal::SIGALRM, _)) => {
                    self.send_timeout();
                }
                Some(WaitStatus::Signaled(_, sig, _)) => {
                    self.fail2(libc::EFAULT, sig as i32);
                }
                _ => {
                    self.fail2(libc::EFAULT, 2);
                }
            }
            self.done = true;
        }
    }

    fn run_hook(&mut self, hook: EofHook) {
        match hook {
            EofHook::None => {}
            EofHook::InjectWriteComplete => {
                self.send_minor(0);
                self.done = true;
            }
            EofHook::ExtractReadComplete => {
                self.send_eof(codec::CID_FILE);
                self.send_minor(0);
                self.done = true;
            }
            EofHook::CommandStdinClosed => {}
        }
    }

    /// Drive every source channel's non-blocking read; queues outbound
    /// `DATA`/`EOF` packets and fires read-EOF hooks exactly once.
    pub fn pump_sources(&mut self) -> Result<(), Error> {
        let mut fired = Vec::new();
        for ch in self
            .channels
            .iter_mut()
            .filter(|c| c.direction() == Direction::Source)
        {
            let mut out = Vec::new();
            let became_eof = ch.try_read(&mut out).unwrap_or(true);
            if !out.is_empty() {
                self.outbox.push(OutPacket {
                    kind: PacketType::Data,
                    cid: ch.cid(),
                    payload: Bytes::from(out),
                });
            }
            if became_eof {
                self.outbox.push(OutPacket {
                    kind: PacketType::Eof,
                    cid: ch.cid(),
                    payload: Bytes::new(),
                });
                fired.push((ch.cid(), ch.hook()));
            }
        }
        for (_, hook) in fired {
            self.run_hook(hook);
        }
        Ok(())
    }

    /// Drive every sink channel's non-blocking write.
    pub fn pump_sinks(&mut self) -> Result<(), Error> {
        for ch in self
            .channels
            .iter_mut()
            .filter(|c| c.direction() == Direction::Sink)
        {
            ch.try_write()?;
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        for ch in &self.channels {
            let _ = nix::unistd::close(ch.fd());
        }
    }
}

fn sink_hook(trans: &Transaction, cid: u16) -> EofHook {
    trans
        .channels
        .iter()
        .find(|c| c.cid() == cid && c.direction() == Direction::Sink)
        .map(Channel::hook)
        .unwrap_or(EofHook::None)
}

fn status_payload(status: i32) -> Bytes {
    Bytes::copy_from_slice(&status.to_be_bytes())
}
