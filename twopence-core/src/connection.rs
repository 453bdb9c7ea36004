//! `Connection`: binds one `Socket` to either a listener role or a
//! request-servicing role.
//!
//! A request-servicing connection demultiplexes incoming frames to
//! `Transaction`s by `tid`, relays channel traffic in both directions,
//! and reaps finished transactions. A listener connection's only job
//! is to turn socket readiness into a freshly-accepted stream. Both
//! share the split-pump shape of the teacher's `SocketActor` (read
//! pump / write pump, no shared mutable state between them) adapted to
//! synchronous, poll-driven execution instead of `compio`'s async
//! pumps — see `transaction::Transaction::pump_sources`/`pump_sinks`
//! for the per-channel half of that split.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::codec::{self, Header, ParseOutcome, PacketType};
use crate::error::{Error, Result};
use crate::socket::Socket;
use crate::transaction::{Kind, Transaction};
use crate::transport::{Listener, Transport};
use crate::userdb::UserDb;

/// Monotonically increasing id assigned to each accepted connection,
/// used only for logging (spec's "Client id" glossary entry).
static NEXT_CLIENT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

fn next_client_id() -> u64 {
    NEXT_CLIENT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// A request-servicing connection: one client socket, its live
/// transactions, and the next transaction id it will hand out for
/// packets that open a new one (`tid == 0` framing marker).
pub struct Connection<T: Transport> {
    client_id: u64,
    socket: Socket<T>,
    transactions: HashMap<u16, Transaction>,
    next_tid: u16,
    closing: bool,
    default_command_timeout_secs: u32,
}

impl<T: Transport> Connection<T> {
    #[must_use]
    pub fn new(transport: T, high_water_bytes: usize, default_command_timeout_secs: u32) -> Self {
        Self {
            client_id: next_client_id(),
            socket: Socket::new(transport, high_water_bytes),
            transactions: HashMap::new(),
            next_tid: 1,
            closing: false,
            default_command_timeout_secs,
        }
    }

    #[must_use]
    pub const fn client_id(&self) -> u64 {
        self.client_id
    }

    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Every local fd this connection currently wants to know the
    /// readiness of, besides its own socket: each live transaction's
    /// source/sink fds.
    pub fn channel_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.transactions
            .values()
            .flat_map(|t| t.channel_fds_ref())
    }

    #[must_use]
    pub const fn wants_to_close(&self) -> bool {
        self.closing
    }

    /// One pool tick for this connection: service socket readiness,
    /// pump every channel, let transactions observe external events,
    /// drain the outbound queue, and reap anything done. Mirrors
    /// `spec.md` §4.4's six-step tick.
    pub fn tick(&mut self, db: &dyn UserDb) -> Result<()> {
        self.socket.pump_read()?;
        self.service_frames(db)?;

        let backed_up = self.socket.is_backed_up();
        for trans in self.transactions.values_mut() {
            if !backed_up {
                trans.pump_sources()?;
            }
            trans.pump_sinks()?;
            trans.on_tick();
        }

        self.drain_transaction_outboxes();
        self.socket.pump_write()?;
        self.reap_done();

        Ok(())
    }

    fn service_frames(&mut self, db: &dyn UserDb) -> Result<()> {
        loop {
            let outcome = codec::parse_header(self.socket.recv_buf())?;
            let header = match outcome {
                ParseOutcome::Header(h) => h,
                // Either the header itself, or its declared payload,
                // hasn't fully arrived yet; parse_header leaves the
                // buffer untouched in both cases, so the next tick's
                // pump_read resumes from the same header.
                ParseOutcome::Short => break,
            };

            let payload = self
                .socket
                .recv_buf()
                .take_bytes(header.length as usize)
                .ok_or_else(|| Error::Protocol("payload vanished after header parse".into()))?;

            self.route(db, header, &payload);
        }
        Ok(())
    }

    fn route(&mut self, db: &dyn UserDb, header: Header, payload: &[u8]) {
        if header.tid == 0 {
            self.route_connection_level(db, header, payload);
            return;
        }

        if let Some(trans) = self.transactions.get_mut(&header.tid) {
            trans.recv(header.kind, header.cid, payload);
        } else {
            tracing::warn!(tid = header.tid, "packet for unknown transaction, dropped");
        }
    }

    fn route_connection_level(&mut self, db: &dyn UserDb, header: Header, payload: &[u8]) {
        match header.kind {
            PacketType::Hello => {
                tracing::debug!(client_id = self.client_id, "HELLO");
            }
            PacketType::Quit => {
                tracing::info!(client_id = self.client_id, "QUIT received, terminating");
                std::process::exit(0);
            }
            PacketType::Inject | PacketType::Extract | PacketType::Command => {
                let tid = self.allocate_tid();
                let kind = match header.kind {
                    PacketType::Inject => Kind::Inject,
                    PacketType::Extract => Kind::Extract,
                    _ => Kind::Command,
                };
                let mut trans = Transaction::new(tid, kind);
                crate::dispatch::process_request(
                    db,
                    &mut trans,
                    header.kind,
                    payload,
                    self.default_command_timeout_secs,
                );
                self.transactions.insert(tid, trans);
            }
            other => {
                tracing::error!(?other, "unexpected packet type at connection level");
            }
        }
    }

    fn allocate_tid(&mut self) -> u16 {
        loop {
            let tid = self.next_tid;
            self.next_tid = self.next_tid.wrapping_add(1).max(1);
            if tid != 0 && !self.transactions.contains_key(&tid) {
                return tid;
            }
        }
    }

    fn drain_transaction_outboxes(&mut self) {
        for (&tid, trans) in &mut self.transactions {
            for pkt in trans.take_outbox() {
                match codec::build(pkt.kind, tid, pkt.cid, &pkt.payload) {
                    Ok(wire) => self.socket.enqueue(wire),
                    Err(e) => tracing::error!(error = %e, "failed to frame outbound packet"),
                }
            }
        }
    }

    fn reap_done(&mut self) {
        self.transactions.retain(|_, trans| !trans.is_done());
    }
}

/// A connection in the listener role: accepts new streams and hands
/// them to the pool as freshly-registered request-servicing
/// connections.
pub struct ListenerConnection<L: Listener> {
    listener: L,
}

impl<L: Listener> ListenerConnection<L> {
    #[must_use]
    pub const fn new(listener: L) -> Self {
        Self { listener }
    }

    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accept one new stream if the listener is ready, turning it into
    /// a fresh request-servicing `Connection`.
    pub fn tick(
        &mut self,
        high_water_bytes: usize,
        default_command_timeout_secs: u32,
    ) -> std::io::Result<Option<Connection<L::Stream>>> {
        Ok(self
            .listener
            .try_accept()?
            .map(|stream| Connection::new(stream, high_water_bytes, default_command_timeout_secs)))
    }
}
