//! twopence-core
//!
//! The request-servicing core of a remote test-execution agent: a
//! wire codec, a non-blocking socket/channel layer, a subprocess
//! launcher with privilege dropping, a file opener, and the
//! transaction/connection/pool plumbing that ties them together into
//! a single-threaded, `ppoll`-driven event loop.
//!
//! - Wire codec (`codec`)
//! - Transport abstraction + UNIX-domain back-end (`transport`)
//! - Socket framing buffers (`socket`)
//! - Directional byte conduits (`channel`)
//! - Per-request state machine (`transaction`)
//! - Request dispatch (`dispatch`)
//! - Per-client demultiplexing (`connection`)
//! - `ppoll`-based multiplexer (`pool`)
//! - Scoped privilege drop (`credentials`)
//! - User lookup (`userdb`)
//! - Subprocess launching (`launcher`)
//! - Privilege-scoped file opening (`fileopen`)
//! - Runtime configuration (`config`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]

pub mod buffer;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod fileopen;
pub mod launcher;
pub mod pool;
pub mod socket;
pub mod transaction;
pub mod transport;
pub mod userdb;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::connection::{Connection, ListenerConnection};
    pub use crate::error::{Error, Result};
    pub use crate::pool::ConnectionPool;
    pub use crate::transport::{Listener, Transport, UnixSocketListener, UnixTransport};
    pub use crate::userdb::{SystemUserDb, UserDb, UserRecord};
}

use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::transport::UnixSocketListener;
use crate::userdb::UserDb;

/// Bind the UNIX-domain listener named in `config` and run the
/// request-servicing pool forever. The only way out is `QUIT` (which
/// calls `std::process::exit` from inside `Connection::route`) or a
/// fatal I/O error on the listener itself.
///
/// This is the one function `twopenced`'s `main.rs` calls; everything
/// else in this crate is reachable only through it or through tests.
///
/// # Errors
///
/// Propagates a failure to bind the listener socket, or a fatal error
/// out of the pool's `ppoll` wait.
pub fn run(config: &config::Config, db: &dyn UserDb) -> Result<()> {
    pool::install_signal_discipline().map_err(|e| error::Error::Io(e.into()))?;

    let listener = UnixSocketListener::bind(&config.bind_path)?;
    tracing::info!(path = %config.bind_path.display(), "listening");

    let mut pool = ConnectionPool::new(
        listener,
        config.outbound_high_water_bytes,
        config.default_command_timeout_secs,
    );
    while pool.run_once(db)? {}
    Ok(())
}
