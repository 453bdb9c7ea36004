//! Top-level request dispatch: turns a freshly-opened transaction and
//! its first payload into a running `Transaction`.
//!
//! Grounded on `server_process_request`/`server_inject_file`/
//! `server_extract_file`/`server_run_command` in the original C
//! server. `server_request_quit` has no counterpart here — a `QUIT`
//! packet is handled by the connection/pool layer, not a transaction.

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::os::unix::io::IntoRawFd;

use crate::channel::{Direction, EofHook};
use crate::codec::{self, CommandRequest, FileXferRequest, CID_FILE, CID_STDERR, CID_STDIN, CID_STDOUT};
use crate::fileopen::open_file_as;
use crate::launcher::{self, Command};
use crate::transaction::{Kind, Transaction};
use crate::userdb::UserDb;

/// Start an INJECT transaction: open the destination file for
/// writing, attach it as the transaction's sink, and tell the client
/// to start sending data.
pub fn start_inject(db: &dyn UserDb, trans: &mut Transaction, xfer: &FileXferRequest) {
    debug_assert_eq!(trans.kind, Kind::Inject);

    let mode = Mode::from_bits_truncate(xfer.mode & 0o7777);
    let fd = match open_file_as(
        db,
        &xfer.user,
        &xfer.path,
        mode,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
    ) {
        Ok(fd) => fd,
        Err(e) => {
            trans.fail(e.errno_like());
            return;
        }
    };

    trans.attach_sink(CID_FILE, fd, "file");
    trans.set_hook(CID_FILE, Direction::Sink, EofHook::InjectWriteComplete);
    trans.send_major(0);
}

/// Start an EXTRACT transaction: open the source file for reading and
/// attach it as the transaction's source. No packets are expected
/// from the client; the connection pumps the source and sends `DATA`
/// on its own.
pub fn start_extract(db: &dyn UserDb, trans: &mut Transaction, xfer: &FileXferRequest) {
    debug_assert_eq!(trans.kind, Kind::Extract);

    let fd = match open_file_as(
        db,
        &xfer.user,
        &xfer.path,
        Mode::from_bits_truncate(0o600),
        OFlag::O_RDONLY,
    ) {
        Ok(fd) => fd,
        Err(e) => {
            trans.fail(e.errno_like());
            return;
        }
    };

    trans.attach_source(CID_FILE, fd, "file");
    trans.set_hook(CID_FILE, Direction::Source, EofHook::ExtractReadComplete);
}

/// Start a COMMAND transaction: launch the subprocess and attach
/// stdin/stdout/(stderr) channels. When the child's stderr is merged
/// into its pty-backed stdout, an immediate `EOF` on the stderr
/// channel id tells the client there's no separate stream coming.
///
/// `default_timeout_secs` is substituted when the request's own
/// `timeout_secs` is `0` ("use the server default" per `spec.md` §3's
/// `Command` attributes).
pub fn start_command(db: &dyn UserDb, trans: &mut Transaction, req: &CommandRequest, default_timeout_secs: u32) {
    debug_assert_eq!(trans.kind, Kind::Command);

    let cmd = Command {
        user: req.user.clone(),
        command: req.command.clone(),
        env: req.env.clone(),
        timeout_secs: if req.timeout_secs == 0 { default_timeout_secs } else { req.timeout_secs },
        request_tty: req.request_tty,
    };

    let launched = match launcher::run_command_as(db, &cmd) {
        Ok(l) => l,
        Err(e) => {
            trans.fail2(e.errno_like(), 0);
            return;
        }
    };

    trans.attach_sink(CID_STDIN, launched.streams.stdin.into_raw_fd(), "stdin");
    trans.attach_source(CID_STDOUT, launched.streams.stdout.into_raw_fd(), "stdout");

    match launched.streams.stderr {
        Some(stderr) => {
            trans.attach_source(CID_STDERR, stderr.into_raw_fd(), "stderr");
        }
        None => {
            trans.note_no_separate_stderr();
        }
    }

    trans.set_pid(launched.pid);
}

/// Dissect and start a request addressed to a freshly-created
/// transaction. `command[0] == '\0'` in the original becomes an empty
/// string here; both reject the request the same way.
pub fn process_request(
    db: &dyn UserDb,
    trans: &mut Transaction,
    kind: codec::PacketType,
    payload: &[u8],
    default_command_timeout_secs: u32,
) {
    match kind {
        codec::PacketType::Inject => match codec::dissect_file_xfer(payload) {
            Ok(xfer) => start_inject(db, trans, &xfer),
            Err(e) => trans.fail(e.errno_like()),
        },
        codec::PacketType::Extract => match codec::dissect_file_xfer(payload) {
            Ok(xfer) => start_extract(db, trans, &xfer),
            Err(e) => trans.fail(e.errno_like()),
        },
        codec::PacketType::Command => match codec::dissect_command(payload) {
            Ok(req) if req.command.is_empty() => {
                trans.fail(libc::EINVAL);
            }
            Ok(req) => start_command(db, trans, &req, default_command_timeout_secs),
            Err(e) => trans.fail(e.errno_like()),
        },
        other => {
            tracing::error!(?other, "unexpected packet type opening a transaction");
            trans.fail(libc::EINVAL);
        }
    }
}
