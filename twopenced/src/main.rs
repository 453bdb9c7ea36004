//! `twopenced`: the UNIX-domain-socket front door for `twopence-core`.
//!
//! A thin client: parses arguments, builds a [`twopence_core::config::Config`],
//! binds the listener, and hands off to `twopence_core::run`. All the
//! actual request-servicing logic lives in `twopence-core`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use twopence_core::config::Config;
use twopence_core::userdb::SystemUserDb;

use twopenced::dev_tracing;

/// Remote test-execution agent: accepts commands, file pushes, and
/// file pulls from a test driver over a UNIX-domain socket.
#[derive(Parser, Debug)]
#[command(name = "twopenced", version, about)]
struct Args {
    /// Path of the UNIX-domain socket to listen on.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Accept connections and service requests (currently the only
    /// supported mode; kept as an explicit flag so a future
    /// single-shot or inetd-style mode has somewhere to branch from).
    #[arg(long, default_value_t = true)]
    listen: bool,

    /// Keepalive interval, in seconds, between idle-connection checks.
    /// Unset disables keepalive entirely.
    #[arg(long, value_name = "SECS")]
    keepalive: Option<u64>,

    /// Increase logging verbosity (repeatable: -v, -vv, -vvv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity; takes precedence over `-v`.
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn default_level(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn main() {
    let args = Args::parse();
    dev_tracing::init_logging(default_level(args.verbose, args.quiet));

    let mut config = Config::from_env();
    if let Some(socket) = args.socket {
        config.bind_path = socket;
    }
    config.keepalive = args.keepalive.map(Duration::from_secs);

    if !args.listen {
        tracing::error!("twopenced currently only supports --listen mode");
        std::process::exit(1);
    }

    let db = SystemUserDb;
    if let Err(e) = twopence_core::run(&config, &db) {
        tracing::error!(error = %e, "fatal error, exiting");
        std::process::exit(1);
    }
}
