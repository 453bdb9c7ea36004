//! Subprocess launcher: `run_command_as`.
//!
//! Resolves the target user, sets up either a pty or three pipes,
//! forks, drops privileges permanently in the child, and execs
//! `/bin/sh -c <command>`. Grounded on `server_run_command_as` in the
//! original C server: same fd bookkeeping, same distinct exit codes
//! for setup failures in the child (125 pty, 126 credentials/home,
//! 127 exec), same env contract (`PATH` passed through, `HOME`/`USER`
//! force-set).
//!
//! `fork()` is inherently `unsafe` in Rust — the child may only call
//! async-signal-safe functions until it execs. This is sound here
//! specifically because the whole process is single-threaded (no
//! other thread can be mid-allocation when we fork), which is the
//! concurrency model the rest of this crate is built around.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use nix::fcntl::{open, OFlag};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, PtyMaster};
use nix::sys::stat::Mode;
use nix::unistd::{self, alarm, dup, dup2, fork, pipe, setsid, ForkResult, Pid};

use crate::credentials;
use crate::error::{Error, Result};
use crate::userdb::{self, UserDb};

/// A command to run on behalf of a client.
#[derive(Debug, Clone)]
pub struct Command {
    pub user: String,
    pub command: String,
    pub env: Vec<(String, String)>,
    pub timeout_secs: u32,
    pub request_tty: bool,
}

/// Default alarm, in seconds, when a command carries no explicit
/// timeout (mirrors the original's `DEFAULT_COMMAND_TIMEOUT`).
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u32 = 60;

/// The parent-side ends of a launched command's standard streams.
/// With a pty, `stdin` and `stdout` are two dup'd handles onto the
/// same master and `stderr` is `None` (a merged stream).
pub struct ChildStreams {
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: Option<OwnedFd>,
}

/// Outcome of a successful launch.
pub struct Launched {
    pub pid: Pid,
    pub streams: ChildStreams,
}

/// Launch `cmd` as the user it names.
///
/// # Errors
///
/// [`Error::UnknownUser`] if the user doesn't resolve; otherwise an
/// [`Error::ExecSetup`] or [`Error::Fork`] wrapping whatever syscall
/// failed. No descriptors are leaked on any failure path.
pub fn run_command_as(db: &dyn UserDb, cmd: &Command) -> Result<Launched> {
    let user = userdb::resolve(db, &cmd.user)?;

    if cmd.request_tty {
        run_with_pty(cmd, &user)
    } else {
        run_with_pipes(cmd, &user)
    }
}

fn run_with_pty(cmd: &Command, user: &userdb::UserRecord) -> Result<Launched> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
        .map_err(|e| Error::ExecSetup(format!("posix_openpt: {e}")))?;

    let parent_stdin = dup_owned(&master)?;
    let parent_stdout = dup_owned(&master)?;

    match unsafe { fork() }.map_err(|e| Error::Fork(e.to_string()))? {
        ForkResult::Parent { child } => {
            // master is closed when it drops at the end of this function;
            // the two parent-side dups above are what the connection keeps.
            Ok(Launched {
                pid: child,
                streams: ChildStreams {
                    stdin: parent_stdin,
                    stdout: parent_stdout,
                    stderr: None,
                },
            })
        }
        ForkResult::Child => {
            child_exec(cmd, user, ChildFds::Pty(master));
        }
    }
}

fn run_with_pipes(cmd: &Command, user: &userdb::UserRecord) -> Result<Launched> {
    let (stdin_read, stdin_write) = pipe().map_err(|e| Error::ExecSetup(format!("pipe: {e}")))?;
    let (stdout_read, stdout_write) = pipe().map_err(|e| Error::ExecSetup(format!("pipe: {e}")))?;
    let (stderr_read, stderr_write) = pipe().map_err(|e| Error::ExecSetup(format!("pipe: {e}")))?;

    let child_fds = ChildFds::Pipes {
        stdin: stdin_read,
        stdout: stdout_write,
        stderr: stderr_write,
    };

    match unsafe { fork() }.map_err(|e| Error::Fork(e.to_string()))? {
        ForkResult::Parent { child } => Ok(Launched {
            pid: child,
            streams: ChildStreams {
                stdin: stdin_write,
                stdout: stdout_read,
                stderr: Some(stderr_read),
            },
        }),
        ForkResult::Child => {
            child_exec(cmd, user, child_fds);
        }
    }
}

enum ChildFds {
    Pty(PtyMaster),
    Pipes {
        stdin: OwnedFd,
        stdout: OwnedFd,
        stderr: OwnedFd,
    },
}

/// Runs only in the forked child. Never returns: either `execve`
/// replaces this process image, or a setup failure calls `exit` with
/// a distinct status so the parent's `waitpid` can tell setup failures
/// apart from the shell's own exit code.
fn child_exec(cmd: &Command, user: &userdb::UserRecord, fds: ChildFds) -> ! {
    if setsid().is_err() {
        std::process::exit(127);
    }

    if credentials::drop_permanently(&user.name, user.uid, user.gid).is_err() {
        std::process::exit(126);
    }
    if unistd::chdir(user.home.as_path()).is_err() && unistd::chdir("/").is_err() {
        std::process::exit(126);
    }

    match fds {
        ChildFds::Pty(master) => {
            if grantpt(&master).is_err() || unlockpt(&master).is_err() {
                std::process::exit(125);
            }
            let Ok(tty_path) = ptsname_r(&master) else {
                std::process::exit(125);
            };
            let Ok(slave) = open(
                tty_path.as_str(),
                OFlag::O_RDWR | OFlag::O_NOCTTY,
                Mode::empty(),
            ) else {
                std::process::exit(125);
            };
            let _ = dup2(slave, 0);
            let _ = dup2(slave, 1);
            let _ = dup2(slave, 2);
            if slave > 2 {
                let _ = unistd::close(slave);
            }
        }
        ChildFds::Pipes { stdin, stdout, stderr } => {
            let _ = dup2(stdin.as_raw_fd(), 0);
            let _ = dup2(stdout.as_raw_fd(), 1);
            let _ = dup2(stderr.as_raw_fd(), 2);
        }
    }

    close_fds_above(2);

    let timeout = if cmd.timeout_secs == 0 {
        DEFAULT_COMMAND_TIMEOUT_SECS
    } else {
        cmd.timeout_secs
    };
    alarm::set(timeout);

    let Ok(argv) = build_argv(&cmd.command) else {
        std::process::exit(127);
    };
    let env = build_env(&cmd.env, user);

    let _ = unistd::execve(&argv[0], &argv, &env);
    std::process::exit(127);
}

fn build_argv(command: &str) -> std::result::Result<Vec<CString>, std::ffi::NulError> {
    Ok(vec![
        CString::new("/bin/sh")?,
        CString::new("-c")?,
        CString::new(command)?,
    ])
}

/// `PATH` passed through unchanged, then the request's env map merged
/// in, then `HOME`/`USER` force-set from the resolved user last so
/// neither can be overridden by the request (`spec.md` §4.5 step 4).
fn build_env(requested: &[(String, String)], user: &userdb::UserRecord) -> Vec<CString> {
    let mut pairs: Vec<(String, String)> = Vec::new();

    if let Ok(path) = std::env::var("PATH") {
        pairs.push(("PATH".into(), path));
    }

    for (k, v) in requested {
        pairs.retain(|(existing, _)| existing != k);
        pairs.push((k.clone(), v.clone()));
    }

    let forced: [(String, String); 2] = [
        (
            "HOME".to_owned(),
            user.home
                .to_str()
                .filter(|s| !s.is_empty())
                .unwrap_or("/none")
                .to_owned(),
        ),
        ("USER".to_owned(), user.name.clone()),
    ];
    for (k, v) in forced {
        pairs.retain(|(existing, _)| *existing != k);
        pairs.push((k, v));
    }

    pairs
        .into_iter()
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect()
}

fn close_fds_above(keep_below_or_eq: RawFd) {
    let max_fd = nix::unistd::sysconf(nix::unistd::SysconfVar::OPEN_MAX)
        .ok()
        .flatten()
        .unwrap_or(1024);
    for fd in (keep_below_or_eq + 1)..(max_fd as RawFd) {
        let _ = unistd::close(fd);
    }
}

fn dup_owned(master: &PtyMaster) -> Result<OwnedFd> {
    let raw = dup(master.as_raw_fd()).map_err(|e| Error::ExecSetup(format!("dup: {e}")))?;
    Ok(unsafe { std::os::unix::io::FromRawFd::from_raw_fd(raw) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::userdb::test_support::FakeUserDb;
    use crate::userdb::UserRecord;
    use std::io::Read;
    use std::path::PathBuf;

    fn root_db() -> FakeUserDb {
        FakeUserDb::default().with(UserRecord {
            name: "root".into(),
            uid: nix::unistd::Uid::from_raw(0),
            gid: nix::unistd::Gid::from_raw(0),
            home: PathBuf::from("/root"),
        })
    }

    #[test]
    fn unknown_user_never_forks() {
        let db = FakeUserDb::default();
        let cmd = Command {
            user: "nobodysuch".into(),
            command: "echo hi".into(),
            env: vec![],
            timeout_secs: 0,
            request_tty: false,
        };
        let err = run_command_as(&db, &cmd).unwrap_err();
        assert!(matches!(err, Error::UnknownUser(_)));
    }

    #[test]
    fn echo_via_pipes_round_trips_stdout() {
        if unsafe { libc::getuid() } != 0 {
            // Dropping privileges to "root" as a non-root test runner
            // would fail; this scenario only runs meaningfully as root.
            return;
        }
        let db = root_db();
        let cmd = Command {
            user: "root".into(),
            command: "echo hi".into(),
            env: vec![],
            timeout_secs: 5,
            request_tty: false,
        };
        let launched = run_command_as(&db, &cmd).unwrap();
        let mut out = String::new();
        let mut stdout = std::fs::File::from(launched.streams.stdout);
        stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hi\n");
        let _ = nix::sys::wait::waitpid(launched.pid, None);
    }
}
