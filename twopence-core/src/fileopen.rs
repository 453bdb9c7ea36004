//! File opener: `open_file_as`.
//!
//! Resolves a user, resolves a client-supplied path relative to that
//! user's home, temporarily drops privileges while opening, and
//! rejects anything that isn't a regular file. Grounded on
//! `server_open_file_as` in the original C server, with its two noted
//! bugs fixed: the inconsistent `false`/`-1` return (this always
//! returns `Result`, never a bare bool) and the `"flags=0%0"` debug
//! format string (the equivalent `tracing` call below uses `{flags:o}`).

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{open, OFlag};
use nix::sys::stat::{fchmod, fstat, Mode, SFlag};
use nix::unistd::close;

use crate::credentials::SavedCredentials;
use crate::error::{Error, Result};
use crate::userdb::{self, UserDb};

/// Join `name` under `home` if `name` is relative, rejecting the
/// result if it would exceed `PATH_MAX`. Unlike the original's static
/// buffer, this returns an owned `PathBuf` and lets the caller decide
/// its lifetime.
fn resolve_path(home: &Path, name: &str) -> Result<PathBuf> {
    let path = if name.starts_with('/') {
        PathBuf::from(name)
    } else {
        home.join(name)
    };

    let path_max = nix::unistd::sysconf(nix::unistd::SysconfVar::PATH_MAX)
        .ok()
        .flatten()
        .unwrap_or(4096) as usize;
    if path.as_os_str().len() >= path_max {
        return Err(Error::PathTooLong);
    }

    Ok(path)
}

/// Open `name` as `user`, applying `oflags`/`mode` the way the client
/// requested.
///
/// # Errors
///
/// [`Error::UnknownUser`], [`Error::PathTooLong`],
/// [`Error::NotRegularFile`], [`Error::PrivilegeDrop`], or a wrapped
/// I/O error from `open`/`fstat`/`fchmod`.
pub fn open_file_as(
    db: &dyn UserDb,
    user_name: &str,
    name: &str,
    mode: Mode,
    oflags: OFlag,
) -> Result<RawFd> {
    let user = userdb::resolve(db, user_name)?;
    let path = resolve_path(&user.home, name)?;

    tracing::debug!(
        user = %user_name,
        file = %path.display(),
        flags = format!("{:o}", oflags.bits()),
        "open_file_as",
    );

    let fd = if user.name == "root" {
        open(&path, oflags, mode).map_err(|e| Error::Io(e.into()))?
    } else {
        let _guard = SavedCredentials::drop_to(&user.name, user.uid, user.gid)
            .map_err(|e| Error::PrivilegeDrop(e.to_string()))?;
        open(&path, oflags, mode).map_err(|e| Error::Io(e.into()))?
        // `_guard` drops here, restoring privileges before we touch
        // the opened fd any further.
    };

    match validate_and_finish(fd, oflags, mode) {
        Ok(()) => Ok(fd),
        Err(e) => {
            let _ = close(fd);
            Err(e)
        }
    }
}

fn validate_and_finish(fd: RawFd, oflags: OFlag, mode: Mode) -> Result<()> {
    let stat = fstat(fd).map_err(|e| Error::Io(e.into()))?;
    if (stat.st_mode & SFlag::S_IFMT.bits()) != SFlag::S_IFREG.bits() {
        return Err(Error::NotRegularFile);
    }

    if oflags != OFlag::O_RDONLY {
        fchmod(fd, mode).map_err(|e| Error::Io(e.into()))?;
    }

    Ok(())
}
