//! Scoped privilege drop, modeled as a resource.
//!
//! The original server paired every `seteuid`/`setegid` drop with a
//! manual restore call on each exit path, and aborted if the restore
//! didn't take. Here the drop is a constructor and the restore is
//! `Drop`, so every exit path — including an early `?` return — runs
//! it exactly once.

use nix::errno::Errno;
use nix::unistd::{self, Gid, Uid};

/// Credentials captured before a temporary privilege drop, restored
/// when this guard is dropped.
///
/// A `None` inner value means "root acting as root": nothing was
/// dropped, so nothing needs restoring.
pub struct SavedCredentials {
    saved: Option<(Uid, Gid)>,
}

impl SavedCredentials {
    /// Temporarily become `target_uid`/`target_gid`, after calling
    /// `initgroups` for `user_name` so supplementary groups match.
    /// Root stays root (matches the original's "do nothing for the
    /// root user" special case).
    ///
    /// # Errors
    ///
    /// If any of `initgroups`/`setegid`/`seteuid` fails, privileges
    /// are restored to what they were before this call and the error
    /// is returned — the process never ends up half-dropped.
    pub fn drop_to(
        user_name: &str,
        target_uid: Uid,
        target_gid: Gid,
    ) -> Result<Self, Errno> {
        if target_uid == unistd::geteuid() {
            return Ok(Self { saved: None });
        }

        let saved_uid = unistd::geteuid();
        let saved_gid = unistd::getegid();
        let guard = Self {
            saved: Some((saved_uid, saved_gid)),
        };

        let c_user = std::ffi::CString::new(user_name).map_err(|_| Errno::EINVAL)?;
        unistd::initgroups(&c_user, target_gid)?;
        unistd::setegid(target_gid)?;
        unistd::seteuid(target_uid)?;

        Ok(guard)
    }
}

impl Drop for SavedCredentials {
    fn drop(&mut self) {
        let Some((uid, gid)) = self.saved else {
            return;
        };

        if unistd::seteuid(uid).is_err() || unistd::geteuid() != uid {
            tracing::error!(target_uid = uid.as_raw(), "unable to restore uid, aborting");
            std::process::abort();
        }
        if unistd::setegid(gid).is_err() || unistd::getegid() != gid {
            tracing::error!(target_gid = gid.as_raw(), "unable to restore gid, aborting");
            std::process::abort();
        }
    }
}

/// Permanently adopt `target_uid`/`target_gid` (used post-`fork`,
/// before `execve`, where there is no scope to restore into).
///
/// # Errors
///
/// Propagates the first failing syscall's error.
pub fn drop_permanently(
    user_name: &str,
    target_uid: Uid,
    target_gid: Gid,
) -> Result<(), Errno> {
    if target_uid == unistd::geteuid() {
        return Ok(());
    }

    let c_user = std::ffi::CString::new(user_name).map_err(|_| Errno::EINVAL)?;
    unistd::initgroups(&c_user, target_gid)?;
    unistd::setgid(target_gid)?;
    unistd::setuid(target_uid)?;
    Ok(())
}
