//! User database lookup, narrowed to exactly what the core needs.
//!
//! Kept behind a trait so tests can substitute a fixed table instead
//! of depending on the real `/etc/passwd`.

use std::path::PathBuf;

use nix::unistd::{Gid, Uid, User};

use crate::error::{Error, Result};

/// The pieces of a passwd entry the core actually consults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub home: PathBuf,
}

/// Looks up users by name.
pub trait UserDb: Send + Sync {
    /// Resolve a user name. `Ok(None)` means "no such user" (the
    /// caller turns that into [`Error::UnknownUser`] with the name
    /// attached, since the name isn't available from inside this
    /// trait's error type).
    fn lookup(&self, name: &str) -> std::io::Result<Option<UserRecord>>;
}

/// Resolve `name` against `db`, producing [`Error::UnknownUser`] on a
/// miss the way every caller in this crate needs.
pub fn resolve(db: &dyn UserDb, name: &str) -> Result<UserRecord> {
    match db.lookup(name)? {
        Some(record) => Ok(record),
        None => Err(Error::UnknownUser(name.to_owned())),
    }
}

/// The real, `/etc/passwd`-backed lookup, via `nix::unistd::User`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUserDb;

impl UserDb for SystemUserDb {
    fn lookup(&self, name: &str) -> std::io::Result<Option<UserRecord>> {
        let user = User::from_name(name).map_err(std::io::Error::from)?;
        Ok(user.map(|u| UserRecord {
            name: u.name,
            uid: u.uid,
            gid: u.gid,
            home: u.dir,
        }))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{UserDb, UserRecord};
    use std::collections::HashMap;

    /// An in-memory table for tests, so credential/path logic can be
    /// exercised without touching the real passwd database.
    #[derive(Default)]
    pub struct FakeUserDb {
        table: HashMap<String, UserRecord>,
    }

    impl FakeUserDb {
        pub fn with(mut self, record: UserRecord) -> Self {
            self.table.insert(record.name.clone(), record);
            self
        }
    }

    impl UserDb for FakeUserDb {
        fn lookup(&self, name: &str) -> std::io::Result<Option<UserRecord>> {
            Ok(self.table.get(name).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeUserDb;
    use super::*;

    #[test]
    fn unknown_user_is_an_error() {
        let db = FakeUserDb::default();
        let err = resolve(&db, "nobodysuch").unwrap_err();
        assert!(matches!(err, Error::UnknownUser(name) if name == "nobodysuch"));
    }

    #[test]
    fn known_user_resolves() {
        let db = FakeUserDb::default().with(UserRecord {
            name: "alice".into(),
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
            home: PathBuf::from("/home/alice"),
        });
        let record = resolve(&db, "alice").unwrap();
        assert_eq!(record.home, PathBuf::from("/home/alice"));
    }
}
