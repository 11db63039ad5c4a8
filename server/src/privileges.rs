//! Effective-uid bookkeeping for a server started through `sudo`.
//!
//! The supervisor keeps root as its real uid but runs with the invoking
//! user's effective uid, raising it back to root only for the few steps that
//! need it.
use nix::unistd::{Gid, Uid, geteuid, seteuid};
use tracing::{error, warn};

use crate::errors::PrivilegeError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Invoker {
    pub uid: Uid,
    pub gid: Gid,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Privileges {
    invoker: Option<Invoker>,
}

/// Root effective uid held until dropped.
#[derive(Debug)]
#[must_use = "privileges are lowered again as soon as the guard is dropped"]
pub struct Escalation<'a> {
    privileges: &'a Privileges,
}

fn parse_id(name: &'static str, value: &str) -> Result<u32, PrivilegeError> {
    value
        .trim()
        .parse()
        .map_err(|_| PrivilegeError::InvalidVariable {
            name,
            value: value.to_string(),
        })
}

impl Privileges {
    /// Read `SUDO_UID`/`SUDO_GID`. Without them, or when not actually running
    /// as root, every operation simply runs as the current user.
    pub fn from_env() -> Result<Self, PrivilegeError> {
        Self::from_vars(
            std::env::var("SUDO_UID").ok().as_deref(),
            std::env::var("SUDO_GID").ok().as_deref(),
        )
    }

    fn from_vars(uid: Option<&str>, gid: Option<&str>) -> Result<Self, PrivilegeError> {
        let (Some(uid), Some(gid)) = (uid, gid) else {
            warn!("SUDO_UID/SUDO_GID not found, running as current user");
            return Ok(Self::default());
        };
        let invoker = Invoker {
            uid: Uid::from_raw(parse_id("SUDO_UID", uid)?),
            gid: Gid::from_raw(parse_id("SUDO_GID", gid)?),
        };
        if !geteuid().is_root() {
            warn!("Started with sudo variables but without root, ignoring them");
            return Ok(Self::default());
        }
        Ok(Self {
            invoker: Some(invoker),
        })
    }

    pub fn invoker(&self) -> Option<Invoker> {
        self.invoker
    }

    /// Run with the invoking user's effective uid.
    pub fn minimize(&self) -> Result<(), PrivilegeError> {
        match self.invoker {
            Some(invoker) => seteuid(invoker.uid).map_err(|err| PrivilegeError::Switch {
                op: "seteuid(invoker)",
                err,
            }),
            None => Ok(()),
        }
    }

    /// Raise the effective uid to root and keep it there. Used by a worker
    /// that is about to give up root for good.
    pub fn assume_root(&self) -> Result<(), PrivilegeError> {
        match self.invoker {
            Some(_) => seteuid(Uid::from_raw(0)).map_err(|err| PrivilegeError::Switch {
                op: "seteuid(0)",
                err,
            }),
            None => Ok(()),
        }
    }

    /// Raise the effective uid to root until the guard is dropped. Guards do
    /// not nest.
    pub fn escalate(&self) -> Result<Escalation<'_>, PrivilegeError> {
        self.assume_root()?;
        Ok(Escalation { privileges: self })
    }
}

impl Drop for Escalation<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.privileges.minimize() {
            error!("Failed to lower privileges: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variables_mean_unprivileged() {
        let privileges = Privileges::from_vars(None, Some("1000")).unwrap();
        assert_eq!(privileges.invoker(), None);
        // Nothing to switch, so these never touch the process identity.
        privileges.minimize().unwrap();
        let guard = privileges.escalate().unwrap();
        drop(guard);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let err = Privileges::from_vars(Some("alice"), Some("1000")).unwrap_err();
        assert!(matches!(
            err,
            PrivilegeError::InvalidVariable {
                name: "SUDO_UID",
                ..
            }
        ));
        assert!(Privileges::from_vars(Some("1000"), Some("")).is_err());
    }
}
