use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};

use ipc::TransferRequest;
use locks::LockTable;
use nix::unistd::{User, chown};
use tracing::debug;

use crate::broker::TransferFs;
use crate::errors::TransferError;
use crate::privileges::Privileges;

/// The supervisor's side of an accepted transfer: a locked copy made with
/// root privileges, handed to the receiver afterwards.
pub struct PrivilegedCopy<'a> {
    locks: &'a LockTable,
    privileges: &'a Privileges,
    root: &'a Path,
}

impl<'a> PrivilegedCopy<'a> {
    pub fn new(locks: &'a LockTable, privileges: &'a Privileges, root: &'a Path) -> Self {
        Self {
            locks,
            privileges,
            root,
        }
    }

    /// Paths arrive from workers as host paths; refuse anything that is not
    /// a plain path below the root.
    fn confine(&self, path: &str) -> Result<PathBuf, TransferError> {
        let path = Path::new(path);
        let plain = path
            .components()
            .all(|c| matches!(c, Component::RootDir | Component::Normal(_)));
        if plain && path.is_absolute() && path.starts_with(self.root) && path != self.root {
            Ok(path.to_path_buf())
        } else {
            Err(TransferError::OutsideRoot(path.to_path_buf()))
        }
    }
}

impl TransferFs for PrivilegedCopy<'_> {
    fn copy(&mut self, request: &TransferRequest, destination: &str) -> Result<(), TransferError> {
        let source = self.confine(&request.path)?;
        let destination = self.confine(destination)?;
        if source == destination {
            return Err(TransferError::SamePath);
        }
        let receiver = User::from_name(&request.receiver)
            .map_err(TransferError::Lookup)?
            .ok_or_else(|| TransferError::NoAccount(request.receiver.clone()))?;

        // The supervisor must never wait on a session's lock.
        let source_handle = self.locks.acquire(&source)?;
        let destination_handle = self.locks.acquire(&destination)?;
        let Some(_read) = source_handle.try_read_lock()? else {
            return Err(TransferError::InUse(source));
        };
        let Some(_write) = destination_handle.try_write_lock()? else {
            return Err(TransferError::InUse(destination));
        };
        let _root = self.privileges.escalate()?;

        let copy_err = |path: &Path| {
            let path = path.to_path_buf();
            move |err: io::Error| TransferError::Copy { path, err }
        };
        let mut from = File::open(&source).map_err(copy_err(&source))?;
        let mut to = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o700)
            .open(&destination)
            .map_err(copy_err(&destination))?;
        let bytes = io::copy(&mut from, &mut to).map_err(copy_err(&destination))?;
        chown(&destination, Some(receiver.uid), Some(receiver.gid)).map_err(|err| {
            TransferError::Chown {
                path: destination.clone(),
                err,
            }
        })?;
        debug!(bytes, destination = %destination.display(), "Copied transfer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &Path, receiver: &str) -> TransferRequest {
        TransferRequest {
            id: 1,
            sender: "alice".to_string(),
            receiver: receiver.to_string(),
            path: path.to_string_lossy().into_owned(),
        }
    }

    #[test]
    fn paths_must_stay_below_root() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockTable::new().unwrap();
        let privileges = Privileges::default();
        let copier = PrivilegedCopy::new(&locks, &privileges, dir.path());

        let inside = dir.path().join("bob/f.txt");
        assert_eq!(copier.confine(inside.to_str().unwrap()).unwrap(), inside);
        for bad in [
            "/etc/passwd".to_string(),
            "bob/f.txt".to_string(),
            format!("{}/bob/../../x", dir.path().display()),
            dir.path().display().to_string(),
        ] {
            assert!(
                matches!(copier.confine(&bad), Err(TransferError::OutsideRoot(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn copy_overwrites_destination_for_current_user() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("f.txt");
        let destination = dir.path().join("g.txt");
        std::fs::write(&source, b"payload").unwrap();
        std::fs::write(&destination, b"old contents that are longer").unwrap();

        let me = User::from_uid(nix::unistd::getuid()).unwrap().unwrap();
        let locks = LockTable::new().unwrap();
        let privileges = Privileges::default();
        let mut copier = PrivilegedCopy::new(&locks, &privileges, dir.path());
        copier
            .copy(&request(&source, &me.name), destination.to_str().unwrap())
            .unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"payload");
        assert_eq!(locks.slots_in_use().unwrap(), 0);
    }

    #[test]
    fn held_locks_fail_the_copy_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("f.txt");
        let destination = dir.path().join("g.txt");
        std::fs::write(&source, b"payload").unwrap();
        std::fs::write(&destination, b"old").unwrap();

        let me = User::from_uid(nix::unistd::getuid()).unwrap().unwrap();
        let locks = LockTable::new().unwrap();
        let privileges = Privileges::default();
        let mut copier = PrivilegedCopy::new(&locks, &privileges, dir.path());

        let reader = locks.acquire(&destination).unwrap();
        let read = reader.read_lock().unwrap();
        let err = copier
            .copy(&request(&source, &me.name), destination.to_str().unwrap())
            .unwrap_err();
        assert!(matches!(err, TransferError::InUse(ref path) if *path == destination));
        assert_eq!(std::fs::read(&destination).unwrap(), b"old");
        drop(read);
        drop(reader);

        // A reader on the source does not stand in the way.
        let sharer = locks.acquire(&source).unwrap();
        let _shared = sharer.read_lock().unwrap();
        copier
            .copy(&request(&source, &me.name), destination.to_str().unwrap())
            .unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"payload");

        let writer = locks.acquire(&destination).unwrap();
        let _write = writer.write_lock().unwrap();
        let err = copier
            .copy(&request(&source, &me.name), destination.to_str().unwrap())
            .unwrap_err();
        assert!(matches!(err, TransferError::InUse(_)));
    }

    #[test]
    fn copy_onto_itself_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("f.txt");
        std::fs::write(&source, b"payload").unwrap();
        let locks = LockTable::new().unwrap();
        let privileges = Privileges::default();
        let mut copier = PrivilegedCopy::new(&locks, &privileges, dir.path());
        let err = copier
            .copy(&request(&source, "root"), source.to_str().unwrap())
            .unwrap_err();
        assert!(matches!(err, TransferError::SamePath));
    }
}
