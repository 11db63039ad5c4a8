//! File commands of a logged-in session.
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use ipc::{Message, RequestId};
use locks::{LockHandle, ReadGuard, WriteGuard};
use nix::unistd::{AccessFlags, access};
use tracing::{debug, info};

use super::{Confined, Link, Outcome, Resolved, Scope, Worker};
use crate::errors::{CommandError, PathError, ServerError};
use crate::users::Mode;

const READ_CHUNK: usize = 4096;
const END_OF_DATA: &str = "EOF";

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Flow {
    Continue,
    Exit,
}

type Reply = Result<Option<String>, CommandError>;

fn read_locked<'h>(handle: &'h LockHandle<'_>, link: &mut Link) -> Result<ReadGuard<'h>, CommandError> {
    if let Some(guard) = handle.try_read_lock()? {
        return Ok(guard);
    }
    link.send("waiting to read...")?;
    Ok(handle.read_lock()?)
}

fn write_locked<'h>(handle: &'h LockHandle<'_>, link: &mut Link) -> Result<WriteGuard<'h>, CommandError> {
    if let Some(guard) = handle.try_write_lock()? {
        return Ok(guard);
    }
    link.send("waiting to write...")?;
    Ok(handle.write_lock()?)
}

fn parse_mode(text: &str) -> Result<Mode, CommandError> {
    Mode::parse(text).ok_or(CommandError::InvalidPermissions)
}

/// `[-offset=N] <path>`
fn offset_and_path<'a>(
    args: &[&'a str],
    usage: &'static str,
) -> Result<(Option<u64>, &'a str), CommandError> {
    match args {
        [path] => Ok((None, path)),
        [flag, path] => {
            let offset = flag
                .strip_prefix("-offset=")
                .and_then(|n| n.parse().ok())
                .ok_or(CommandError::Usage(usage))?;
            Ok((Some(offset), path))
        }
        _ => Err(CommandError::Usage(usage)),
    }
}

fn host_str(target: &Resolved) -> Result<&str, CommandError> {
    target.host.to_str().ok_or(CommandError::Path(PathError::NotUtf8))
}

fn is_file(path: &Path) -> Result<(), CommandError> {
    let meta = fs::metadata(path).map_err(CommandError::io("File not found"))?;
    if meta.is_file() {
        Ok(())
    } else {
        Err(CommandError::Io {
            what: "Not a regular file",
            err: io::ErrorKind::InvalidInput.into(),
        })
    }
}

impl Worker<Confined> {
    /// Run one client command line.
    pub(super) fn dispatch(&mut self, line: &str) -> Result<Flow, ServerError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            return Ok(Flow::Continue);
        };
        debug!(command, "Dispatching");
        let result = match command {
            "create" => self.create(args),
            "chmod" => self.chmod(args),
            "move" => self.rename(args),
            "cd" => self.cd(args),
            "list" => self.list(args),
            "read" => self.read(args),
            "write" => self.write(args),
            "delete" => self.delete(args),
            "transfer_request" => self.transfer_request(args),
            "accept" => self.accept(args),
            "reject" => self.reject(args),
            "login" => Err(CommandError::AlreadyLoggedIn),
            "exit" => {
                self.link.reply(Ok(Some("Bye.".to_string())))?;
                return Ok(Flow::Exit);
            }
            _ => Err(CommandError::Unknown),
        };
        self.link.reply(result)?;
        Ok(Flow::Continue)
    }

    fn create(&mut self, args: &[&str]) -> Reply {
        const USAGE: &str = "create [-d] <path> <permissions>";
        let (directory, name, perms) = match args {
            ["-d", name, perms] => (true, *name, *perms),
            [name, perms] => (false, *name, *perms),
            _ => return Err(CommandError::Usage(USAGE)),
        };
        let mode = parse_mode(perms)?;
        let target = self.state.jail.resolve(name, Scope::Home)?;
        let handle = self.locks.acquire(&target.host)?;
        let _guard = write_locked(&handle, &mut self.link)?;

        if directory {
            fs::create_dir(&target.local).map_err(CommandError::io("Error creating directory"))?;
        } else {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode.bits())
                .open(&target.local)
                .map_err(CommandError::io("Error creating file"))?;
        }
        fs::set_permissions(&target.local, Permissions::from_mode(mode.bits()))
            .map_err(CommandError::io("Error setting permissions"))?;
        let kind = if directory { "Directory" } else { "File" };
        Ok(Some(format!(
            "{kind} {name} created successfully with permissions {mode}."
        )))
    }

    fn chmod(&mut self, args: &[&str]) -> Reply {
        let [name, perms] = args else {
            return Err(CommandError::Usage("chmod <path> <permissions>"));
        };
        let mode = parse_mode(perms)?;
        let target = self.state.jail.resolve(name, Scope::Home)?;
        let handle = self.locks.acquire(&target.host)?;
        let _guard = write_locked(&handle, &mut self.link)?;
        fs::set_permissions(&target.local, Permissions::from_mode(mode.bits()))
            .map_err(CommandError::io("Error changing permissions"))?;
        Ok(Some(format!("Permissions of {name} changed to {mode}.")))
    }

    fn rename(&mut self, args: &[&str]) -> Reply {
        let [from, to] = args else {
            return Err(CommandError::Usage("move <source> <destination>"));
        };
        let source = self.state.jail.resolve(from, Scope::Home)?;
        let destination = self.state.jail.resolve(to, Scope::Home)?;
        let source_handle = self.locks.acquire(&source.host)?;
        let destination_handle = self.locks.acquire(&destination.host)?;

        // Two sessions moving in opposite directions must lock in the same
        // order.
        let (first, second) = if source.host <= destination.host {
            (&source_handle, &destination_handle)
        } else {
            (&destination_handle, &source_handle)
        };
        let _first = write_locked(first, &mut self.link)?;
        let _second = if source.host != destination.host {
            Some(write_locked(second, &mut self.link)?)
        } else {
            None
        };
        fs::rename(&source.local, &destination.local).map_err(CommandError::io("Error moving file"))?;
        Ok(Some(format!("Moved {from} to {to}.")))
    }

    fn cd(&mut self, args: &[&str]) -> Reply {
        let [name] = args else {
            return Err(CommandError::Usage("cd <path>"));
        };
        let target = self.state.jail.resolve(name, Scope::Root)?;
        let meta = fs::metadata(&target.local).map_err(CommandError::io("Error changing directory"))?;
        if !meta.is_dir() {
            return Err(CommandError::Io {
                what: "Error changing directory",
                err: io::ErrorKind::NotADirectory.into(),
            });
        }
        access(&target.local, AccessFlags::X_OK).map_err(|errno| CommandError::Io {
            what: "Error changing directory",
            err: errno.into(),
        })?;
        self.state.jail.enter(&target);
        Ok(Some("Directory changed successfully.".to_string()))
    }

    fn list(&mut self, args: &[&str]) -> Reply {
        let target = match args {
            [] => self.state.jail.resolve(".", Scope::Root)?,
            [name] => self.state.jail.resolve(name, Scope::Root)?,
            _ => return Err(CommandError::Usage("list [path]")),
        };
        let mut entries = Vec::new();
        for entry in fs::read_dir(&target.local).map_err(CommandError::io("Error listing directory"))? {
            let entry = entry.map_err(CommandError::io("Error listing directory"))?;
            let Ok(meta) = fs::metadata(entry.path()) else {
                continue;
            };
            entries.push((
                entry.file_name().to_string_lossy().into_owned(),
                meta.len(),
                meta.permissions().mode() & 0o777,
            ));
        }
        entries.sort();

        self.link.send("ok-")?;
        for (name, size, mode) in entries {
            self.link.send(&format!("{name}\tSize: {size}\tPerms: {mode:03o}"))?;
        }
        self.link.send("")?;
        Ok(None)
    }

    fn read(&mut self, args: &[&str]) -> Reply {
        let (offset, name) = offset_and_path(args, "read [-offset=N] <path>")?;
        let target = self.state.jail.resolve(name, Scope::Home)?;
        let handle = self.locks.acquire(&target.host)?;
        let _guard = read_locked(&handle, &mut self.link)?;

        let mut file = fs::File::open(&target.local).map_err(CommandError::io("Error reading file"))?;
        if let Some(offset) = offset {
            file.seek(SeekFrom::Start(offset))
                .map_err(CommandError::io("Error seeking file"))?;
        }
        self.link.send("ok-")?;
        let mut chunk = [0u8; READ_CHUNK];
        let mut last = b'\n';
        loop {
            let n = match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CommandError::io("Error reading file")(e)),
            };
            self.link.conn.send_bytes(&chunk[..n]).map_err(CommandError::Client)?;
            last = chunk[n - 1];
        }
        if last != b'\n' {
            self.link.conn.send_bytes(b"\n").map_err(CommandError::Client)?;
        }
        Ok(None)
    }

    fn write(&mut self, args: &[&str]) -> Reply {
        let (offset, name) = offset_and_path(args, "write [-offset=N] <path>")?;
        let target = self.state.jail.resolve(name, Scope::Home)?;
        let handle = self.locks.acquire(&target.host)?;
        let _guard = write_locked(&handle, &mut self.link)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(offset.is_none())
            .mode(0o700)
            .open(&target.local)
            .map_err(CommandError::io("Error opening file"))?;
        if let Some(offset) = offset {
            file.seek(SeekFrom::Start(offset))
                .map_err(CommandError::io("Error seeking file"))?;
        }
        self.link
            .send(&format!("ok-Waiting for data... (Type '{END_OF_DATA}' to finish)"))?;

        // Keep consuming lines after a failed write so they are not taken
        // for commands.
        let mut failure = None;
        let mut written = 0usize;
        loop {
            let line = match self.link.conn.line() {
                Ok(line) => line,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    failure.get_or_insert(e);
                    continue;
                }
                Err(e) => return Err(CommandError::Client(e)),
            };
            if line == END_OF_DATA {
                break;
            }
            if failure.is_none() {
                match file.write_all(line.as_bytes()).and_then(|()| file.write_all(b"\n")) {
                    Ok(()) => written += line.len() + 1,
                    Err(err) => failure = Some(err),
                }
            }
        }
        if let Some(err) = failure {
            return Err(CommandError::io("Error writing file")(err));
        }
        debug!(bytes = written, path = %target.view.display(), "Wrote file");
        Ok(Some("File written successfully.".to_string()))
    }

    fn delete(&mut self, args: &[&str]) -> Reply {
        let [name] = args else {
            return Err(CommandError::Usage("delete <path>"));
        };
        let target = self.state.jail.resolve(name, Scope::Home)?;
        let handle = self.locks.acquire(&target.host)?;
        let _guard = write_locked(&handle, &mut self.link)?;
        let meta =
            fs::symlink_metadata(&target.local).map_err(CommandError::io("Error deleting file"))?;
        if meta.is_dir() {
            fs::remove_dir(&target.local).map_err(CommandError::io("Error deleting directory"))?;
        } else {
            fs::remove_file(&target.local).map_err(CommandError::io("Error deleting file"))?;
        }
        Ok(Some(format!("Deleted {name}.")))
    }

    /// Offer a file to another user and wait for their verdict. The source
    /// stays read-locked until then.
    fn transfer_request(&mut self, args: &[&str]) -> Reply {
        let [name, receiver] = args else {
            return Err(CommandError::Usage("transfer_request <path> <user>"));
        };
        if *receiver == self.state.username {
            return Err(CommandError::SelfTransfer);
        }
        self.users.reload()?;
        if !self.users.contains(receiver) {
            return Err(CommandError::InvalidUser);
        }
        let source = self.state.jail.resolve(name, Scope::Home)?;
        is_file(&source.local)?;
        let handle = self.locks.acquire(&source.host)?;
        let _guard = read_locked(&handle, &mut self.link)?;

        let request = Message::new_request(&self.state.username, *receiver, host_str(&source)?);
        self.link.submit(&request)?;
        self.link.send("Transfer request sent successfully")?;
        self.link.send("Waiting for response...")?;
        info!(receiver, path = %source.view.display(), "Waiting on transfer");
        match self
            .link
            .await_outcome(&self.state.username, &mut self.poll, &mut self.events)?
        {
            Outcome::Handled => Ok(Some("Request handled by destination user.".to_string())),
            Outcome::Rejected => Err(CommandError::Rejected),
        }
    }

    fn accept(&mut self, args: &[&str]) -> Reply {
        let [id, name] = args else {
            return Err(CommandError::Usage("accept <request id> <destination>"));
        };
        let id: RequestId = id.parse().map_err(|_| CommandError::InvalidId)?;
        let destination = self.state.jail.resolve(name, Scope::Home)?;
        let msg = Message::accept(id, &self.state.username, host_str(&destination)?);
        self.link.submit(&msg)?;
        self.link.awaiting_ack.insert(id);
        Ok(Some(format!("Accept sent for request {id}.")))
    }

    fn reject(&mut self, args: &[&str]) -> Reply {
        let [id] = args else {
            return Err(CommandError::Usage("reject <request id>"));
        };
        let id: RequestId = id.parse().map_err(|_| CommandError::InvalidId)?;
        self.link.submit(&Message::reject(id, &self.state.username))?;
        self.link.awaiting_ack.insert(id);
        Ok(Some(format!("Reject sent for request {id}.")))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{Client, root};
    use super::*;
    use ipc::{Endpoint, Status, TransferRequest};
    use pretty_assertions::assert_eq;

    fn alice() -> (tempfile::TempDir, Worker<Confined>, Endpoint, Client) {
        let dir = root();
        let (worker, supervisor, client) = Worker::<Confined>::for_test(dir.path(), "alice");
        (dir, worker, supervisor, client)
    }

    fn run(worker: &mut Worker<Confined>, line: &str) {
        assert_eq!(worker.dispatch(line).unwrap(), Flow::Continue);
    }

    #[test]
    fn files_are_created_written_and_read() {
        let (dir, mut worker, _supervisor, mut client) = alice();
        run(&mut worker, "create notes.txt 640");
        assert_eq!(
            client.line(),
            "ok-File notes.txt created successfully with permissions 640."
        );
        let path = dir.path().join("alice/notes.txt");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o640);

        client.send("hello\nworld\nEOF\n");
        run(&mut worker, "write notes.txt");
        assert_eq!(client.line(), "ok-Waiting for data... (Type 'EOF' to finish)");
        assert_eq!(client.line(), "ok-File written successfully.");
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello\nworld\n");

        run(&mut worker, "read notes.txt");
        assert_eq!(client.line(), "ok-");
        assert_eq!(client.line(), "hello");
        assert_eq!(client.line(), "world");

        run(&mut worker, "read -offset=6 notes.txt");
        assert_eq!(client.line(), "ok-");
        assert_eq!(client.line(), "world");
        assert_eq!(worker.locks.slots_in_use().unwrap(), 0);
    }

    #[test]
    fn overlong_data_line_fails_the_write() {
        let (dir, mut worker, _supervisor, mut client) = alice();
        let long = "x".repeat(super::super::connection::MAX_LINE + 1);
        client.send(&format!("short\n{long}\nlist\nEOF\n"));
        run(&mut worker, "write big.txt");
        assert_eq!(client.line(), "ok-Waiting for data... (Type 'EOF' to finish)");
        assert_eq!(client.line(), "err-Error writing file");
        assert_eq!(fs::read_to_string(dir.path().join("alice/big.txt")).unwrap(), "short\n");
        assert!(worker.link.conn.try_line().unwrap().is_none());
    }

    #[test]
    fn write_at_offset_keeps_the_rest() {
        let (dir, mut worker, _supervisor, mut client) = alice();
        let path = dir.path().join("alice/f.txt");
        fs::write(&path, "0123456789").unwrap();
        client.send("ab\nEOF\n");
        run(&mut worker, "write -offset=2 f.txt");
        client.line();
        assert_eq!(client.line(), "ok-File written successfully.");
        assert_eq!(fs::read_to_string(&path).unwrap(), "01ab\n56789");
    }

    #[test]
    fn unterminated_content_gets_a_newline() {
        let (dir, mut worker, _supervisor, mut client) = alice();
        fs::write(dir.path().join("alice/f.txt"), "no newline").unwrap();
        run(&mut worker, "read f.txt");
        assert_eq!(client.line(), "ok-");
        assert_eq!(client.line(), "no newline");
    }

    #[test]
    fn bad_arguments_are_refused() {
        let (_dir, mut worker, _supervisor, mut client) = alice();
        for (line, reply) in [
            ("create x 999", "err-permission not valid"),
            ("create x 64", "err-permission not valid"),
            ("chmod x", "err-Usage: chmod <path> <permissions>"),
            ("read ../bob/f.txt", "err-Invalid path"),
            ("read /etc/passwd", "err-Invalid path"),
            ("read -offset=x f.txt", "err-Usage: read [-offset=N] <path>"),
            ("accept seven f.txt", "err-Invalid request id"),
            ("frobnicate", "err-Unknown command"),
            ("login bob", "err-Already logged in"),
        ] {
            run(&mut worker, line);
            assert_eq!(client.line(), reply, "{line}");
        }
    }

    #[test]
    fn files_move_and_disappear() {
        let (dir, mut worker, _supervisor, mut client) = alice();
        fs::write(dir.path().join("alice/a.txt"), "a").unwrap();
        run(&mut worker, "move a.txt b.txt");
        assert_eq!(client.line(), "ok-Moved a.txt to b.txt.");
        assert!(dir.path().join("alice/b.txt").exists());

        run(&mut worker, "move b.txt b.txt");
        assert_eq!(client.line(), "ok-Moved b.txt to b.txt.");

        run(&mut worker, "delete b.txt");
        assert_eq!(client.line(), "ok-Deleted b.txt.");
        assert!(!dir.path().join("alice/b.txt").exists());

        run(&mut worker, "delete b.txt");
        assert!(client.line().starts_with("err-"));
    }

    #[test]
    fn directories_are_navigated_and_listed() {
        let (dir, mut worker, _supervisor, mut client) = alice();
        run(&mut worker, "create -d docs 755");
        assert_eq!(
            client.line(),
            "ok-Directory docs created successfully with permissions 755."
        );
        run(&mut worker, "cd docs");
        assert_eq!(client.line(), "ok-Directory changed successfully.");
        run(&mut worker, "list");
        assert_eq!(client.line(), "ok-");
        assert_eq!(client.line(), "");

        fs::write(dir.path().join("alice/docs/f.txt"), "four").unwrap();
        fs::set_permissions(
            dir.path().join("alice/docs/f.txt"),
            Permissions::from_mode(0o640),
        )
        .unwrap();
        run(&mut worker, "list");
        assert_eq!(client.line(), "ok-");
        assert_eq!(client.line(), "f.txt\tSize: 4\tPerms: 640");
        assert_eq!(client.line(), "");

        run(&mut worker, "cd ../..");
        assert_eq!(client.line(), "ok-Directory changed successfully.");
        run(&mut worker, "cd ..");
        assert_eq!(client.line(), "err-Invalid path");
        run(&mut worker, "cd users.toml");
        assert_eq!(client.line(), "err-Error changing directory");
    }

    fn queue(supervisor: &mut Endpoint, messages: &[Message]) {
        for msg in messages {
            supervisor.tx.send(msg).unwrap();
        }
    }

    #[test]
    fn transfer_request_waits_for_verdict() {
        let (dir, mut worker, mut supervisor, mut client) = alice();
        fs::write(dir.path().join("alice/f.txt"), "payload").unwrap();
        let offer = TransferRequest {
            id: 7,
            sender: "carol".to_string(),
            receiver: "alice".to_string(),
            path: "/srv/carol/c.txt".to_string(),
        };
        queue(
            &mut supervisor,
            &[Message::who_are_you(), Message::offer(&offer), Message::handled(1)],
        );
        run(&mut worker, "transfer_request f.txt bob");

        let sent = supervisor.rx.recv().unwrap();
        assert_eq!(sent.status, Status::NewRequest);
        assert_eq!(sent.request.sender, "alice");
        assert_eq!(sent.request.receiver, "bob");
        assert_eq!(
            Path::new(&sent.request.path),
            dir.path().join("alice/f.txt")
        );
        assert_eq!(supervisor.rx.recv().unwrap(), Message::i_am_user("alice"));

        assert_eq!(client.line(), "Transfer request sent successfully");
        assert_eq!(client.line(), "Waiting for response...");
        assert_eq!(
            client.line(),
            "Transfer request id: 7 from carol to alice for file /srv/carol/c.txt"
        );
        assert_eq!(client.line(), "ok-Request handled by destination user.");
        assert_eq!(worker.locks.slots_in_use().unwrap(), 0);
    }

    #[test]
    fn rejected_transfer_is_reported() {
        let (dir, mut worker, mut supervisor, mut client) = alice();
        fs::write(dir.path().join("alice/f.txt"), "payload").unwrap();
        queue(&mut supervisor, &[Message::rejected(1)]);
        run(&mut worker, "transfer_request f.txt bob");
        client.line();
        client.line();
        assert_eq!(client.line(), "err-Request rejected by destination user");
    }

    #[test]
    fn answered_requests_do_not_end_own_wait() {
        let (dir, mut worker, mut supervisor, mut client) = alice();
        fs::write(dir.path().join("alice/f.txt"), "payload").unwrap();
        run(&mut worker, "accept 5 in.txt");
        assert_eq!(client.line(), "ok-Accept sent for request 5.");
        let accept = supervisor.rx.recv().unwrap();
        assert_eq!(accept.status, Status::Accept);
        assert_eq!(accept.request.id, 5);
        assert_eq!(Path::new(&accept.request.path), dir.path().join("alice/in.txt"));

        run(&mut worker, "reject 6");
        assert_eq!(client.line(), "ok-Reject sent for request 6.");
        assert_eq!(supervisor.rx.recv().unwrap().status, Status::Reject);

        queue(
            &mut supervisor,
            &[Message::handled(5), Message::rejected(6), Message::handled(9)],
        );
        run(&mut worker, "transfer_request f.txt bob");
        client.line();
        client.line();
        assert_eq!(client.line(), "Transfer request 5 completed.");
        assert_eq!(client.line(), "Transfer request 6 was rejected.");
        assert_eq!(client.line(), "ok-Request handled by destination user.");
    }

    #[test]
    fn transfers_need_a_real_file_and_another_user() {
        let (dir, mut worker, _supervisor, mut client) = alice();
        fs::create_dir(dir.path().join("alice/docs")).unwrap();
        run(&mut worker, "transfer_request f.txt alice");
        assert_eq!(client.line(), "err-Cannot transfer a file to yourself");
        run(&mut worker, "transfer_request f.txt mallory");
        assert_eq!(client.line(), "err-Invalid user");
        run(&mut worker, "transfer_request f.txt bob");
        assert_eq!(client.line(), "err-File not found");
        run(&mut worker, "transfer_request docs bob");
        assert_eq!(client.line(), "err-Not a regular file");
    }
}
