//! Session worker: the process serving one client connection.
//!
//! A worker starts [`Unconfined`], still carrying the supervisor's identity,
//! and only accepts `login`. A successful login confines the process to the
//! server root under the user's identity and turns it into a
//! `Worker<Confined>`, which serves file commands until the client leaves.
mod connection;
pub mod jail;
mod ops;

use std::collections::HashSet;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use ipc::{ChannelError, Endpoint, Message, RequestId, Status, TransferRequest};
use locks::LockTable;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::errno::Errno;
use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::unistd::{Pid, User, chdir, chroot, getpid, getppid, setgid, setgroups, setuid};
use tracing::{debug, info, instrument, warn};

pub use connection::Connection;
pub use jail::{Jail, Resolved, Scope};

use crate::errors::{CommandError, LoginError, PathError, ServerError};
use crate::privileges::Privileges;
use crate::supervisor::supervisor_signals;
use crate::users::UserDb;

const CLIENT: Token = Token(0);
const PIPE: Token = Token(1);

/// Everything a freshly forked worker takes over from the supervisor.
pub struct WorkerSeed {
    pub locks: LockTable,
    pub stream: TcpStream,
    pub endpoint: Endpoint,
    pub privileges: Privileges,
    pub root: PathBuf,
    pub users_file: PathBuf,
    pub parent: Pid,
    pub peer: SocketAddr,
}

impl WorkerSeed {
    /// Serve the session to completion. Only returns in the worker process.
    #[instrument(name = "session", skip_all, fields(peer = %self.peer, pid = %getpid()))]
    pub fn serve(self) -> Result<(), ServerError> {
        supervisor_signals()
            .thread_unblock()
            .map_err(ServerError::Signals)?;
        prctl::set_pdeathsig(Signal::SIGKILL).map_err(ServerError::Signals)?;
        if getppid() != self.parent {
            info!("Supervisor exited before the session started");
            return Ok(());
        }
        let worker = Worker::from_seed(self)?;
        match worker.run()? {
            Some(confined) => confined.run(),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct Unconfined;

#[derive(Debug)]
pub struct Confined {
    username: String,
    jail: Jail,
}

enum Input {
    Line(String),
    Pipe(Message),
    Hangup,
}

/// Outcome of a transfer this session asked for.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Handled,
    Rejected,
}

/// The session's two conversations: the client socket and the supervisor
/// channel.
#[derive(Debug)]
struct Link {
    conn: Connection,
    endpoint: Endpoint,
    /// Requests this session answered and still expects a verdict for.
    awaiting_ack: HashSet<RequestId>,
}

impl Link {
    fn new(conn: Connection, endpoint: Endpoint) -> Self {
        Self {
            conn,
            endpoint,
            awaiting_ack: HashSet::new(),
        }
    }

    fn send(&mut self, text: &str) -> Result<(), CommandError> {
        self.conn.send_str(text).map_err(CommandError::Client)
    }

    /// Report the result of a command to the client. Only a broken client or
    /// supervisor connection is passed on.
    fn reply(&mut self, result: Result<Option<String>, CommandError>) -> Result<(), ServerError> {
        let sent = match result {
            Ok(Some(text)) => self.conn.send_str(&format!("ok-{text}")),
            Ok(None) => Ok(()),
            Err(err) => {
                let err = err.into_fatal()?;
                debug!(error = ?err, "Command refused");
                self.conn.send_str(&format!("err-{err}"))
            }
        };
        sent.map_err(ServerError::Client)
    }

    /// Hand a message to the supervisor. Oversized fields are the client's
    /// fault, not a broken channel.
    fn submit(&mut self, msg: &Message) -> Result<(), CommandError> {
        match self.endpoint.tx.send(msg) {
            Err(ChannelError::FieldTooLong { .. }) => Err(PathError::TooLong.into()),
            other => Ok(other?),
        }
    }

    /// React to a message from the supervisor. Verdicts that are not for a
    /// request this session answered are returned to the caller.
    fn on_message(&mut self, msg: Message, username: &str) -> Result<Option<Outcome>, CommandError> {
        let id = msg.request.id;
        match msg.status {
            Status::WhoAreYou => self.endpoint.tx.send(&Message::i_am_user(username))?,
            Status::TransferRequest => self.send(&notice(&msg.request))?,
            Status::Handled if self.awaiting_ack.remove(&id) => {
                self.send(&format!("Transfer request {id} completed."))?
            }
            Status::Rejected if self.awaiting_ack.remove(&id) => {
                self.send(&format!("Transfer request {id} was rejected."))?
            }
            Status::Handled => return Ok(Some(Outcome::Handled)),
            Status::Rejected => return Ok(Some(Outcome::Rejected)),
            status => warn!(%status, "Supervisor sent a message meant for itself"),
        }
        Ok(None)
    }

    /// Block until the supervisor rules on this session's own request,
    /// serving everything else it sends meanwhile. Client input is held
    /// back for later; a client hangup ends the wait.
    fn await_outcome(
        &mut self,
        username: &str,
        poll: &mut Poll,
        events: &mut Events,
    ) -> Result<Outcome, CommandError> {
        loop {
            if let Some(msg) = self.endpoint.rx.try_recv()? {
                match self.on_message(msg, username)? {
                    Some(outcome) => return Ok(outcome),
                    None => continue,
                }
            }
            if self.conn.buffer_input().map_err(CommandError::Client)? {
                info!("Client disconnected while waiting on a transfer");
                return Err(CommandError::Client(io::ErrorKind::UnexpectedEof.into()));
            }
            match poll.poll(events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(CommandError::io("Error waiting for a response")(e)),
            }
        }
    }
}

fn transition(step: &'static str) -> impl FnOnce(Errno) -> LoginError {
    move |err| LoginError::Transition { step, err }
}

fn notice(request: &TransferRequest) -> String {
    format!(
        "Transfer request id: {} from {} to {} for file {}",
        request.id, request.sender, request.receiver, request.path
    )
}

pub struct Worker<S> {
    link: Link,
    locks: LockTable,
    users: UserDb,
    privileges: Privileges,
    root: PathBuf,
    parent: Pid,
    poll: Poll,
    events: Events,
    state: S,
}

impl<S> Worker<S> {
    fn assemble(
        link: Link,
        locks: LockTable,
        users: UserDb,
        privileges: Privileges,
        root: PathBuf,
        parent: Pid,
        state: S,
    ) -> Result<Self, ServerError> {
        let poll = Poll::new().map_err(ServerError::PollCreation)?;
        let registry = poll.registry();
        registry
            .register(&mut SourceFd(&link.conn.as_raw_fd()), CLIENT, Interest::READABLE)
            .map_err(ServerError::PollRegistration)?;
        registry
            .register(&mut SourceFd(&link.endpoint.rx.as_raw_fd()), PIPE, Interest::READABLE)
            .map_err(ServerError::PollRegistration)?;
        Ok(Self {
            link,
            locks,
            users,
            privileges,
            root,
            parent,
            poll,
            events: Events::with_capacity(4),
            state,
        })
    }

    /// Next thing to react to. Both sources are drained before polling
    /// since their readiness is edge-triggered.
    fn next_input(&mut self) -> Result<Input, ServerError> {
        loop {
            if let Some(msg) = self.link.endpoint.rx.try_recv()? {
                return Ok(Input::Pipe(msg));
            }
            match self.link.conn.try_line() {
                Ok(Some(line)) => return Ok(Input::Line(line)),
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Input::Hangup),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    self.link.reply(Err(CommandError::LineTooLong))?;
                    continue;
                }
                Err(e) => return Err(ServerError::Client(e)),
            }
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ServerError::Poll(e)),
            }
        }
    }
}

impl Worker<Unconfined> {
    fn from_seed(seed: WorkerSeed) -> Result<Self, ServerError> {
        let conn = Connection::new(seed.stream).map_err(ServerError::Client)?;
        let users = UserDb::load(seed.users_file)?;
        Self::assemble(
            Link::new(conn, seed.endpoint),
            seed.locks,
            users,
            seed.privileges,
            seed.root,
            seed.parent,
            Unconfined,
        )
    }

    /// Serve a client that has not logged in yet. Returns the confined
    /// worker after a successful login, or `None` if the client left.
    pub fn run(mut self) -> Result<Option<Worker<Confined>>, ServerError> {
        loop {
            let line = match self.next_input()? {
                Input::Hangup => return Ok(None),
                Input::Pipe(msg) => {
                    debug!(status = %msg.status, "Not logged in, ignoring supervisor");
                    continue;
                }
                Input::Line(line) => line,
            };
            let mut words = line.split_whitespace();
            let result = match (words.next(), words.next(), words.next()) {
                (None, ..) => continue,
                (Some("login"), Some(name), None) => match self.authenticate(name) {
                    Ok(account) => return self.login(account).map(Some),
                    Err(err) => {
                        warn!(user = name, error = %err, "Login refused");
                        Err(CommandError::Login(err))
                    }
                },
                (Some("login"), ..) => Err(CommandError::Usage("login <username>")),
                (Some("exit"), None, _) => {
                    self.link.reply(Ok(Some("Bye.".to_string())))?;
                    return Ok(None);
                }
                _ => Err(CommandError::NotLoggedIn),
            };
            self.link.reply(result)?;
        }
    }

    /// Checks that can fail without consequence for the session.
    fn authenticate(&mut self, name: &str) -> Result<User, LoginError> {
        self.users.reload()?;
        if !self.users.contains(name) {
            return Err(LoginError::Unregistered(name.to_string()));
        }
        User::from_name(name)
            .map_err(LoginError::Lookup)?
            .ok_or_else(|| LoginError::NoAccount(name.to_string()))
    }

    fn login(mut self, account: User) -> Result<Worker<Confined>, ServerError> {
        if let Err(err) = self.confine(&account) {
            let _ = self.link.send("err-Login failed");
            return Err(err.into());
        }
        info!(user = %account.name, "Logged in");

        let Worker {
            mut link,
            locks,
            mut users,
            privileges,
            root,
            parent,
            poll,
            events,
            state: Unconfined,
        } = self;
        // The registry is only reachable through the jail from now on.
        if let Ok(inside) = users.path().strip_prefix(&root) {
            users.relocate(Path::new("/").join(inside));
        }
        link.reply(Ok(Some("Login successful".to_string())))?;
        link.endpoint.tx.send(&Message::i_am_user(&account.name))?;
        Ok(Worker {
            state: Confined {
                jail: Jail::chrooted(&root, &account.name),
                username: account.name,
            },
            link,
            locks,
            users,
            privileges,
            root,
            parent,
            poll,
            events,
        })
    }

    /// Lock the process into the root under the user's identity. There is
    /// no way back from a partial transition.
    fn confine(&self, account: &User) -> Result<(), LoginError> {
        self.privileges.assume_root()?;
        chroot(&self.root).map_err(transition("chroot"))?;
        chdir("/").map_err(transition("chdir to root"))?;
        chdir(account.name.as_str()).map_err(transition("chdir to home"))?;
        setgroups(&[account.gid]).map_err(transition("setgroups"))?;
        setgid(account.gid).map_err(transition("setgid"))?;
        setuid(account.uid).map_err(transition("setuid"))?;
        prctl::set_pdeathsig(Signal::SIGKILL).map_err(transition("prctl"))?;
        if getppid() != self.parent {
            return Err(LoginError::Transition {
                step: "parent check",
                err: Errno::ESRCH,
            });
        }
        Ok(())
    }
}

impl Worker<Confined> {
    pub fn username(&self) -> &str {
        &self.state.username
    }

    pub fn run(mut self) -> Result<(), ServerError> {
        loop {
            match self.next_input()? {
                Input::Hangup => {
                    info!("Client disconnected");
                    return Ok(());
                }
                Input::Pipe(msg) => {
                    let outcome = self.link.on_message(msg, &self.state.username);
                    if let Some(outcome) = outcome.or_else(|e| e.into_fatal().map(|_| None))? {
                        warn!(?outcome, "Verdict for a request this session is not waiting on");
                    }
                }
                Input::Line(line) => {
                    if self.dispatch(&line)? == ops::Flow::Exit {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};

    pub(crate) struct Client {
        pub writer: TcpStream,
        pub reader: BufReader<TcpStream>,
    }

    impl Client {
        pub fn new(stream: TcpStream) -> Self {
            Self {
                writer: stream.try_clone().unwrap(),
                reader: BufReader::new(stream),
            }
        }

        pub fn line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            line.trim_end_matches('\n').to_string()
        }

        pub fn send(&mut self, text: &str) {
            self.writer.write_all(text.as_bytes()).unwrap();
        }
    }

    /// A registry with alice and bob plus alice's home under a fresh root.
    pub(crate) fn root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("alice")).unwrap();
        std::fs::write(
            dir.path().join("users.toml"),
            "[[users]]\nname = \"alice\"\npermissions = \"750\"\n\n\
             [[users]]\nname = \"bob\"\npermissions = \"750\"\n",
        )
        .unwrap();
        dir
    }

    fn parts(root: &Path) -> (Link, UserDb, Endpoint, Client) {
        let (conn, client) = connection::tests::pair();
        let (supervisor, worker) = ipc::duplex().unwrap();
        let users = UserDb::load(root.join("users.toml")).unwrap();
        (Link::new(conn, worker), users, supervisor, Client::new(client))
    }

    impl Worker<Unconfined> {
        pub(crate) fn for_test(root: &Path) -> (Self, Endpoint, Client) {
            let (link, users, supervisor, client) = parts(root);
            let worker = Self::assemble(
                link,
                LockTable::new().unwrap(),
                users,
                Privileges::default(),
                root.to_path_buf(),
                getppid(),
                Unconfined,
            )
            .unwrap();
            (worker, supervisor, client)
        }
    }

    impl Worker<Confined> {
        fn await_verdict(&mut self) -> Result<Outcome, CommandError> {
            self.link
                .await_outcome(&self.state.username, &mut self.poll, &mut self.events)
        }

        /// A logged-in worker that has not changed its root or identity.
        pub(crate) fn for_test(root: &Path, username: &str) -> (Self, Endpoint, Client) {
            let (link, users, supervisor, client) = parts(root);
            let state = Confined {
                username: username.to_string(),
                jail: Jail::new(root, root, username),
            };
            let worker = Self::assemble(
                link,
                LockTable::new().unwrap(),
                users,
                Privileges::default(),
                root.to_path_buf(),
                getppid(),
                state,
            )
            .unwrap();
            (worker, supervisor, client)
        }
    }

    #[test]
    fn commands_before_login_are_refused() {
        let dir = root();
        let (worker, _supervisor, mut client) = Worker::<Unconfined>::for_test(dir.path());
        client.send("list\n\nlogin\nlogin mallory\nexit\n");
        assert!(worker.run().unwrap().is_none());

        assert_eq!(client.line(), "err-You must login first");
        assert_eq!(client.line(), "err-Usage: login <username>");
        assert_eq!(client.line(), "err-Login failed");
        assert_eq!(client.line(), "ok-Bye.");
    }

    #[test]
    fn hangup_before_login_ends_session() {
        let dir = root();
        let (worker, mut supervisor, client) = Worker::<Unconfined>::for_test(dir.path());
        supervisor.tx.send(&Message::who_are_you()).unwrap();
        drop(client);
        assert!(worker.run().unwrap().is_none());
    }

    #[test]
    fn identity_is_announced_on_request() {
        let dir = root();
        let (mut worker, mut supervisor, _client) = Worker::<Confined>::for_test(dir.path(), "alice");
        let outcome = worker.link.on_message(Message::who_are_you(), "alice").unwrap();
        assert!(outcome.is_none());
        assert_eq!(supervisor.rx.recv().unwrap(), Message::i_am_user("alice"));
    }

    #[test]
    fn offers_are_shown_to_client() {
        let dir = root();
        let (mut worker, _supervisor, mut client) = Worker::<Confined>::for_test(dir.path(), "bob");
        let offer = Message::offer(&TransferRequest {
            id: 4,
            sender: "alice".to_string(),
            receiver: "bob".to_string(),
            path: "/srv/alice/f.txt".to_string(),
        });
        assert!(worker.link.on_message(offer, "bob").unwrap().is_none());
        assert_eq!(
            client.line(),
            "Transfer request id: 4 from alice to bob for file /srv/alice/f.txt"
        );
    }

    #[test]
    fn verdicts_on_answered_requests_are_consumed() {
        let dir = root();
        let (mut worker, _supervisor, mut client) = Worker::<Confined>::for_test(dir.path(), "bob");
        worker.link.awaiting_ack.insert(4);
        assert!(worker.link.on_message(Message::handled(4), "bob").unwrap().is_none());
        assert_eq!(client.line(), "Transfer request 4 completed.");
        assert_eq!(
            worker.link.on_message(Message::handled(4), "bob").unwrap(),
            Some(Outcome::Handled)
        );
    }

    #[test]
    fn overlong_command_is_refused() {
        let dir = root();
        let (worker, _supervisor, mut client) = Worker::<Confined>::for_test(dir.path(), "alice");
        client.send(&format!("{}\nexit\n", "x".repeat(connection::MAX_LINE + 1)));
        worker.run().unwrap();
        assert_eq!(client.line(), "err-Line too long");
        assert_eq!(client.line(), "ok-Bye.");
    }

    #[test]
    fn hangup_ends_wait_for_verdict() {
        let dir = root();
        let (mut worker, _supervisor, client) = Worker::<Confined>::for_test(dir.path(), "alice");
        drop(client);
        let err = worker.await_verdict().unwrap_err();
        assert!(matches!(err, CommandError::Client(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn input_during_wait_is_served_afterwards() {
        let dir = root();
        let (mut worker, mut supervisor, mut client) = Worker::<Confined>::for_test(dir.path(), "alice");
        client.send("list\n");
        let verdict = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            supervisor.tx.send(&Message::handled(7)).unwrap();
            supervisor
        });
        assert_eq!(worker.await_verdict().unwrap(), Outcome::Handled);
        let _supervisor = verdict.join().unwrap();
        assert_eq!(worker.link.conn.try_line().unwrap().as_deref(), Some("list"));
    }

    #[test]
    fn confined_session_ends_on_exit() {
        let dir = root();
        let (worker, _supervisor, mut client) = Worker::<Confined>::for_test(dir.path(), "alice");
        assert_eq!(worker.username(), "alice");
        client.send("login bob\nexit\n");
        worker.run().unwrap();
        assert_eq!(client.line(), "err-Already logged in");
        assert_eq!(client.line(), "ok-Bye.");
    }
}
