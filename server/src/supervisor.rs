//! The supervisor process: accepts clients, forks one worker per session and
//! runs the transfer broker over the workers' channels.
//!
//! Everything here happens on one thread in one `mio` loop. Readiness is
//! edge-triggered, so every source is drained until it would block.
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};

use config::ast::ServerConfig;
use ipc::{ChannelError, Endpoint, Message, Status};
use locks::LockTable;
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal, kill};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid};
use tracing::{debug, error, info, instrument, warn};

use crate::admin::{AdminCommand, Console};
use crate::arena::Arena;
use crate::broker::{Broker, Envelope, Recipient, SessionRef};
use crate::copy::PrivilegedCopy;
use crate::errors::ServerError;
use crate::privileges::Privileges;
use crate::users::UserDb;
use crate::worker::WorkerSeed;

const LISTENER: Token = Token(usize::MAX - 1);
const SIGNALS: Token = Token(usize::MAX - 2);
const ADMIN: Token = Token(usize::MAX - 3);

const BUSY_REPLY: &[u8] = b"err-Server busy, try again later\n";

/// Signals the supervisor takes through its signal descriptor. Workers
/// unblock them again.
pub fn supervisor_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set
}

/// What the current process does once [`Supervisor::run`] returns.
pub enum Role {
    /// The server shut down.
    Exit,
    /// This is a freshly forked worker.
    Worker(WorkerSeed),
}

#[derive(Debug)]
struct Session {
    pid: Pid,
    endpoint: Endpoint,
    /// Identity last announced by the worker.
    username: Option<String>,
}

enum Spawned {
    Parent(SessionRef),
    Child(WorkerSeedParts),
    Refused,
}

/// A new worker's connection and channel, before the rest of the
/// supervisor's state is shed.
struct WorkerSeedParts {
    stream: StdTcpStream,
    endpoint: Endpoint,
    parent: Pid,
    peer: SocketAddr,
}

pub struct Supervisor {
    config: ServerConfig,
    locks: LockTable,
    privileges: Privileges,
    users: UserDb,
    broker: Broker,
    listener: TcpListener,
    poll: Poll,
    signals: SignalFd,
    console: Option<Console<io::Stdin>>,
    sessions: Arena<Session>,
}

impl Supervisor {
    /// Bind the listener and take over signal handling and standard input.
    pub fn new(config: ServerConfig, privileges: Privileges) -> Result<Self, ServerError> {
        let console = Console::stdin().map_err(ServerError::Console)?;
        Self::build(config, privileges, Some(console))
    }

    fn build(
        config: ServerConfig,
        privileges: Privileges,
        console: Option<Console<io::Stdin>>,
    ) -> Result<Self, ServerError> {
        let locks = LockTable::new()?;
        let users = UserDb::load(&config.users_file)?;

        let mask = supervisor_signals();
        mask.thread_block().map_err(ServerError::Signals)?;
        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(ServerError::Signals)?;

        let mut listener = TcpListener::bind(SocketAddr::V4(config.addr)).map_err(|err| {
            ServerError::Bind {
                addr: config.addr,
                err,
            }
        })?;
        let poll = Poll::new().map_err(ServerError::PollCreation)?;
        let registry = poll.registry();
        registry
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ServerError::PollRegistration)?;
        registry
            .register(&mut SourceFd(&signals.as_raw_fd()), SIGNALS, Interest::READABLE)
            .map_err(ServerError::PollRegistration)?;
        if let Some(console) = &console {
            registry
                .register(&mut SourceFd(&console.as_raw_fd()), ADMIN, Interest::READABLE)
                .map_err(ServerError::PollRegistration)?;
        }

        info!(
            addr = %config.addr,
            root = %config.root.display(),
            max_clients = config.max_clients,
            "Server listening"
        );
        Ok(Self {
            config,
            locks,
            privileges,
            users,
            broker: Broker::new(),
            listener,
            poll,
            signals,
            console,
            sessions: Arena::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until shutdown. In a forked child this returns at once with the
    /// worker's share of the supervisor's resources.
    pub fn run(mut self) -> Result<Role, ServerError> {
        let mut events = Events::with_capacity(128);
        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::Poll(e)),
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER => {
                        if let Some(parts) = self.accept_clients()? {
                            return Ok(Role::Worker(self.into_seed(parts)));
                        }
                    }
                    SIGNALS => {
                        if self.handle_signals()? {
                            self.shutdown();
                            return Ok(Role::Exit);
                        }
                    }
                    ADMIN => {
                        if self.handle_admin() {
                            self.shutdown();
                            return Ok(Role::Exit);
                        }
                    }
                    Token(slot) => self.handle_worker_message(slot),
                }
            }
        }
    }

    /// Accept every pending connection. Returns the client's stream when the
    /// current process turns out to be a new worker.
    fn accept_clients(&mut self) -> Result<Option<WorkerSeedParts>, ServerError> {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to accept client");
                    return Ok(None);
                }
            };
            match self.spawn_session(stream, peer)? {
                Spawned::Child(parts) => return Ok(Some(parts)),
                Spawned::Parent(session) => {
                    info!(%peer, slot = session.slot, pid = %session.pid, "Session started")
                }
                Spawned::Refused => warn!(%peer, "Client refused"),
            }
        }
    }

    #[instrument(skip_all, fields(peer = %peer))]
    fn spawn_session(&mut self, mut stream: TcpStream, peer: SocketAddr) -> Result<Spawned, ServerError> {
        if self.sessions.len() >= self.config.max_clients {
            let _ = stream.write(BUSY_REPLY);
            return Ok(Spawned::Refused);
        }
        let (supervisor_end, worker_end) = ipc::duplex()?;
        let parent = getpid();

        // Safety: the supervisor is single-threaded.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(supervisor_end);
                // Safety: the descriptor is taken over from the mio stream.
                let stream = unsafe { StdTcpStream::from_raw_fd(stream.into_raw_fd()) };
                Ok(Spawned::Child(WorkerSeedParts {
                    stream,
                    endpoint: worker_end,
                    parent,
                    peer,
                }))
            }
            Ok(ForkResult::Parent { child }) => {
                drop(worker_end);
                drop(stream);
                supervisor_end.tx.set_nonblocking()?;
                let rx = supervisor_end.rx.as_raw_fd();
                let slot = self.sessions.insert(Session {
                    pid: child,
                    endpoint: supervisor_end,
                    username: None,
                });
                let registered = self.poll.registry().register(
                    &mut SourceFd(&rx),
                    Token(slot),
                    Interest::READABLE,
                );
                if let Err(e) = registered {
                    error!(error = %e, "Failed to watch worker channel");
                    self.close_session(slot);
                    return Err(ServerError::PollRegistration(e));
                }
                Ok(Spawned::Parent(SessionRef { slot, pid: child }))
            }
            Err(errno) => {
                error!(%errno, "Failed to fork worker");
                let _ = stream.write(BUSY_REPLY);
                Ok(Spawned::Refused)
            }
        }
    }

    /// Keep only what a worker needs; the listener, poll instance, signal
    /// descriptor and other sessions' channels close in the child.
    fn into_seed(self, parts: WorkerSeedParts) -> WorkerSeed {
        let WorkerSeedParts {
            stream,
            endpoint,
            parent,
            peer,
        } = parts;
        let Supervisor {
            config,
            locks,
            privileges,
            ..
        } = self;
        WorkerSeed {
            locks,
            stream,
            endpoint,
            privileges,
            root: config.root,
            users_file: config.users_file,
            parent,
            peer,
        }
    }

    /// Drain the channel of one worker through the broker.
    #[instrument(skip(self))]
    pub(crate) fn handle_worker_message(&mut self, slot: usize) {
        loop {
            let Some(session) = self.sessions.get_mut(slot) else {
                return;
            };
            let from = SessionRef {
                slot,
                pid: session.pid,
            };
            let msg = match session.endpoint.rx.try_recv() {
                Ok(Some(msg)) => msg,
                Ok(None) => return,
                Err(err) => {
                    if err.is_peer_gone() {
                        debug!(error = %err, "Worker channel closed");
                    } else {
                        warn!(error = %err, "Worker channel failed");
                    }
                    self.close_session(slot);
                    return;
                }
            };
            if msg.status == Status::IAmUser {
                session.username = Some(msg.request.sender.clone());
            }
            let username = session.username.clone();
            let mut fs = PrivilegedCopy::new(&self.locks, &self.privileges, &self.config.root);
            let envelopes = self.broker.handle(from, username.as_deref(), msg, &mut fs);
            self.deliver(envelopes);
        }
    }

    fn deliver(&mut self, envelopes: Vec<Envelope>) {
        for Envelope { to, message } in envelopes {
            match to {
                Recipient::Session(target) => {
                    let delivered = self.send_to(target, &message);
                    if !delivered && message.status == Status::TransferRequest {
                        self.broker.offer_failed(target, message.request.id);
                    }
                }
                Recipient::Everyone => {
                    let targets: Vec<SessionRef> = self
                        .sessions
                        .iter()
                        .map(|(slot, session)| SessionRef {
                            slot,
                            pid: session.pid,
                        })
                        .collect();
                    for target in targets {
                        self.send_to(target, &message);
                    }
                }
            }
        }
    }

    /// Returns whether the message reached the worker's channel.
    fn send_to(&mut self, target: SessionRef, msg: &Message) -> bool {
        let Some(session) = self
            .sessions
            .get_mut(target.slot)
            .filter(|session| session.pid == target.pid)
        else {
            debug!(slot = target.slot, status = %msg.status, "Recipient is gone, dropping message");
            return false;
        };
        match session.endpoint.tx.send(msg) {
            Ok(()) => return true,
            Err(ChannelError::Full) => {
                warn!(slot = target.slot, status = %msg.status, "Worker is not draining its channel, dropping message")
            }
            Err(err) if err.is_peer_gone() => self.close_session(target.slot),
            Err(err) => warn!(slot = target.slot, error = %err, "Failed to message worker"),
        }
        false
    }

    /// Forget a session whose worker may still be running and make sure it
    /// is not.
    fn close_session(&mut self, slot: usize) {
        if let Some(pid) = self.forget_session(slot) {
            if let Err(errno) = kill(pid, Signal::SIGKILL) {
                debug!(%pid, %errno, "Worker already gone");
            }
        }
    }

    fn forget_session(&mut self, slot: usize) -> Option<Pid> {
        let session = self.sessions.remove(slot)?;
        let _ = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&session.endpoint.rx.as_raw_fd()));
        self.broker.session_closed(SessionRef {
            slot,
            pid: session.pid,
        });
        info!(
            slot,
            pid = %session.pid,
            user = session.username.as_deref().unwrap_or("-"),
            "Session closed"
        );
        Some(session.pid)
    }

    /// Returns whether the server was asked to stop.
    fn handle_signals(&mut self) -> Result<bool, ServerError> {
        loop {
            match self.signals.read_signal() {
                Ok(Some(info)) => match Signal::try_from(info.ssi_signo as i32) {
                    Ok(Signal::SIGCHLD) => self.reap(),
                    Ok(signal) => {
                        info!(%signal, "Shutting down");
                        return Ok(true);
                    }
                    Err(_) => {}
                },
                Ok(None) => return Ok(false),
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(ServerError::Signals(errno)),
            }
        }
    }

    fn reap(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return,
                Ok(status) => {
                    let Some(pid) = status.pid() else { continue };
                    debug!(%pid, ?status, "Reaped worker");
                    if let Some(slot) = self.sessions.position(|session| session.pid == pid) {
                        self.forget_session(slot);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    warn!(%errno, "Failed to reap workers");
                    return;
                }
            }
        }
    }

    /// Run operator commands. Returns whether the operator asked to stop.
    fn handle_admin(&mut self) -> bool {
        loop {
            let Some(console) = self.console.as_mut() else {
                return false;
            };
            let line = match console.try_line() {
                Ok(Some(line)) => line,
                Ok(None) => return false,
                Err(e) => {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        info!("Admin console closed");
                    } else {
                        warn!(error = %e, "Admin console failed");
                    }
                    let _ = self
                        .poll
                        .registry()
                        .deregister(&mut SourceFd(&console.as_raw_fd()));
                    self.console = None;
                    return false;
                }
            };
            match AdminCommand::parse(&line) {
                Ok(None) => {}
                Ok(Some(AdminCommand::Exit)) => {
                    info!("Shutdown requested by operator");
                    return true;
                }
                Ok(Some(AdminCommand::CreateUser { name, permissions })) => {
                    let created = self.users.create_user(
                        name,
                        permissions,
                        &self.config.root,
                        &self.privileges,
                    );
                    match created {
                        Ok(()) => answer("user created"),
                        Err(e) => {
                            warn!(user = name, error = %e, "Failed to create user");
                            answer(&format!("err-{e}"));
                        }
                    }
                }
                Err(usage) => answer(&format!("err-{usage}")),
            }
        }
    }

    /// Stop every worker and wait for them.
    fn shutdown(&mut self) {
        for (slot, session) in self.sessions.drain() {
            debug!(slot, pid = %session.pid, "Stopping worker");
            let _ = kill(session.pid, Signal::SIGKILL);
            if let Err(errno) = waitpid(session.pid, None) {
                debug!(pid = %session.pid, %errno, "Worker already reaped");
            }
        }
        info!("Server stopped");
    }
}

fn answer(text: &str) {
    let _ = writeln!(io::stdout().lock(), "{text}");
}
