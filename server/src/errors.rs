use std::io;
use std::path::PathBuf;

use ipc::ChannelError;
use locks::LockError;
use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind listener on {addr}: {err}")]
    Bind {
        addr: std::net::SocketAddrV4,
        err: io::Error,
    },
    #[error("Error encountered when creating poll: {0}")]
    PollCreation(io::Error),
    #[error("Failed to register file descriptor with poll: {0}")]
    PollRegistration(io::Error),
    #[error("Error polling event sources: {0}")]
    Poll(io::Error),
    #[error("Failed to set up signal handling: {0}")]
    Signals(Errno),
    #[error("Failed to set up admin console: {0}")]
    Console(io::Error),
    #[error("Lost connection to client: {0}")]
    Client(io::Error),
    #[error("Session channel failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("Lock table failure: {0}")]
    Locks(#[from] LockError),
    #[error("Privilege change failed: {0}")]
    Privilege(#[from] PrivilegeError),
    #[error("User registry failure: {0}")]
    Users(#[from] UserError),
    #[error("Login aborted: {0}")]
    Login(#[from] LoginError),
}

#[derive(Error, Debug)]
pub enum PrivilegeError {
    #[error("Environment variable {name} holds `{value}`, which is not a numeric id")]
    InvalidVariable { name: &'static str, value: String },
    #[error("{op} failed: {err}")]
    Switch { op: &'static str, err: Errno },
}

/// Failures of `login`. The fatal ones happen after the process started
/// changing identity and always end the session.
#[derive(Error, Debug)]
pub enum LoginError {
    #[error("User `{0}` is not registered")]
    Unregistered(String),
    #[error("User `{0}` has no system account")]
    NoAccount(String),
    #[error("Failed to look up account: {0}")]
    Lookup(Errno),
    #[error("User registry unavailable: {0}")]
    Users(#[from] UserError),
    #[error("Failed to regain root: {0}")]
    Privilege(#[from] PrivilegeError),
    #[error("Identity switch failed at {step}: {err}")]
    Transition { step: &'static str, err: Errno },
}

impl LoginError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Privilege(_) | Self::Transition { .. })
    }
}

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Path is empty")]
    Empty,
    #[error("Path `{0}` must be relative")]
    Absolute(String),
    #[error("Path `{0}` leaves the permitted tree")]
    Escapes(String),
    #[error("Path is not valid UTF-8")]
    NotUtf8,
    #[error("Path is too long to transfer")]
    TooLong,
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Path `{0}` is outside the server root")]
    OutsideRoot(PathBuf),
    #[error("Source and destination are the same file")]
    SamePath,
    #[error("Receiver `{0}` has no system account")]
    NoAccount(String),
    #[error("Failed to look up account: {0}")]
    Lookup(Errno),
    #[error("Lock failure: {0}")]
    Lock(#[from] LockError),
    #[error("`{0}` is locked by a session")]
    InUse(PathBuf),
    #[error("Privilege change failed: {0}")]
    Privilege(#[from] PrivilegeError),
    #[error("Failed to copy `{path}`: {err}")]
    Copy { path: PathBuf, err: io::Error },
    #[error("Failed to hand `{path}` to its receiver: {err}")]
    Chown { path: PathBuf, err: Errno },
}

#[derive(Error, Debug)]
pub enum UserError {
    #[error("Failed to read user registry: {0}")]
    Read(io::Error),
    #[error("Failed to parse user registry: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize user registry: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Failed to write user registry: {0}")]
    Write(io::Error),
    #[error("The registry already holds the maximum of {0} users")]
    Full(usize),
    #[error("User `{0}` already exists")]
    Exists(String),
    #[error("`{0}` is not a valid user name")]
    InvalidName(String),
    #[error("`{0}` is not a valid permission string")]
    InvalidPermissions(String),
    #[error("Failed to run {tool}: {err}")]
    Spawn { tool: &'static str, err: io::Error },
    #[error("{tool} exited with {status}")]
    Tool {
        tool: &'static str,
        status: std::process::ExitStatus,
    },
    #[error("User `{0}` has no system account")]
    NoAccount(String),
    #[error("Failed to look up account: {0}")]
    Lookup(Errno),
    #[error("Failed to create home directory: {0}")]
    Home(io::Error),
    #[error("Failed to hand over home directory: {0}")]
    Chown(Errno),
    #[error("Privilege change failed: {0}")]
    Privilege(#[from] PrivilegeError),
}

/// Rejection of a client command. The display text is what the client sees
/// after the `err-` prefix.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Invalid path")]
    Path(#[from] PathError),
    #[error("permission not valid")]
    InvalidPermissions,
    #[error("Invalid request id")]
    InvalidId,
    #[error("Invalid user")]
    InvalidUser,
    #[error("Cannot transfer a file to yourself")]
    SelfTransfer,
    #[error("Request rejected by destination user")]
    Rejected,
    #[error("Server busy (too many locks)")]
    Busy,
    #[error("Unknown command")]
    Unknown,
    #[error("Line too long")]
    LineTooLong,
    #[error("You must login first")]
    NotLoggedIn,
    #[error("Already logged in")]
    AlreadyLoggedIn,
    #[error("Login failed")]
    Login(#[source] LoginError),
    #[error("{what}")]
    Io {
        what: &'static str,
        #[source]
        err: io::Error,
    },
    #[error("Internal lock failure")]
    Lock(#[source] LockError),
    #[error("User registry unavailable")]
    Users(#[from] UserError),
    #[error("Lost connection to client")]
    Client(#[source] io::Error),
    #[error("Lost connection to server")]
    Channel(#[from] ChannelError),
}

impl CommandError {
    pub(crate) fn io(what: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |err| Self::Io { what, err }
    }

    /// Errors after which the session cannot go on.
    pub fn into_fatal(self) -> Result<Self, ServerError> {
        match self {
            Self::Client(err) => Err(ServerError::Client(err)),
            Self::Channel(err) => Err(ServerError::Channel(err)),
            other => Ok(other),
        }
    }
}

impl From<LockError> for CommandError {
    fn from(err: LockError) -> Self {
        if err.is_busy() {
            Self::Busy
        } else {
            Self::Lock(err)
        }
    }
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("Failed to open transfer log: {0}")]
    Open(io::Error),
    #[error("Failed to read transfer log: {0}")]
    Read(io::Error),
    #[error("Corrupt transfer log record: {0}")]
    Decode(bincode::error::DecodeError),
    #[error("Failed to print transfer log: {0}")]
    Write(io::Error),
}
