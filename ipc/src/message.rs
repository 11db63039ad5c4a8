use std::fmt::Display;

use bincode::{Decode, Encode, config};

use crate::errors::ChannelError;

/// Widest username a record can carry, terminator included.
pub const USERNAME_LENGTH: usize = 256;
/// Widest path a record can carry, terminator included.
pub const PATH_LENGTH: usize = 1024;
/// Exact size of one encoded record: tag, id, sender, receiver, path.
pub const MESSAGE_SIZE: usize = 4 + 4 + 2 * USERNAME_LENGTH + PATH_LENGTH;

pub type RequestId = u32;

/// Record kind. The discriminants are the on-wire tag values.
#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Supervisor to receiver: someone offers you a file.
    TransferRequest,
    /// Receiver to supervisor: copy the offered file to `path`.
    Accept,
    /// Receiver to supervisor: decline the offer.
    Reject,
    /// Worker to supervisor: identity announcement.
    IAmUser,
    /// Sender to supervisor: offer a file to `receiver`.
    NewRequest,
    /// Supervisor to worker: the transfer completed.
    Handled,
    /// Supervisor to worker: announce your identity.
    WhoAreYou,
    /// Supervisor to worker: the transfer was declined.
    Rejected,
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::TransferRequest => "TRANSF_REQ",
            Status::Accept => "ACCEPT",
            Status::Reject => "REJECT",
            Status::IAmUser => "I_M_USER",
            Status::NewRequest => "NEW_REQ",
            Status::Handled => "HANDLED",
            Status::WhoAreYou => "WHO_ARE_YOU",
            Status::Rejected => "REJECTED",
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferRequest {
    /// Assigned by the supervisor; zero until then.
    pub id: RequestId,
    pub sender: String,
    pub receiver: String,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub status: Status,
    pub request: TransferRequest,
}

/// Wire image of a [`Message`]. Fixed-width integers and byte arrays keep
/// every record exactly [`MESSAGE_SIZE`] bytes long.
#[derive(Encode, Decode)]
struct Frame {
    status: Status,
    id: u32,
    sender: [u8; USERNAME_LENGTH],
    receiver: [u8; USERNAME_LENGTH],
    path: [u8; PATH_LENGTH],
}

fn wire() -> impl config::Config {
    config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn pack<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N], ChannelError> {
    let bytes = value.as_bytes();
    if bytes.len() >= N {
        return Err(ChannelError::FieldTooLong {
            field,
            len: bytes.len(),
            max: N - 1,
        });
    }
    let mut out = [0u8; N];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn unpack(field: &'static str, raw: &[u8]) -> Result<String, ChannelError> {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..len])
        .map(str::to_string)
        .map_err(|_| ChannelError::InvalidUtf8 { field })
}

impl Message {
    fn with(status: Status, request: TransferRequest) -> Self {
        Self { status, request }
    }

    pub fn new_request(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self::with(
            Status::NewRequest,
            TransferRequest {
                id: 0,
                sender: sender.into(),
                receiver: receiver.into(),
                path: path.into(),
            },
        )
    }

    /// `replier` is the accepting user, carried in the sender field.
    pub fn accept(id: RequestId, replier: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::with(
            Status::Accept,
            TransferRequest {
                id,
                sender: replier.into(),
                path: destination.into(),
                ..Default::default()
            },
        )
    }

    pub fn reject(id: RequestId, replier: impl Into<String>) -> Self {
        Self::with(
            Status::Reject,
            TransferRequest {
                id,
                sender: replier.into(),
                ..Default::default()
            },
        )
    }

    pub fn i_am_user(username: impl Into<String>) -> Self {
        Self::with(
            Status::IAmUser,
            TransferRequest {
                sender: username.into(),
                ..Default::default()
            },
        )
    }

    pub fn who_are_you() -> Self {
        Self::with(Status::WhoAreYou, TransferRequest::default())
    }

    pub fn offer(request: &TransferRequest) -> Self {
        Self::with(Status::TransferRequest, request.clone())
    }

    pub fn handled(id: RequestId) -> Self {
        Self::with(
            Status::Handled,
            TransferRequest {
                id,
                ..Default::default()
            },
        )
    }

    pub fn rejected(id: RequestId) -> Self {
        Self::with(
            Status::Rejected,
            TransferRequest {
                id,
                ..Default::default()
            },
        )
    }

    /// Encode into exactly one record. Fails if a string does not fit its
    /// fixed field.
    pub fn encode(&self) -> Result<[u8; MESSAGE_SIZE], ChannelError> {
        let frame = Frame {
            status: self.status,
            id: self.request.id,
            sender: pack("sender", &self.request.sender)?,
            receiver: pack("receiver", &self.request.receiver)?,
            path: pack("path", &self.request.path)?,
        };
        let mut buf = [0u8; MESSAGE_SIZE];
        let written =
            bincode::encode_into_slice(frame, &mut buf, wire()).map_err(ChannelError::Encode)?;
        debug_assert_eq!(written, MESSAGE_SIZE);
        Ok(buf)
    }

    pub fn decode(buf: &[u8; MESSAGE_SIZE]) -> Result<Self, ChannelError> {
        let (frame, _): (Frame, usize) =
            bincode::decode_from_slice(buf, wire()).map_err(ChannelError::Decode)?;
        Ok(Self {
            status: frame.status,
            request: TransferRequest {
                id: frame.id,
                sender: unpack("sender", &frame.sender)?,
                receiver: unpack("receiver", &frame.receiver)?,
                path: unpack("path", &frame.path)?,
            },
        })
    }
}
