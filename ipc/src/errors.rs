use std::io;

use bincode::error::{DecodeError, EncodeError};
use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to create pipe: {0}")]
    PipeCreation(Errno),
    #[error("Peer closed the channel")]
    Closed,
    #[error("Channel closed after {received} of {expected} bytes of a message")]
    Truncated { received: usize, expected: usize },
    #[error("Malformed message: {0}")]
    Decode(DecodeError),
    #[error("Field `{field}` is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
    #[error("Field `{field}` is {len} bytes but at most {max} fit")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("Failed to encode message: {0}")]
    Encode(EncodeError),
    #[error("Peer is not draining its channel")]
    Full,
    #[error("Failed to write message: {0}")]
    Write(io::Error),
    #[error("Failed to read message: {0}")]
    Read(io::Error),
    #[error("Failed waiting on channel: {0}")]
    Poll(Errno),
}

impl ChannelError {
    /// Whether the error means the other end can no longer be talked to. The
    /// supervisor treats these as the death of the session.
    pub fn is_peer_gone(&self) -> bool {
        match self {
            Self::Closed
            | Self::Truncated { .. }
            | Self::Decode(_)
            | Self::InvalidUtf8 { .. }
            | Self::Read(_) => true,
            Self::Write(err) => err.kind() == io::ErrorKind::BrokenPipe,
            _ => false,
        }
    }
}
