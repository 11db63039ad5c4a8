//! Whole-record transport over unidirectional pipes.
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd::pipe2;
use tracing::trace;

use crate::errors::ChannelError;
use crate::message::{MESSAGE_SIZE, Message};

const READ_CHUNK: usize = 4 * MESSAGE_SIZE;

/// Write end of a pipe. Writes block until the whole record is in the pipe;
/// records are smaller than `PIPE_BUF`, so they never interleave.
#[derive(Debug)]
pub struct Sender {
    file: File,
}

/// Non-blocking read end of a pipe that reassembles whole records.
#[derive(Debug)]
pub struct Receiver {
    file: File,
    pending: Vec<u8>,
}

/// One process' side of a duplex link made of two pipes.
#[derive(Debug)]
pub struct Endpoint {
    pub tx: Sender,
    pub rx: Receiver,
}

/// Create a pipe. Both ends are close-on-exec so they never leak into
/// programs the supervisor runs.
pub fn pipe() -> Result<(Sender, Receiver), ChannelError> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(ChannelError::PipeCreation)?;
    fcntl(read.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map_err(ChannelError::PipeCreation)?;
    Ok((Sender::from(write), Receiver::from(read)))
}

/// Create the two pipes joining a supervisor and one worker. The first
/// endpoint belongs to the supervisor, the second to the worker.
pub fn duplex() -> Result<(Endpoint, Endpoint), ChannelError> {
    let (to_worker, from_supervisor) = pipe()?;
    let (to_supervisor, from_worker) = pipe()?;
    Ok((
        Endpoint {
            tx: to_worker,
            rx: from_worker,
        },
        Endpoint {
            tx: to_supervisor,
            rx: from_supervisor,
        },
    ))
}

impl From<OwnedFd> for Sender {
    fn from(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }
}

impl From<OwnedFd> for Receiver {
    fn from(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
            pending: Vec::with_capacity(READ_CHUNK),
        }
    }
}

impl Sender {
    /// Make `send` fail with [`ChannelError::Full`] instead of waiting for
    /// the reader. A record is still written whole or not at all.
    pub fn set_nonblocking(&self) -> Result<(), ChannelError> {
        fcntl(self.file.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map(drop)
            .map_err(|e| ChannelError::Write(e.into()))
    }

    pub fn send(&mut self, msg: &Message) -> Result<(), ChannelError> {
        let buf = msg.encode()?;
        trace!(status = %msg.status, id = msg.request.id, "send");
        self.file.write_all(&buf).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock => ChannelError::Full,
            _ => ChannelError::Write(e),
        })
    }
}

impl Receiver {
    fn take_frame(&mut self) -> Result<Option<Message>, ChannelError> {
        if self.pending.len() < MESSAGE_SIZE {
            return Ok(None);
        }
        let mut frame = [0u8; MESSAGE_SIZE];
        frame.copy_from_slice(&self.pending[..MESSAGE_SIZE]);
        self.pending.drain(..MESSAGE_SIZE);
        Message::decode(&frame).map(Some)
    }

    /// Whether a complete record is already buffered.
    pub fn has_buffered(&self) -> bool {
        self.pending.len() >= MESSAGE_SIZE
    }

    /// Return the next record if one can be assembled without blocking.
    ///
    /// End of stream is an error: [`ChannelError::Closed`] at a record
    /// boundary, [`ChannelError::Truncated`] in the middle of one. Buffered
    /// records are always handed out before the end of stream is reported.
    pub fn try_recv(&mut self) -> Result<Option<Message>, ChannelError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(msg) = self.take_frame()? {
                trace!(status = %msg.status, id = msg.request.id, "recv");
                return Ok(Some(msg));
            }
            match self.file.read(&mut chunk) {
                Ok(0) if self.pending.is_empty() => return Err(ChannelError::Closed),
                Ok(0) => {
                    return Err(ChannelError::Truncated {
                        received: self.pending.len(),
                        expected: MESSAGE_SIZE,
                    });
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChannelError::Read(e)),
            }
        }
    }

    /// Block until a whole record arrives. There is no timeout.
    pub fn recv(&mut self) -> Result<Message, ChannelError> {
        loop {
            if let Some(msg) = self.try_recv()? {
                return Ok(msg);
            }
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(ChannelError::Poll(e)),
            }
        }
    }
}

impl AsRawFd for Receiver {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
