use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, RawFd};

use ipc::PATH_LENGTH;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

const READ_CHUNK: usize = 4096;

/// Longest line a client may send, commands and file data alike.
pub const MAX_LINE: usize = 4 * PATH_LENGTH;

/// Input held back while nobody is reading lines.
const MAX_BUFFERED: usize = 16 * MAX_LINE;

/// Line-oriented view of a client connection. The socket is non-blocking so
/// it can share an event loop with the supervisor pipe; the blocking helpers
/// wait with `poll` instead.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    pending: Vec<u8>,
    /// Skipping the rest of a line that was already refused.
    discarding: bool,
}

fn too_long() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "line too long")
}

fn wait(stream: &TcpStream, flags: PollFlags) -> io::Result<()> {
    let mut fds = [PollFd::new(stream.as_fd(), flags)];
    match poll(&mut fds, PollTimeout::NONE) {
        Ok(_) | Err(Errno::EINTR) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl Connection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            pending: Vec::with_capacity(READ_CHUNK),
            discarding: false,
        })
    }

    /// Lines over [`MAX_LINE`] are refused once with `InvalidData` and
    /// their remainder is dropped as it arrives.
    fn take_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let Some(end) = self.pending.iter().position(|&b| b == b'\n') else {
                if self.discarding {
                    self.pending.clear();
                } else if self.pending.len() > MAX_LINE {
                    self.pending.clear();
                    self.discarding = true;
                    return Err(too_long());
                }
                return Ok(None);
            };
            let mut line = self.pending.drain(..=end).collect::<Vec<_>>();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > MAX_LINE {
                return Err(too_long());
            }
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
    }

    /// Next complete line if one is available without blocking. The client
    /// hanging up is reported as `UnexpectedEof`, an overlong line as
    /// `InvalidData`.
    pub fn try_line(&mut self) -> io::Result<Option<String>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(Some(line));
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Read what the client has sent so far without splitting it into
    /// lines. Returns whether the client hung up.
    pub fn buffer_input(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.pending.len() < MAX_BUFFERED {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Block until the client sends a whole line.
    pub fn line(&mut self) -> io::Result<String> {
        loop {
            if let Some(line) = self.try_line()? {
                return Ok(line);
            }
            wait(&self.stream, PollFlags::POLLIN)?;
        }
    }

    pub fn send_bytes(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            match self.stream.write(bytes) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait(&self.stream, PollFlags::POLLOUT)?
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Send `text` as one line.
    pub fn send_str(&mut self, text: &str) -> io::Result<()> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.send_bytes(&line)
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
