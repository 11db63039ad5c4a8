//! Operator commands read from the supervisor's standard input.
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};

use nix::fcntl::{FcntlArg, OFlag, fcntl};

const READ_CHUNK: usize = 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum AdminCommand<'a> {
    Exit,
    CreateUser { name: &'a str, permissions: &'a str },
}

impl<'a> AdminCommand<'a> {
    pub fn parse(line: &'a str) -> Result<Option<Self>, &'static str> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => Ok(None),
            ["exit"] => Ok(Some(Self::Exit)),
            ["create_user", name, permissions] => Ok(Some(Self::CreateUser { name, permissions })),
            ["create_user", ..] => Err("Usage: create_user <username> <permissions>"),
            _ => Err("Unknown command"),
        }
    }
}

/// Standard input switched to non-blocking mode and split into lines.
#[derive(Debug)]
pub struct Console<R> {
    input: R,
    pending: Vec<u8>,
}

impl Console<io::Stdin> {
    pub fn stdin() -> io::Result<Self> {
        let input = io::stdin();
        let fd = input.as_raw_fd();
        let flags = fcntl(fd, FcntlArg::F_GETFL)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags))?;
        Ok(Self::new(input))
    }
}

impl<R: Read> Console<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            pending: Vec::new(),
        }
    }

    /// Next complete line without blocking. End of input is reported as
    /// `UnexpectedEof` once every buffered line has been returned.
    pub fn try_line(&mut self) -> io::Result<Option<String>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=end).collect();
                return Ok(Some(String::from_utf8_lossy(&line[..end]).trim().to_string()));
            }
            match self.input.read(&mut chunk) {
                Ok(0) if self.pending.is_empty() => return Err(io::ErrorKind::UnexpectedEof.into()),
                // A last line without its newline still counts.
                Ok(0) => self.pending.push(b'\n'),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: AsRawFd> AsRawFd for Console<R> {
    fn as_raw_fd(&self) -> RawFd {
        self.input.as_raw_fd()
    }
}
