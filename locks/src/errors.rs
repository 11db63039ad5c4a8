use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Every lock slot is in use (server busy)")]
    Busy,
    #[error("Path of {len} bytes exceeds the lock key limit of {max} bytes")]
    PathTooLong { len: usize, max: usize },
    #[error("Failed to map shared lock table: {0}")]
    SharedMemory(io::Error),
    #[error("Semaphore operation `{op}` failed: {err}")]
    Semaphore { op: &'static str, err: io::Error },
}

impl LockError {
    /// Whether the caller should report a busy server rather than an internal
    /// failure.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}
