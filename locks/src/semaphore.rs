//! Process-shared POSIX semaphore primitives. Every function takes a raw
//! pointer into the shared mapping because other processes may touch the same
//! semaphore concurrently.
use std::io;

use libc::sem_t;

use crate::errors::LockError;

fn os_error(op: &'static str) -> LockError {
    LockError::Semaphore {
        op,
        err: io::Error::last_os_error(),
    }
}

/// # Safety
/// `sem` must point into the shared mapping and no process may be blocked on it.
pub(crate) unsafe fn init(sem: *mut sem_t, value: u32) -> Result<(), LockError> {
    if unsafe { libc::sem_init(sem, 1, value) } == -1 {
        Err(os_error("sem_init"))
    } else {
        Ok(())
    }
}

/// # Safety
/// Same as [`init`]. The semaphore must be reinitialized before its next use.
pub(crate) unsafe fn destroy(sem: *mut sem_t) {
    unsafe { libc::sem_destroy(sem) };
}

/// # Safety
/// `sem` must point to an initialized semaphore in the shared mapping.
pub(crate) unsafe fn wait(sem: *mut sem_t) -> Result<(), LockError> {
    loop {
        if unsafe { libc::sem_wait(sem) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(LockError::Semaphore {
                op: "sem_wait",
                err,
            });
        }
    }
}

/// Returns `Ok(false)` when the semaphore is already at zero.
///
/// # Safety
/// `sem` must point to an initialized semaphore in the shared mapping.
pub(crate) unsafe fn try_wait(sem: *mut sem_t) -> Result<bool, LockError> {
    loop {
        if unsafe { libc::sem_trywait(sem) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => return Ok(false),
            Some(libc::EINTR) => continue,
            _ => {
                return Err(LockError::Semaphore {
                    op: "sem_trywait",
                    err,
                });
            }
        }
    }
}

/// # Safety
/// `sem` must point to an initialized semaphore in the shared mapping.
pub(crate) unsafe fn post(sem: *mut sem_t) -> Result<(), LockError> {
    if unsafe { libc::sem_post(sem) } == -1 {
        Err(os_error("sem_post"))
    } else {
        Ok(())
    }
}

/// # Safety
/// `sem` must point to an initialized semaphore in the shared mapping.
pub(crate) unsafe fn value(sem: *mut sem_t) -> Result<i32, LockError> {
    let mut value = 0;
    if unsafe { libc::sem_getvalue(sem, &mut value) } == -1 {
        Err(os_error("sem_getvalue"))
    } else {
        Ok(value)
    }
}
