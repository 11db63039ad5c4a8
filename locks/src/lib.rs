//! Named reader-writer locks shared by every process forked from the
//! supervisor.
//!
//! The table lives in one anonymous `MAP_SHARED` mapping created before any
//! worker is forked, so each slot (and the semaphores inside it) is visible to
//! all sessions at once. Callers map a host-absolute path to a slot with
//! [`LockTable::acquire`], take a reader or writer lock on the returned handle,
//! and let the guards and the handle go out of scope in that order.
extern crate libc;

pub mod errors;
mod semaphore;
mod shared;
pub mod table;

pub use errors::*;
pub use table::*;
