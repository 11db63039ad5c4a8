//! Fixed-capacity table of named reader-writer locks.
//!
//! Each slot pairs two binary semaphores with a reader count: `mutex` guards
//! `readers_count`, and `write_gate` is held while a writer owns the lock or
//! while any reader does. The discipline prefers readers; a steady stream of
//! readers can starve a waiting writer.
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::addr_of_mut;

use libc::sem_t;
use tracing::{debug, error, warn};

use crate::errors::LockError;
use crate::semaphore;
use crate::shared::SharedRegion;

/// Number of distinct paths that may be locked at the same time.
pub const MAX_LOCKS: usize = 100;
/// Longest path key a slot can hold, terminator included.
pub const MAX_PATH: usize = libc::PATH_MAX as usize;

#[repr(C)]
struct LockSlot {
    path: [u8; MAX_PATH],
    readers_count: i32,
    usage_count: i32,
    mutex: sem_t,
    write_gate: sem_t,
}

#[repr(C)]
struct SharedState {
    slots: [LockSlot; MAX_LOCKS],
    global: sem_t,
}

/// Owning handle to the shared lock table.
///
/// Create it once in the supervisor before forking. Children inherit the
/// mapping together with this value, so no process ever looks the table up
/// through global state.
pub struct LockTable {
    region: SharedRegion<SharedState>,
}

// Safety: every field of the shared state is only touched under the global
// semaphore or the slot semaphores, which synchronize across threads as well
// as processes.
unsafe impl Send for LockTable {}
unsafe impl Sync for LockTable {}

/// Reference-counted claim on one lock slot. Dropping the handle releases the
/// claim, and the slot returns to the free pool once the last claim goes.
#[derive(Debug)]
pub struct LockHandle<'a> {
    table: &'a LockTable,
    index: usize,
}

/// Shared access to the path behind a [`LockHandle`].
#[derive(Debug)]
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    handle: &'a LockHandle<'a>,
}

/// Exclusive access to the path behind a [`LockHandle`].
#[derive(Debug)]
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    handle: &'a LockHandle<'a>,
}

struct GlobalGuard<'a> {
    table: &'a LockTable,
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("capacity", &MAX_LOCKS)
            .finish_non_exhaustive()
    }
}

fn encode_key(path: &Path) -> Result<&[u8], LockError> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= MAX_PATH {
        Err(LockError::PathTooLong {
            len: bytes.len(),
            max: MAX_PATH - 1,
        })
    } else {
        Ok(bytes)
    }
}

fn stored_key(path: &[u8; MAX_PATH]) -> &[u8] {
    let len = path.iter().position(|&b| b == 0).unwrap_or(MAX_PATH);
    &path[..len]
}

impl LockTable {
    /// Map the table and initialize every semaphore to its unlocked state.
    pub fn new() -> Result<Self, LockError> {
        let region = SharedRegion::<SharedState>::zeroed().map_err(LockError::SharedMemory)?;
        let table = Self { region };
        let state = table.state();
        // Safety: the mapping is fresh and private to this process until the
        // first fork.
        unsafe {
            semaphore::init(addr_of_mut!((*state).global), 1)?;
            for index in 0..MAX_LOCKS {
                let slot = table.slot(index);
                semaphore::init(addr_of_mut!((*slot).mutex), 1)?;
                semaphore::init(addr_of_mut!((*slot).write_gate), 1)?;
            }
        }
        debug!(slots = MAX_LOCKS, "Shared lock table initialized");
        Ok(table)
    }

    fn state(&self) -> *mut SharedState {
        self.region.as_ptr()
    }

    fn slot(&self, index: usize) -> *mut LockSlot {
        debug_assert!(index < MAX_LOCKS);
        // Safety: index is in bounds of the fixed array.
        unsafe { addr_of_mut!((*self.state()).slots[index]) }
    }

    fn lock_global(&self) -> Result<GlobalGuard<'_>, LockError> {
        // Safety: initialized in `new`.
        unsafe { semaphore::wait(addr_of_mut!((*self.state()).global))? };
        Ok(GlobalGuard { table: self })
    }

    /// Claim the slot for `path`, sharing it with any other holder of the
    /// same path or taking a free one. Never blocks on a full table: it fails
    /// with [`LockError::Busy`] instead.
    pub fn acquire(&self, path: impl AsRef<Path>) -> Result<LockHandle<'_>, LockError> {
        let key = encode_key(path.as_ref())?;
        let _global = self.lock_global()?;

        // Safety: slot paths and usage counts only change under the global
        // semaphore, which we hold.
        unsafe {
            for index in 0..MAX_LOCKS {
                let slot = self.slot(index);
                if (*slot).usage_count > 0 && stored_key(&(*slot).path) == key {
                    (*slot).usage_count += 1;
                    return Ok(LockHandle { table: self, index });
                }
            }

            for index in 0..MAX_LOCKS {
                let slot = self.slot(index);
                if (*slot).usage_count != 0 {
                    continue;
                }
                let path = &mut (*slot).path;
                path.fill(0);
                path[..key.len()].copy_from_slice(key);
                (*slot).readers_count = 0;
                semaphore::destroy(addr_of_mut!((*slot).mutex));
                semaphore::destroy(addr_of_mut!((*slot).write_gate));
                semaphore::init(addr_of_mut!((*slot).mutex), 1)?;
                semaphore::init(addr_of_mut!((*slot).write_gate), 1)?;
                (*slot).usage_count = 1;
                return Ok(LockHandle { table: self, index });
            }
        }

        warn!(path = %path.as_ref().display(), "No free lock slots");
        Err(LockError::Busy)
    }

    fn release_slot(&self, index: usize) -> Result<(), LockError> {
        let _global = self.lock_global()?;
        let slot = self.slot(index);
        // Safety: guarded by the global semaphore.
        unsafe {
            if (*slot).usage_count > 0 {
                (*slot).usage_count -= 1;
                if (*slot).usage_count == 0 {
                    (*slot).path.fill(0);
                }
            }
        }
        Ok(())
    }

    /// Number of outstanding handles for `path`; zero when it owns no slot.
    pub fn holders(&self, path: impl AsRef<Path>) -> Result<u32, LockError> {
        let key = encode_key(path.as_ref())?;
        let _global = self.lock_global()?;
        // Safety: guarded by the global semaphore.
        let count = unsafe {
            (0..MAX_LOCKS)
                .map(|index| self.slot(index))
                .find(|&slot| (*slot).usage_count > 0 && stored_key(&(*slot).path) == key)
                .map_or(0, |slot| (*slot).usage_count)
        };
        Ok(count as u32)
    }

    /// Number of slots currently claimed by some path.
    pub fn slots_in_use(&self) -> Result<usize, LockError> {
        let _global = self.lock_global()?;
        // Safety: guarded by the global semaphore.
        let count = unsafe {
            (0..MAX_LOCKS)
                .filter(|&index| (*self.slot(index)).usage_count > 0)
                .count()
        };
        Ok(count)
    }
}

impl Drop for GlobalGuard<'_> {
    fn drop(&mut self) {
        // Safety: we hold the semaphore we are posting.
        let posted = unsafe { semaphore::post(addr_of_mut!((*self.table.state()).global)) };
        if let Err(e) = posted {
            error!("Failed to release lock table: {e}");
        }
    }
}

impl<'a> LockHandle<'a> {
    fn mutex(&self) -> *mut sem_t {
        // Safety: index validated at construction.
        unsafe { addr_of_mut!((*self.table.slot(self.index)).mutex) }
    }

    fn write_gate(&self) -> *mut sem_t {
        // Safety: index validated at construction.
        unsafe { addr_of_mut!((*self.table.slot(self.index)).write_gate) }
    }

    fn readers_count(&self) -> *mut i32 {
        // Safety: index validated at construction.
        unsafe { addr_of_mut!((*self.table.slot(self.index)).readers_count) }
    }

    /// Index of the slot this handle refers to.
    pub fn slot(&self) -> usize {
        self.index
    }

    /// True while a writer or at least one reader holds the lock.
    pub fn is_contended(&self) -> Result<bool, LockError> {
        // Safety: the slot semaphores stay initialized while we hold a claim.
        unsafe { semaphore::value(self.write_gate()).map(|value| value == 0) }
    }

    /// Take a shared lock. The first reader closes the write gate.
    pub fn read_lock(&self) -> Result<ReadGuard<'_>, LockError> {
        // Safety: `mutex` serializes every access to `readers_count`.
        unsafe {
            semaphore::wait(self.mutex())?;
            *self.readers_count() += 1;
            let first = *self.readers_count() == 1;
            let gated = if first {
                semaphore::wait(self.write_gate())
            } else {
                Ok(())
            };
            if let Err(e) = gated {
                *self.readers_count() -= 1;
                semaphore::post(self.mutex())?;
                return Err(e);
            }
            semaphore::post(self.mutex())?;
        }
        Ok(ReadGuard { handle: self })
    }

    /// Take a shared lock only if that needs no waiting: some reader already
    /// holds it, or nobody holds it at all.
    pub fn try_read_lock(&self) -> Result<Option<ReadGuard<'_>>, LockError> {
        // Safety: `mutex` serializes every access to `readers_count`.
        unsafe {
            semaphore::wait(self.mutex())?;
            let entered = if *self.readers_count() > 0 {
                Ok(true)
            } else {
                semaphore::try_wait(self.write_gate())
            };
            if let Ok(true) = entered {
                *self.readers_count() += 1;
            }
            semaphore::post(self.mutex())?;
            if entered? {
                Ok(Some(ReadGuard { handle: self }))
            } else {
                Ok(None)
            }
        }
    }

    fn read_unlock(&self) -> Result<(), LockError> {
        // Safety: `mutex` serializes every access to `readers_count`.
        unsafe {
            semaphore::wait(self.mutex())?;
            *self.readers_count() -= 1;
            let last = *self.readers_count() == 0;
            let opened = if last {
                semaphore::post(self.write_gate())
            } else {
                Ok(())
            };
            semaphore::post(self.mutex())?;
            opened
        }
    }

    /// Take an exclusive lock, waiting for every reader and writer to leave.
    pub fn write_lock(&self) -> Result<WriteGuard<'_>, LockError> {
        // Safety: the slot semaphores stay initialized while we hold a claim.
        unsafe { semaphore::wait(self.write_gate())? };
        Ok(WriteGuard { handle: self })
    }

    /// Take an exclusive lock only if nobody holds the path right now.
    pub fn try_write_lock(&self) -> Result<Option<WriteGuard<'_>>, LockError> {
        // Safety: the slot semaphores stay initialized while we hold a claim.
        let taken = unsafe { semaphore::try_wait(self.write_gate())? };
        if taken {
            Ok(Some(WriteGuard { handle: self }))
        } else {
            Ok(None)
        }
    }

    fn write_unlock(&self) -> Result<(), LockError> {
        // Safety: we hold the gate we are posting.
        unsafe { semaphore::post(self.write_gate()) }
    }

    /// Give the claim back explicitly. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Drop for LockHandle<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.table.release_slot(self.index) {
            error!(slot = self.index, "Failed to release lock handle: {e}");
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.read_unlock() {
            error!(slot = self.handle.index, "Failed to release read lock: {e}");
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.write_unlock() {
            error!(slot = self.handle.index, "Failed to release write lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_path_shares_slot() {
        let table = LockTable::new().unwrap();
        let first = table.acquire("/srv/alice/a.txt").unwrap();
        let second = table.acquire("/srv/alice/a.txt").unwrap();
        assert_eq!(first.slot(), second.slot());
        assert_eq!(table.holders("/srv/alice/a.txt").unwrap(), 2);
        assert_eq!(table.slots_in_use().unwrap(), 1);
    }

    #[test]
    fn releasing_all_handles_frees_slot_for_other_paths() {
        let table = LockTable::new().unwrap();
        let first = table.acquire("/srv/alice/a.txt").unwrap();
        let second = table.acquire("/srv/alice/a.txt").unwrap();
        let slot = first.slot();

        first.release();
        assert_eq!(table.holders("/srv/alice/a.txt").unwrap(), 1);
        drop(second);
        assert_eq!(table.holders("/srv/alice/a.txt").unwrap(), 0);
        assert_eq!(table.slots_in_use().unwrap(), 0);

        let other = table.acquire("/srv/bob/b.txt").unwrap();
        assert_eq!(other.slot(), slot);
        assert_eq!(table.holders("/srv/bob/b.txt").unwrap(), 1);
    }

    #[test]
    fn paths_are_compared_exactly() {
        let table = LockTable::new().unwrap();
        let short = table.acquire("/srv/a").unwrap();
        let long = table.acquire("/srv/ab").unwrap();
        assert_ne!(short.slot(), long.slot());
    }

    #[test]
    fn exhausted_table_reports_busy() {
        let table = LockTable::new().unwrap();
        let mut handles = (0..MAX_LOCKS)
            .map(|i| table.acquire(format!("/srv/file-{i}")).unwrap())
            .collect::<Vec<_>>();

        let err = table.acquire("/srv/one-too-many").unwrap_err();
        assert!(err.is_busy());

        // An already-held path still succeeds.
        let shared = table.acquire("/srv/file-0").unwrap();
        drop(shared);

        handles.pop();
        assert!(table.acquire("/srv/one-too-many").is_ok());
    }

    #[test]
    fn overlong_path_is_rejected() {
        let table = LockTable::new().unwrap();
        let path = format!("/{}", "x".repeat(MAX_PATH));
        assert!(matches!(
            table.acquire(path),
            Err(LockError::PathTooLong { .. })
        ));
    }

    #[test]
    fn readers_do_not_block_readers() {
        let table = LockTable::new().unwrap();
        let handle = table.acquire("/srv/shared").unwrap();
        let first = handle.read_lock().unwrap();
        let second = handle.read_lock().unwrap();
        assert!(handle.is_contended().unwrap());
        assert!(handle.try_write_lock().unwrap().is_none());

        drop(first);
        assert!(handle.try_write_lock().unwrap().is_none());
        drop(second);

        let writer = handle.try_write_lock().unwrap();
        assert!(writer.is_some());
    }

    #[test]
    fn try_read_lock_joins_readers_but_not_writers() {
        let table = LockTable::new().unwrap();
        let handle = table.acquire("/srv/shared").unwrap();
        let first = handle.try_read_lock().unwrap().unwrap();
        let second = handle.try_read_lock().unwrap();
        assert!(second.is_some());
        drop((first, second));

        let writer = handle.write_lock().unwrap();
        assert!(handle.try_read_lock().unwrap().is_none());
        drop(writer);
        assert!(!handle.is_contended().unwrap());
    }

    #[test]
    fn readers_in_separate_threads_proceed_together() {
        let table = LockTable::new().unwrap();
        let both_in = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    let handle = table.acquire("/srv/shared").unwrap();
                    let _guard = handle.read_lock().unwrap();
                    both_in.fetch_add(1, Ordering::SeqCst);
                    // Neither reader leaves until the other has entered.
                    while both_in.load(Ordering::SeqCst) < 2 {
                        thread::yield_now();
                    }
                });
            }
        });
        assert_eq!(table.slots_in_use().unwrap(), 0);
    }

    #[test]
    fn writer_blocks_reader_until_unlocked() {
        let table = LockTable::new().unwrap();
        let writer_done = AtomicBool::new(false);
        let handle = table.acquire("/srv/exclusive").unwrap();
        let guard = handle.write_lock().unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                let handle = table.acquire("/srv/exclusive").unwrap();
                let _read = handle.read_lock().unwrap();
                assert!(writer_done.load(Ordering::SeqCst));
            });
            thread::sleep(Duration::from_millis(50));
            writer_done.store(true, Ordering::SeqCst);
            drop(guard);
        });
    }

    #[test]
    fn writers_exclude_everyone() {
        let table = LockTable::new().unwrap();
        let writers = AtomicUsize::new(0);
        let readers = AtomicUsize::new(0);
        thread::scope(|s| {
            for worker in 0..8 {
                let (table, writers, readers) = (&table, &writers, &readers);
                s.spawn(move || {
                    let handle = table.acquire("/srv/contended").unwrap();
                    for round in 0..200 {
                        if (worker + round) % 3 == 0 {
                            let _w = handle.write_lock().unwrap();
                            assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(readers.load(Ordering::SeqCst), 0);
                            writers.fetch_sub(1, Ordering::SeqCst);
                        } else {
                            let _r = handle.read_lock().unwrap();
                            readers.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(writers.load(Ordering::SeqCst), 0);
                            readers.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        assert_eq!(table.holders("/srv/contended").unwrap(), 0);
    }
}
