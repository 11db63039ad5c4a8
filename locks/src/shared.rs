//! Anonymous shared mappings that survive `fork()`.
use std::io;
use std::mem::size_of;
use std::ptr::{self, NonNull};

/// Owning handle to zeroed memory for exactly one `T`, mapped
/// `MAP_SHARED | MAP_ANONYMOUS` so parent and forked children observe the same
/// bytes. Dropping the handle unmaps only the calling process' view.
pub(crate) struct SharedRegion<T> {
    ptr: NonNull<T>,
}

impl<T> SharedRegion<T> {
    /// `T` must be valid when every byte is zero.
    pub(crate) fn zeroed() -> io::Result<Self> {
        // Safety: an anonymous mapping needs no descriptor and the kernel
        // hands back zero-filled pages.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size_of::<T>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(raw.cast::<T>())
            .map(|ptr| Self { ptr })
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))
    }

    pub(crate) fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

impl<T> Drop for SharedRegion<T> {
    fn drop(&mut self) {
        // Safety: the mapping was created in `zeroed` with this exact size.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), size_of::<T>());
        }
    }
}
