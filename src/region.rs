use std::ptr::NonNull;

use crate::{
    error::PoolError,
    platform::{self, page_size},
};

/// One contiguous backing region obtained from the OS. A region is owned by
/// exactly one link of the pool chain, it is never resized in place and it is
/// only returned to the kernel when the pool is destroyed. The blocks of the
/// variable-size heap are written directly into this range, see
/// [`crate::heap::Heap`].
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Maps a new zero-filled region of exactly `len` bytes. `len` must
    /// already be a multiple of the page size, see [`page_align`].
    pub fn new(len: usize) -> Result<Self, PoolError> {
        debug_assert!(len > 0 && len % page_size() == 0);

        let Some(base) = (unsafe { platform::request_memory(len) }) else {
            return Err(PoolError::OutOfMemory);
        };

        Ok(Self { base, len })
    }

    /// First address of the region.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Size of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// First address past the region.
    #[inline]
    pub fn end(&self) -> usize {
        self.base.as_ptr() as usize + self.len
    }

    /// Whether `address` falls inside this region.
    #[inline]
    pub fn contains(&self, address: *const u8) -> bool {
        let addr = address as usize;
        addr >= self.base.as_ptr() as usize && addr < self.end()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { platform::return_memory(self.base, self.len) };
    }
}

/// Rounds `size` up to a whole number of pages.
pub(crate) fn page_align(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}
