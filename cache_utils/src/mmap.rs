use core::ffi::c_void;
use core::num::NonZeroUsize;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::slice::{from_raw_parts, from_raw_parts_mut};
use nix::errno::Errno::EINVAL;
use nix::sys::mman;

/// An anonymous, private, read/write mapping of `size` bytes.
///
/// Each mapping gets its own fresh physical backing, two mappings never share
/// a page even when their contents are identical.
pub struct MMappedMemory {
    pointer: NonNull<u8>,
    size: usize,
}

impl MMappedMemory {
    pub fn try_new(
        size: usize,
        initializer: impl Fn(usize) -> u8,
    ) -> Result<MMappedMemory, nix::Error> {
        let length = NonZeroUsize::new(size).ok_or(EINVAL)?;
        let p = unsafe {
            mman::mmap(
                None,
                length,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_PRIVATE | mman::MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )?
        };
        let pointer = NonNull::new(p as *mut u8).ok_or(EINVAL)?;
        let mut s = MMappedMemory { pointer, size };
        s.fill_with(initializer);
        Ok(s)
    }

    pub fn fill_with(&mut self, initializer: impl Fn(usize) -> u8) {
        for (i, byte) in self.slice_mut().iter_mut().enumerate() {
            *byte = initializer(i);
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.pointer.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.pointer.as_ptr(), self.size) }
    }

    pub fn slice_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.pointer.as_ptr(), self.size) }
    }
}

impl Drop for MMappedMemory {
    fn drop(&mut self) {
        if let Err(e) = unsafe { mman::munmap(self.pointer.as_ptr() as *mut c_void, self.size) } {
            log::warn!("munmap of {:p} failed: {}", self.pointer.as_ptr(), e);
        }
    }
}

impl Deref for MMappedMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.slice()
    }
}

impl DerefMut for MMappedMemory {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.slice_mut()
    }
}

impl core::fmt::Debug for MMappedMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MMappedMemory")
            .field("pointer", &self.pointer)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_size;

    #[test]
    fn maps_initialized_page() {
        let m = MMappedMemory::try_new(page_size(), |i| i as u8).unwrap();
        assert_eq!(m.len(), page_size());
        assert_eq!(m.as_ptr() as usize % page_size(), 0);
        assert_eq!(m[0], 0);
        assert_eq!(m[255], 255);
        assert_eq!(m[256], 0);
    }

    #[test]
    fn distinct_mappings() {
        let a = MMappedMemory::try_new(page_size(), |_| 1).unwrap();
        let b = MMappedMemory::try_new(page_size(), |_| 1).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn zero_size_is_rejected() {
        assert_eq!(
            MMappedMemory::try_new(0, |_| 0).unwrap_err(),
            nix::Error::EINVAL
        );
    }
}
