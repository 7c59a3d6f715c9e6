//! Aligned memory backing for consumer queues.
//!
//! Device-visible rings need contiguous, zeroed memory with cache-line
//! alignment. Native builds take an anonymous `mmap` (page aligned); when that
//! is unavailable or misaligned we fall back to an aligned heap allocation.
//! The region is released when it is dropped, whichever path allocated it.

use crate::{RingError, RingResult};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

#[derive(Debug)]
enum Backing {
    #[cfg(not(target_arch = "wasm32"))]
    Mapped(memmap2::MmapMut),
    Heap {
        ptr: NonNull<u8>,
        layout: Layout,
    },
}

/// Zero-initialised memory region with a guaranteed alignment.
#[derive(Debug)]
pub struct SharedRegion {
    len: usize,
    alignment: usize,
    backing: Backing,
}

// SAFETY: the region owns its allocation exclusively; shared access goes through
// atomics laid over the bytes by the ring types.
unsafe impl Send for SharedRegion {}
// SAFETY: see above, `SharedRegion` exposes only raw pointers and immutable views.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocates `len` zeroed bytes aligned to `alignment`.
    pub fn zeroed(len: usize, alignment: usize) -> RingResult<Self> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(RingError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            if let Some(map) = Self::mapped(len, alignment) {
                return Ok(Self {
                    len,
                    alignment,
                    backing: Backing::Mapped(map),
                });
            }
        }

        let layout = Layout::from_size_align(len, alignment)
            .map_err(|_| RingError::AllocationFailed {
                size: len,
                alignment,
            })?;
        // SAFETY: `layout` has a non-zero size, checked above.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(RingError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Self {
            len,
            alignment,
            backing: Backing::Heap { ptr, layout },
        })
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn mapped(len: usize, alignment: usize) -> Option<memmap2::MmapMut> {
        // Anonymous mappings are zero-filled by the kernel.
        let map = memmap2::MmapOptions::new().len(len).map_anon().ok()?;
        if map.as_ptr() as usize % alignment != 0 {
            return None;
        }
        Some(map)
    }

    /// Total number of bytes managed by this region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the alignment the region was allocated with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Base address of the region.
    pub fn as_ptr(&self) -> *const u8 {
        match &self.backing {
            #[cfg(not(target_arch = "wasm32"))]
            Backing::Mapped(map) => map.as_ptr(),
            Backing::Heap { ptr, .. } => ptr.as_ptr(),
        }
    }

    /// Reinterprets the first `count` elements of the region as `T`.
    ///
    /// # Safety
    /// `T` must be valid for the all-zero bit pattern (or the caller must have
    /// initialised every element), `count * size_of::<T>()` must fit in the
    /// region, and the region alignment must satisfy `align_of::<T>()`.
    pub unsafe fn view<T>(&self, count: usize) -> &[T] {
        debug_assert!(count * std::mem::size_of::<T>() <= self.len);
        debug_assert!(self.alignment >= std::mem::align_of::<T>());
        // SAFETY: upheld by the caller per the contract above.
        unsafe { std::slice::from_raw_parts(self.as_ptr() as *const T, count) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Heap { ptr, layout } = &self.backing {
            // SAFETY: `ptr` was returned by `alloc_zeroed` with this exact layout.
            unsafe {
                dealloc(ptr.as_ptr(), *layout);
            }
        }
    }
}
