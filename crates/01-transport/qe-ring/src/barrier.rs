//! Store ordering ahead of device-visible writes.
//!
//! Command words are handed to the device in 64-byte units. Everything the
//! port wrote before the handoff (event payloads, reorder-buffer state) must be
//! globally visible first, so enqueue issues this fence unless the port opted
//! into weaker ordering.

/// Orders all prior stores before the next write to the device.
#[inline]
pub fn device_write_fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: `sfence` has no memory-safety preconditions.
    unsafe {
        std::arch::x86_64::_mm_sfence();
    }
    #[cfg(target_arch = "aarch64")]
    // SAFETY: `dsb st` only orders stores.
    unsafe {
        std::arch::asm!("dsb st", options(nostack, preserves_flags));
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
    }
}
