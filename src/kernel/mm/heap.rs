// src/kernel/mm/heap.rs
//! Kernel heap
//!
//! Bare-metal builds allocate out of a linked-list heap carved from
//! the direct-map window, so every heap object has a physical address
//! reachable by offset arithmetic. Hosted builds use the platform
//! allocator, which satisfies the same invariant with a zero offset.

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand the heap its memory range.
///
/// # Safety
///
/// Boot-time only: `[start, start+size)` must be unused RAM inside the
/// direct-map window, and this must be called before the first
/// allocation.
#[cfg(target_os = "none")]
pub unsafe fn init_heap(start: usize, size: usize) {
    // SAFETY: forwarded caller contract.
    unsafe {
        ALLOCATOR.lock().init(start as *mut u8, size);
    }
}
