// src/kernel/mm/mod.rs
//! Physical page frames and the direct map
//!
//! Page frames - page-table pages and user data pages alike - are
//! ordinary kernel heap allocations of one aligned page each. The heap
//! lives inside the direct-map window, so translating between a frame's
//! physical address and a kernel pointer is constant-time arithmetic on
//! [`PHYS_MEM_OFFSET`]: `va = pa + offset`, `pa = va - offset`.
//!
//! Ownership doubles as reclamation: every frame is held by at least one
//! tracking map ([`PageTracker`]), and a frame is freed exactly when the
//! last tracker entry referencing it is dropped. There is no separate
//! free list to desynchronize.

pub mod heap;
pub mod pmap;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::PhysAddr;

/// Size of one page frame in bytes.
pub const PGSIZE: usize = 4096;
/// Mask of the in-page offset bits.
pub const PGOFFSET: u64 = 0xfff;
/// Mask selecting the page-aligned part of an address.
pub const PGMASK: u64 = !PGOFFSET;

/// Offset of the direct-map window: physical address 0 is visible at
/// this kernel virtual address. Boot code points it at the 512 GiB
/// window that [`pmap::dmap_init`] populates with 1 GiB pages; hosted
/// builds leave it at zero so physical and kernel-virtual coincide.
pub static PHYS_MEM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Current direct-map offset.
#[inline]
pub fn phys_mem_offset() -> u64 {
    PHYS_MEM_OFFSET.load(Ordering::Relaxed)
}

/// Point the direct-map window at `offset`.
///
/// # Safety
///
/// Boot-time only, before any frame is allocated: all of physical
/// memory must be mapped contiguously starting at `offset`, and the
/// kernel heap must live inside that window.
pub unsafe fn set_phys_mem_offset(offset: u64) {
    PHYS_MEM_OFFSET.store(offset, Ordering::Relaxed);
}

/// One page frame, viewed as 512 page-table entries.
///
/// The interior `UnsafeCell` is load-bearing: frame contents are
/// mutated through direct-map pointers while tracking maps hold shared
/// references to the allocation.
#[repr(C, align(4096))]
pub struct KPage(UnsafeCell<[u64; 512]>);

// SAFETY: all access to the cell goes through raw pointers obtained via
// the direct map; the paging discipline (one syscall/fault in flight per
// process, kernel tables under the kernel-pages mutex) provides the
// exclusion the type system cannot see.
unsafe impl Send for KPage {}
unsafe impl Sync for KPage {}

impl KPage {
    /// Entries per page.
    pub const LEN: usize = 512;

    /// A zero-filled frame.
    pub fn zeroed() -> Self {
        Self(UnsafeCell::new([0; 512]))
    }

    /// Raw pointer to the frame contents.
    pub fn as_ptr(&self) -> *mut u64 {
        self.0.get() as *mut u64
    }
}

/// Tracking map from physical frame address to the owning allocation.
///
/// Frames shared between processes (after `fork`) appear in several
/// trackers; the frame is reclaimed when the last one drops it.
pub type PageTracker = BTreeMap<u64, Arc<KPage>>;

/// Allocate a fresh zeroed frame, record it in `tracker`, and return
/// the owning handle together with its physical address.
///
/// # Panics
///
/// Panics if the allocator hands back an unaligned page, which would
/// mean the heap itself is corrupt.
pub fn pg_new(tracker: &mut PageTracker) -> (Arc<KPage>, PhysAddr) {
    let pg = Arc::new(KPage::zeroed());
    let va = Arc::as_ptr(&pg) as u64;
    if va & PGOFFSET != 0 {
        panic!("page not aligned: {va:#x}");
    }
    let pa = PhysAddr::new(va - phys_mem_offset());
    tracker.insert(pa.as_u64(), Arc::clone(&pg));
    (pg, pa)
}

/// Physical address of a kernel-heap page.
#[inline]
pub fn vtop(page: *const KPage) -> PhysAddr {
    PhysAddr::new(page as u64 - phys_mem_offset())
}

/// Page-aligned direct-map view of a physical frame.
#[inline]
pub fn dmap(pa: PhysAddr) -> *mut KPage {
    #[cfg(target_os = "none")]
    debug_assert!(pa.as_u64() < 1 << 39, "physical address beyond direct map");
    ((pa.as_u64() & PGMASK) + phys_mem_offset()) as *mut KPage
}

/// Byte-aligned direct-map view: the bytes from `pa` to the end of its
/// frame.
///
/// # Safety
///
/// The caller must ensure `pa` refers to a live frame and that the
/// paging discipline rules out conflicting access for the lifetime of
/// the slice.
#[inline]
pub unsafe fn dmap8<'a>(pa: PhysAddr) -> &'a mut [u8] {
    let off = (pa.as_u64() & PGOFFSET) as usize;
    let base = dmap(pa) as *mut u8;
    // SAFETY: per the caller's contract the frame is live; the slice
    // stays within one page.
    unsafe { core::slice::from_raw_parts_mut(base.add(off), PGSIZE - off) }
}

/// Pointer to entry `idx` of the page-table page at `table`.
///
/// # Safety
///
/// `table` must be the physical address of a live frame and `idx` in
/// bounds.
#[inline]
pub unsafe fn pte_at(table: PhysAddr, idx: usize) -> *mut u64 {
    debug_assert!(idx < KPage::LEN);
    // SAFETY: caller contract; KPage is one transparent cell over the
    // entry array.
    unsafe { (dmap(table) as *mut u64).add(idx) }
}
