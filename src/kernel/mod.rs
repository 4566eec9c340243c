// src/kernel/mod.rs
//! Kernel subsystems
//!
//! Dependency order, leaves first: paging primitives, then the process
//! table, then the trap ring, the dispatcher, the syscall layer, and
//! the device daemons on top.

pub mod driver;
pub mod fs;
pub mod ipc;
pub mod mm;
pub mod process;
pub mod sched;
pub mod syscall;
pub mod task;
pub mod trap;

#[cfg(test)]
pub(crate) mod testutil;

use spin::Once;

static INIT: Once<()> = Once::new();

/// Bring the kernel core up, in dependency order: direct map, trap
/// dispatcher, interrupt controller, device daemons.
///
/// The embedder calls this once from its boot path after the heap and
/// [`mm::PHYS_MEM_OFFSET`] are set, then mounts a filesystem, installs
/// the trap vectors pointing at [`trap::trapstub`], and drives
/// [`task::RUNTIME`] alongside [`sched::take_runnable`].
pub fn init() {
    INIT.call_once(|| {
        mm::pmap::kpmap();
        mm::pmap::dmap_init();
        task::spawn_task(trap::dispatch::trap_dispatcher());
        crate::arch::pic::init_8259();
        driver::keyboard::kbd_init(driver::keyboard::I8042::new());
    });
}
