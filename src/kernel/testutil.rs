// src/kernel/testutil.rs
//! Shared helpers for the unit tests: minimal user processes, user
//! memory poking through the direct map, and executor pumping.

#![cfg(test)]

use alloc::string::String;
use alloc::sync::Arc;
use spin::Mutex;
use x86_64::PhysAddr;

use crate::kernel::mm::pg_new;
use crate::kernel::mm::pmap::{copy_pmap, kpmap, pmap_walk, PteMod, PTE_ADDR, PTE_U, PTE_W};
use crate::kernel::mm::{dmap8, PGOFFSET};
use crate::kernel::process::{proc_new, Proc};
use crate::kernel::task::RUNTIME;

/// Tests that produce into or consume from the shared per-CPU trap
/// rings hold this lock so a concurrent sweep cannot steal their
/// records.
pub static RING_LOCK: Mutex<()> = Mutex::new(());

/// Tests that install a console sink hold this lock so captures do not
/// interleave.
pub static CONSOLE_LOCK: Mutex<()> = Mutex::new(());

/// A process with a fresh copy of the kernel address space.
pub fn uproc(name: &str) -> Arc<Proc> {
    let p = proc_new(String::from(name));
    let mut inner = p.inner.lock();
    let (pmap, _) = copy_pmap(PteMod::NoRewrite, kpmap(), &mut inner.pages);
    inner.p_pmap = Some(pmap);
    drop(inner);
    p
}

/// Map a fresh user-writable page at `va`; returns its frame address.
pub fn map_user_page(p: &Arc<Proc>, va: u64) -> PhysAddr {
    let mut inner = p.inner.lock();
    let (pg, pa) = pg_new(&mut inner.pages);
    inner.page_insert(va, pg, pa, PTE_U | PTE_W, true);
    pa
}

fn user_pa(p: &Arc<Proc>, va: u64) -> PhysAddr {
    let inner = p.inner.lock();
    let pte = pmap_walk(inner.pmap(), va, false, 0, None).expect("user va not mapped");
    let pe = unsafe { *pte };
    PhysAddr::new((pe & PTE_ADDR) + (va & PGOFFSET))
}

/// Write `bytes` into the process's memory at `va` through the direct
/// map, page by page.
pub fn write_user(p: &Arc<Proc>, va: u64, bytes: &[u8]) {
    let mut off = 0;
    while off < bytes.len() {
        let dst = unsafe { dmap8(user_pa(p, va + off as u64)) };
        let n = core::cmp::min(dst.len(), bytes.len() - off);
        dst[..n].copy_from_slice(&bytes[off..off + n]);
        off += n;
    }
}

/// Read the process's memory at `va` into `out`.
pub fn read_user(p: &Arc<Proc>, va: u64, out: &mut [u8]) {
    let mut off = 0;
    while off < out.len() {
        let src = unsafe { dmap8(user_pa(p, va + off as u64)) };
        let n = core::cmp::min(src.len(), out.len() - off);
        out[off..off + n].copy_from_slice(&src[..n]);
        off += n;
    }
}

/// Drive the shared executor until `done` holds. Panics if it never
/// does.
pub fn pump_until(done: impl Fn() -> bool) {
    for _ in 0..10_000 {
        RUNTIME.run_until_idle();
        if done() {
            return;
        }
        std::thread::yield_now();
    }
    panic!("executor made no progress toward the expected state");
}
