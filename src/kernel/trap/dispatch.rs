// src/kernel/trap/dispatch.rs
//! The trap dispatcher and its handler table
//!
//! One long-lived kernel task polls every CPU's ingress ring in
//! numerical order, dequeues one record per non-empty ring per pass,
//! and spawns a fresh handler task for each. The dispatcher itself
//! never blocks - handlers may, on channels, locks, or the filesystem.
//! A trap number without a registered handler is a kernel bug.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::future::Future;
use core::pin::Pin;
use spin::Lazy;

use crate::debug_println;
use crate::kernel::driver::{ide, keyboard};
use crate::kernel::mm::pmap::{pmap_walk, PTE_COW, PTE_P, USERMIN};
use crate::kernel::process::{proc_get, proc_kill};
use crate::kernel::process::lifecycle;
use crate::kernel::syscall;
use crate::kernel::task::{yield_now, RUNTIME};

use super::ring::CPUS;
use super::{TrapRecord, GPFAULT, INT_DISK, INT_KBD, PGFAULT, SYSCALL, TF_RIP};

/// A handler: takes the record by value, returns the task future the
/// dispatcher spawns.
pub type TrapHandler = fn(TrapRecord) -> Pin<Box<dyn Future<Output = ()> + Send>>;

/// The handler table, fixed at init.
static HANDLERS: Lazy<BTreeMap<u64, TrapHandler>> = Lazy::new(|| {
    let mut h: BTreeMap<u64, TrapHandler> = BTreeMap::new();
    h.insert(GPFAULT, |ts| Box::pin(trap_die(ts)));
    h.insert(PGFAULT, |ts| Box::pin(trap_pgfault(ts)));
    h.insert(SYSCALL, |ts| Box::pin(trap_syscall(ts)));
    h.insert(INT_DISK, |ts| Box::pin(trap_disk(ts)));
    h.insert(INT_KBD, |ts| Box::pin(trap_kbd(ts)));
    h
});

/// Spawn the handler task for one record.
///
/// # Panics
///
/// Panics on a trap number with no registered handler.
fn dispatch_record(ts: TrapRecord) {
    match HANDLERS.get(&ts.trapno) {
        Some(h) => {
            RUNTIME.spawn_boxed(h(ts));
        }
        None => panic!("no handler for trap {}, pid {:#x}", ts.trapno, ts.pid),
    }
}

/// One dispatcher pass: visit every CPU ring in order, dequeue at most
/// one record each, spawn its handler. Returns the number of records
/// dispatched.
pub fn trap_sweep() -> usize {
    let mut n = 0;
    for cpu in CPUS.iter() {
        if let Some(ts) = cpu.ring.pop() {
            dispatch_record(ts);
            n += 1;
        }
    }
    n
}

/// The dispatcher task: sweep, yield, repeat forever.
pub async fn trap_dispatcher() {
    loop {
        trap_sweep();
        yield_now().await;
    }
}

async fn trap_die(ts: TrapRecord) {
    debug_println!("[death on trap {}]", ts.trapno);
    panic!("perished");
}

async fn trap_syscall(ts: TrapRecord) {
    let mut tf = ts.tf;
    syscall::syscall(ts.pid, &mut tf);
}

async fn trap_pgfault(ts: TrapRecord) {
    handle_pgfault(&ts);
}

async fn trap_kbd(_ts: TrapRecord) {
    keyboard::kbd_irq().await;
}

async fn trap_disk(_ts: TrapRecord) {
    ide::disk_irq().await;
}

/// Service one page fault.
///
/// A present copy-on-write entry in user range gets a private copy and
/// the process continues. Anything else - not present, not COW - is
/// unrecoverable for the process: log and kill. A COW entry below the
/// user range means the kernel corrupted its own tables.
pub fn handle_pgfault(ts: &TrapRecord) {
    let proc = proc_get(ts.pid);
    let mut inner = proc.inner.lock();
    let fa = ts.faultaddr;

    if let Some(pte) = pmap_walk(inner.pmap(), fa, false, 0, None) {
        // SAFETY: entry pointer fresh from the walk, process lock held.
        let pe = unsafe { *pte };
        if pe & PTE_P != 0 && pe & PTE_COW != 0 {
            if fa < USERMIN {
                panic!("kernel page marked COW");
            }
            lifecycle::handle_cow_fault(&proc, &mut inner, pte, fa);
            return;
        }
    }

    let rip = ts.tf[TF_RIP];
    debug_println!(
        "*** fault *** {:?}: addr {fa:#x}, rip {rip:#x}. killing...",
        proc.name()
    );
    drop(inner);
    proc_kill(ts.pid);
}
