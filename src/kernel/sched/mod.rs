// src/kernel/sched/mod.rs
//! User-context run queue
//!
//! The boundary between trap handling and actually running user code.
//! Handlers deposit runnable user contexts here - pid, page-table
//! root, trap frame - and the platform resume loop pops them, loads
//! CR3, and irets. The crate never jumps to ring 3 itself; that last
//! step belongs to the embedder's vector glue.

use alloc::collections::{BTreeMap, VecDeque};
use spin::Mutex;
use x86_64::PhysAddr;

use crate::kernel::process::Pid;
use crate::kernel::trap::TrapFrame;

/// A runnable user context.
#[derive(Clone, Debug)]
pub struct UserCtx {
    /// Owning process.
    pub pid: Pid,
    /// Physical address of the page-table root to load, if an image
    /// has been attached.
    pub p_pmap: Option<PhysAddr>,
    /// The frame to resume with.
    pub tf: TrapFrame,
}

#[derive(Default)]
struct RunQueue {
    ctxs: BTreeMap<Pid, UserCtx>,
    ready: VecDeque<Pid>,
}

static RUN_QUEUE: Mutex<RunQueue> = Mutex::new(RunQueue {
    ctxs: BTreeMap::new(),
    ready: VecDeque::new(),
});

/// Register a brand-new runnable context (fork child, exec'd image).
pub fn sched_add(pid: Pid, p_pmap: PhysAddr, tf: &TrapFrame) {
    let mut rq = RUN_QUEUE.lock();
    rq.ctxs.insert(
        pid,
        UserCtx {
            pid,
            p_pmap: Some(p_pmap),
            tf: *tf,
        },
    );
    if !rq.ready.contains(&pid) {
        rq.ready.push_back(pid);
    }
}

/// Mark `pid` runnable again after a trap. With `Some(tf)` the saved
/// frame is replaced (syscall return); with `None` the stored frame is
/// reused (a fault was serviced in place).
pub fn sched_runnable(pid: Pid, tf: Option<&TrapFrame>) {
    let mut rq = RUN_QUEUE.lock();
    match rq.ctxs.get_mut(&pid) {
        Some(ctx) => {
            if let Some(tf) = tf {
                ctx.tf = *tf;
            }
        }
        None => {
            let ctx = UserCtx {
                pid,
                p_pmap: None,
                tf: tf.copied().unwrap_or_default(),
            };
            rq.ctxs.insert(pid, ctx);
        }
    }
    if !rq.ready.contains(&pid) {
        rq.ready.push_back(pid);
    }
}

/// Forget everything about `pid`.
pub fn sched_kill(pid: Pid) {
    let mut rq = RUN_QUEUE.lock();
    rq.ctxs.remove(&pid);
    rq.ready.retain(|&p| p != pid);
}

/// Pop the next runnable context, if any. The platform resume loop's
/// entry point.
pub fn take_runnable() -> Option<UserCtx> {
    let mut rq = RUN_QUEUE.lock();
    let pid = rq.ready.pop_front()?;
    rq.ctxs.get(&pid).cloned()
}

/// Whether `pid` is queued to run.
pub fn is_runnable(pid: Pid) -> bool {
    RUN_QUEUE.lock().ready.contains(&pid)
}

/// Peek at the stored context for `pid`.
pub fn runnable_ctx(pid: Pid) -> Option<UserCtx> {
    RUN_QUEUE.lock().ctxs.get(&pid).cloned()
}

#[cfg(test)]
pub(crate) fn ready_occurrences(pid: Pid) -> usize {
    RUN_QUEUE.lock().ready.iter().filter(|&&p| p == pid).count()
}
