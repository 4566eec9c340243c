// src/kernel/process/mod.rs
//! Process records, the global process table, and descriptor tables
//!
//! A process owns its page-table tree through two tracking maps:
//! `pages` maps every physical frame reachable from its pmap to the
//! owning allocation, and `upages` is the inverse index from frame to
//! the user virtual page it backs. Reclamation is by ownership - when
//! the last process holding a frame dies, the frame's allocation is
//! dropped with it.
//!
//! Concurrency: the table itself is guarded by one mutex held only for
//! lookup/insert/remove. A process record's maps and pmap are touched
//! only by the task currently acting for that process; since a process
//! surrenders on syscall or fault and at most one of its trap records
//! is in flight, the per-record mutex is uncontended by construction.

pub mod elf;
pub mod lifecycle;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Lazy, Mutex};
use x86_64::PhysAddr;

use crate::arch;
use crate::kernel::fs::FsHandle;
use crate::kernel::mm::pmap::{pmap_walk, PTE_ADDR, PTE_P};
use crate::kernel::mm::{KPage, PageTracker, PGMASK};
use crate::kernel::sched;

/// Process identifier. 0 names the kernel itself and never appears in
/// the table.
pub type Pid = u64;

/// An open file: filesystem handle, byte offset, and the access mode
/// bits recorded at `open` time.
#[derive(Debug)]
pub struct OpenFile {
    /// Handle into the filesystem, or the console sentinel.
    pub file: FsHandle,
    /// Current byte offset.
    pub offset: usize,
    /// Access mode plus `O_APPEND` if requested.
    pub perms: i64,
}

/// Shared handle to an open file. Sentinel descriptors are recognized
/// by handle identity, not by contents.
pub type FdRef = Arc<Mutex<OpenFile>>;

/// The single file object behind all three console descriptors.
pub const CONSOLE_FILE: FsHandle = FsHandle(-1);

fn console_fd() -> FdRef {
    Arc::new(Mutex::new(OpenFile {
        file: CONSOLE_FILE,
        offset: 0,
        perms: 0,
    }))
}

/// Sentinel standard input.
pub static FD_STDIN: Lazy<FdRef> = Lazy::new(console_fd);
/// Sentinel standard output; writes go to the console, not the
/// filesystem.
pub static FD_STDOUT: Lazy<FdRef> = Lazy::new(console_fd);
/// Sentinel standard error; same sink as standard output.
pub static FD_STDERR: Lazy<FdRef> = Lazy::new(console_fd);

/// Whether `fd` is one of the console output sentinels.
pub fn is_console_fd(fd: &FdRef) -> bool {
    Arc::ptr_eq(fd, &*FD_STDOUT) || Arc::ptr_eq(fd, &*FD_STDERR)
}

/// The mutable half of a process record.
pub struct ProcInner {
    /// Physical address of the page-table root; `None` until an image
    /// is loaded.
    pub p_pmap: Option<PhysAddr>,
    /// All frames owned by this process, page-table pages included.
    pub pages: PageTracker,
    /// Frame -> user virtual page, for every user-mapped frame.
    pub upages: BTreeMap<u64, u64>,
    /// Descriptor table.
    pub fds: BTreeMap<i64, FdRef>,
    /// Next descriptor number to hand out.
    pub nextfd: i64,
    /// Current working directory, absolute.
    pub cwd: String,
}

impl ProcInner {
    /// Page-table root of this process.
    ///
    /// # Panics
    ///
    /// Panics if no image has been loaded yet.
    pub fn pmap(&self) -> PhysAddr {
        self.p_pmap.expect("process has no address space")
    }

    /// Hand out a fresh descriptor backed by a blank open-file record.
    pub fn fd_new(&mut self) -> (i64, FdRef) {
        let fdn = self.nextfd;
        self.nextfd += 1;
        let fd: FdRef = Arc::new(Mutex::new(OpenFile {
            file: FsHandle(0),
            offset: 0,
            perms: 0,
        }));
        if self.fds.insert(fdn, Arc::clone(&fd)).is_some() {
            panic!("new fd exists {fdn}");
        }
        (fdn, fd)
    }

    /// Map the frame `(pg, pa)` at `va` with `perms`.
    ///
    /// An existing mapping is replaced - its frame leaves both tracking
    /// maps and the TLB entry is invalidated - unless the caller
    /// asserted `vempty`, in which case a collision is a kernel bug.
    pub fn page_insert(&mut self, va: u64, pg: Arc<KPage>, pa: PhysAddr, perms: u64, vempty: bool) {
        let pmap = self.pmap();
        let pte = pmap_walk(pmap, va, true, perms, Some(&mut self.pages))
            .expect("pmap_walk with create returned no entry");
        // SAFETY: entry pointer fresh from the walk; this task is the
        // only one mutating this process's pmap.
        let old = unsafe { *pte };
        let mut ninval = false;
        if old & PTE_P != 0 {
            if vempty {
                panic!("pte not empty");
            }
            ninval = true;
            let p_rem = old & PTE_ADDR;
            if self.pages.remove(&p_rem).is_none() {
                panic!("kern va not tracked");
            }
            if self.upages.remove(&p_rem).is_none() {
                panic!("user va not tracked");
            }
        }
        // SAFETY: as above.
        unsafe {
            *pte = pa.as_u64() | perms | PTE_P;
        }
        if ninval {
            arch::invlpg(va);
        }
        self.pages.insert(pa.as_u64(), pg);
        self.upages.insert(pa.as_u64(), va & PGMASK);
    }

    /// Unmap `va` if mapped: clear the entry, drop the frame from both
    /// tracking maps, invalidate the TLB entry.
    pub fn page_remove(&mut self, va: u64) {
        let pmap = self.pmap();
        if let Some(pte) = pmap_walk(pmap, va, false, 0, None) {
            // SAFETY: entry pointer fresh from the walk, same exclusion
            // as in `page_insert`.
            let pe = unsafe { *pte };
            if pe & PTE_P != 0 {
                let p_pa = pe & PTE_ADDR;
                self.pages.remove(&p_pa);
                self.upages.remove(&p_pa);
                // SAFETY: as above.
                unsafe {
                    *pte = 0;
                }
                arch::invlpg(va);
            }
        }
    }
}

/// One process.
pub struct Proc {
    pid: Pid,
    name: String,
    dead: AtomicBool,
    /// Mutable state; see the module notes on why this lock is
    /// uncontended.
    pub inner: Mutex<ProcInner>,
}

impl Proc {
    /// Process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the process has been killed.
    pub fn dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

struct ProcTable {
    procs: BTreeMap<Pid, Arc<Proc>>,
    pid_cur: Pid,
}

static ALLPROCS: Mutex<ProcTable> = Mutex::new(ProcTable {
    procs: BTreeMap::new(),
    pid_cur: 0,
});

/// Create a process: fresh pid (strictly increasing, never reused),
/// empty tracking maps, sentinel descriptors 0/1/2, cwd `/`.
pub fn proc_new(name: String) -> Arc<Proc> {
    let mut fds = BTreeMap::new();
    fds.insert(0, Arc::clone(&*FD_STDIN));
    fds.insert(1, Arc::clone(&*FD_STDOUT));
    fds.insert(2, Arc::clone(&*FD_STDERR));
    let nextfd = fds.len() as i64;

    let mut table = ALLPROCS.lock();
    table.pid_cur += 1;
    let pid = table.pid_cur;
    let proc = Arc::new(Proc {
        pid,
        name,
        dead: AtomicBool::new(false),
        inner: Mutex::new(ProcInner {
            p_pmap: None,
            pages: PageTracker::new(),
            upages: BTreeMap::new(),
            fds,
            nextfd,
            cwd: String::from("/"),
        }),
    });
    table.procs.insert(pid, Arc::clone(&proc));
    proc
}

/// Look up a live process.
///
/// # Panics
///
/// Panics on an unknown pid - a trap record for a process the kernel
/// does not know about means the kernel is broken.
pub fn proc_get(pid: Pid) -> Arc<Proc> {
    let table = ALLPROCS.lock();
    match table.procs.get(&pid) {
        Some(p) => Arc::clone(p),
        None => panic!("no such pid {pid}"),
    }
}

/// Kill a process: flag it dead, drop it from the table, tell the run
/// queue to forget it. Its frames are reclaimed when the last task
/// holding the record lets go.
pub fn proc_kill(pid: Pid) {
    let proc = {
        let mut table = ALLPROCS.lock();
        match table.procs.remove(&pid) {
            Some(p) => p,
            None => panic!("bad pid {pid}"),
        }
    };
    proc.dead.store(true, Ordering::SeqCst);
    sched::sched_kill(pid);
}

/// Fork helper: a child's display name.
pub fn child_name(parent: &Proc) -> String {
    format!("{}'s child", parent.name())
}
