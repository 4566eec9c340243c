// src/kernel/syscall/mod.rs
//! System call implementations and dispatch
//!
//! The trap dispatcher hands each syscall record to [`syscall`], which
//! routes on the number in RAX with up to three arguments in RDI, RSI
//! and RDX, writes the signed result back into RAX, and - unless the
//! process died underneath the call - marks it runnable with the
//! updated frame.
//!
//! # Validation
//!
//! Nothing user-supplied is trusted:
//!
//! - Buffers must be fully mapped in the caller's page table
//!   ([`EFAULT`] otherwise). They are then translated once per crossed
//!   page into a scatter list of physical slices; the filesystem
//!   consumes those through the direct map, so user pmaps never need
//!   to be loaded kernel-side.
//! - Paths are copied out NUL-terminated with a hard [`NAME_MAX`]
//!   ceiling ([`ENAMETOOLONG`]), then normalized against the process
//!   cwd ([`ENOENT`] on malformed input).
//! - Descriptors must exist in the caller's table ([`EBADF`]); open
//!   flags must name exactly one access mode ([`EINVAL`]).
//!
//! Failures the user caused come back as negative errnos. Conditions
//! that cannot arise unless the kernel itself is broken - untracked
//! frames, collisions under `vempty`, walks into reserved slots -
//! panic instead and never reach user space.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::debug_println;
use crate::kernel::driver::console;
use crate::kernel::fs::path::path_sanitize;
use crate::kernel::fs::{self, Errno};
use crate::kernel::mm::pmap::{is_mapped, is_mapped_str, pmap_walk, UserStrErr, PTE_ADDR, PTE_P};
use crate::kernel::mm::{dmap8, PGOFFSET};
use crate::kernel::process::{is_console_fd, proc_get, Pid, Proc, ProcInner};
use crate::kernel::sched;
use crate::kernel::trap::{TrapFrame, TF_RAX, TF_RDI, TF_RDX, TF_RSI};
use crate::kernel::process::lifecycle;

use x86_64::PhysAddr;

/// Signed syscall result: a count or id when non-negative, a negative
/// errno otherwise.
pub type SyscallResult = i64;

/// Operation not permitted
pub const EPERM: SyscallResult = -1;
/// No such file or directory
pub const ENOENT: SyscallResult = -2;
/// Bad file descriptor
pub const EBADF: SyscallResult = -9;
/// Bad address
pub const EFAULT: SyscallResult = -14;
/// File exists
pub const EEXIST: SyscallResult = -17;
/// Not a directory
pub const ENOTDIR: SyscallResult = -20;
/// Invalid argument
pub const EINVAL: SyscallResult = -22;
/// File name too long
pub const ENAMETOOLONG: SyscallResult = -36;
/// Function not implemented
pub const ENOSYS: SyscallResult = -38;

/// read(fd, buf, sz)
pub const SYS_READ: u64 = 0;
/// write(fd, buf, sz)
pub const SYS_WRITE: u64 = 1;
/// open(path, flags, mode)
pub const SYS_OPEN: u64 = 2;
/// getpid()
pub const SYS_GETPID: u64 = 39;
/// fork()
pub const SYS_FORK: u64 = 57;
/// exit(status)
pub const SYS_EXIT: u64 = 60;
/// mkdir(path, mode)
pub const SYS_MKDIR: u64 = 83;
/// link(old, new)
pub const SYS_LINK: u64 = 86;
/// unlink(path)
pub const SYS_UNLINK: u64 = 87;

/// Open for reading only.
pub const O_RDONLY: i64 = 0;
/// Open for writing only.
pub const O_WRONLY: i64 = 1;
/// Open for reading and writing.
pub const O_RDWR: i64 = 2;
/// Create the file if absent.
pub const O_CREAT: i64 = 0x80;
/// Every write appends.
pub const O_APPEND: i64 = 0x400;

/// Longest path accepted from user space, NUL excluded.
pub const NAME_MAX: usize = 256;

/// Dispatch one syscall record for `pid`.
///
/// Any syscall that touches a process other than the caller must lock
/// that process; the caller's own record needs no further care because
/// a process cannot have two traps in flight.
pub fn syscall(pid: Pid, tf: &mut TrapFrame) {
    let p = proc_get(pid);
    let trap = tf[TF_RAX];
    let a1 = tf[TF_RDI];
    let a2 = tf[TF_RSI];
    let a3 = tf[TF_RDX];

    let mut inner = p.inner.lock();
    let ret = match trap {
        SYS_READ => sys_read(&mut inner, a1 as i64, a2, a3 as usize),
        SYS_WRITE => sys_write(&mut inner, a1 as i64, a2, a3 as usize),
        SYS_OPEN => sys_open(&mut inner, a1, a2 as i64, a3 as i64),
        SYS_GETPID => sys_getpid(&p),
        SYS_FORK => lifecycle::sys_fork(&p, &mut inner, tf),
        SYS_EXIT => lifecycle::sys_exit(&p, a1 as i64),
        SYS_MKDIR => sys_mkdir(&mut inner, a1, a2 as i64),
        SYS_LINK => sys_link(&mut inner, a1, a2),
        SYS_UNLINK => sys_unlink(&mut inner, a1),
        _ => ENOSYS,
    };
    tf[TF_RAX] = ret as u64;
    drop(inner);

    if !p.dead() {
        sched::sched_runnable(pid, Some(tf));
    }
}

/// Physical address backing the user virtual address `va`.
///
/// # Panics
///
/// Panics if `va` is unmapped; callers verify with [`is_mapped`]
/// first, so a miss here is a kernel bug.
fn user_vtop(pmap: PhysAddr, va: u64) -> PhysAddr {
    let pte = pmap_walk(pmap, va, false, 0, None).expect("mapped buffer lost its tables");
    // SAFETY: entry pointer fresh from the walk.
    let pe = unsafe { *pte };
    debug_assert!(pe & PTE_P != 0);
    PhysAddr::new((pe & PTE_ADDR) + (va & PGOFFSET))
}

/// Break the user buffer `[bufp, bufp+sz)` into per-page physical
/// slices. The pages backing a virtually contiguous buffer need not be
/// physically contiguous, so the buffer is pieced together one page at
/// a time, with the final slice trimmed to the remaining byte count.
fn user_slices<'a>(pmap: PhysAddr, bufp: u64, sz: usize) -> Vec<&'a mut [u8]> {
    let mut slices: Vec<&mut [u8]> = Vec::new();
    let mut c = 0usize;
    while c < sz {
        // SAFETY: the caller verified the range is mapped; the frames
        // stay live while the owning process is suspended in this
        // syscall.
        let whole: &'a mut [u8] = unsafe { dmap8(user_vtop(pmap, bufp + c as u64)) };
        let n = core::cmp::min(whole.len(), sz - c);
        let (s, _) = whole.split_at_mut(n);
        c += s.len();
        slices.push(s);
    }
    slices
}

fn sys_read(inner: &mut ProcInner, fdn: i64, bufp: u64, sz: usize) -> SyscallResult {
    if sz == 0 {
        return 0;
    }
    let pmap = inner.pmap();
    if !is_mapped(pmap, bufp, sz) {
        debug_println!("{bufp:#x} not mapped");
        return EFAULT;
    }
    let fd = match inner.fds.get(&fdn) {
        Some(fd) => Arc::clone(fd),
        None => return EBADF,
    };
    let mut fd = fd.lock();

    let mut dsts = user_slices(pmap, bufp, sz);
    match fs::fs().read(&mut dsts, fd.file, fd.offset) {
        Ok(n) => {
            fd.offset += n;
            n as SyscallResult
        }
        Err(e) => e,
    }
}

fn sys_write(inner: &mut ProcInner, fdn: i64, bufp: u64, sz: usize) -> SyscallResult {
    if sz == 0 {
        return 0;
    }
    let pmap = inner.pmap();
    if !is_mapped(pmap, bufp, sz) {
        debug_println!("{bufp:#x} not mapped");
        return EFAULT;
    }
    let fdref = match inner.fds.get(&fdn) {
        Some(fd) => Arc::clone(fd),
        None => return EBADF,
    };
    let console = is_console_fd(&fdref);
    let mut fd = fdref.lock();
    let apnd = fd.perms & O_APPEND != 0;

    let slices = user_slices(pmap, bufp, sz);
    let srcs: Vec<&[u8]> = slices.iter().map(|s| &**s).collect();

    if console {
        // the console is a sink, not a file: bytes go to the screen
        // and the shared sentinel offset stays put
        let mut c = 0;
        for s in &srcs {
            for &b in *s {
                console::putc(b);
            }
            c += s.len();
        }
        return c as SyscallResult;
    }

    match fs::fs().write(&srcs, fd.file, fd.offset, apnd) {
        Ok(n) => {
            fd.offset += n;
            n as SyscallResult
        }
        Err(e) => e,
    }
}

/// Copy a path out of user space, or the errno that stops the syscall.
fn user_path(inner: &ProcInner, pathn: u64) -> Result<alloc::string::String, Errno> {
    match is_mapped_str(inner.pmap(), pathn, NAME_MAX) {
        Ok(s) => Ok(s),
        Err(UserStrErr::Unmapped) => Err(EFAULT),
        Err(UserStrErr::TooLong) => Err(ENAMETOOLONG),
    }
}

fn sys_open(inner: &mut ProcInner, pathn: u64, flags: i64, mode: i64) -> SyscallResult {
    let path = match user_path(inner, pathn) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let temp = flags & (O_RDONLY | O_WRONLY | O_RDWR);
    if temp != O_RDONLY && temp != O_WRONLY && temp != O_RDWR {
        return EINVAL;
    }
    let parts = match path_sanitize(&inner.cwd, &path) {
        Ok(p) => p,
        Err(_) => return ENOENT,
    };
    let file = match fs::fs().open(&parts, flags, mode) {
        Ok(f) => f,
        Err(e) => return e,
    };
    let (fdn, fd) = inner.fd_new();
    let mut fd = fd.lock();
    fd.perms = temp;
    if flags & O_APPEND != 0 {
        fd.perms |= O_APPEND;
    }
    fd.file = file;
    fdn
}

fn sys_mkdir(inner: &mut ProcInner, pathn: u64, mode: i64) -> SyscallResult {
    let path = match user_path(inner, pathn) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let parts = match path_sanitize(&inner.cwd, &path) {
        Ok(p) => p,
        Err(_) => return ENOENT,
    };
    match fs::fs().mkdir(&parts, mode) {
        Ok(()) => 0,
        Err(e) => e,
    }
}

fn sys_link(inner: &mut ProcInner, oldn: u64, newn: u64) -> SyscallResult {
    let old = match user_path(inner, oldn) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let new = match user_path(inner, newn) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let opath = match path_sanitize(&inner.cwd, &old) {
        Ok(p) => p,
        Err(_) => return ENOENT,
    };
    let npath = match path_sanitize(&inner.cwd, &new) {
        Ok(p) => p,
        Err(_) => return ENOENT,
    };
    match fs::fs().link(&opath, &npath) {
        Ok(()) => 0,
        Err(e) => e,
    }
}

fn sys_unlink(inner: &mut ProcInner, pathn: u64) -> SyscallResult {
    let path = match user_path(inner, pathn) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let parts = match path_sanitize(&inner.cwd, &path) {
        Ok(p) => p,
        Err(_) => return ENOENT,
    };
    match fs::fs().unlink(&parts) {
        Ok(()) => 0,
        Err(e) => e,
    }
}

fn sys_getpid(p: &Proc) -> SyscallResult {
    p.pid() as SyscallResult
}
