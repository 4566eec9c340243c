// src/kernel/process/lifecycle.rs
//! Process lifecycle: fork, program loading, exit, and the
//! copy-on-write fault service
//!
//! `fork` is a deep pmap copy with a twist: writable user entries are
//! downgraded to read-only copy-on-write in parent and child alike,
//! and the child's tracking maps pick up shared references to every
//! user frame. The first write on either side takes a page fault,
//! which [`handle_cow_fault`] resolves by giving the writer a private
//! copy with write permission restored.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use x86_64::PhysAddr;

use crate::debug_println;
use crate::kernel::fs;
use crate::kernel::mm::pmap::{
    copy_pmap, kpmap, mkva, rounddown, roundup, PteMod, PTE_ADDR, PTE_COW, PTE_FLAGS, PTE_U,
    PTE_W, VUSER,
};
use crate::kernel::mm::pmap::USERMIN;
use crate::kernel::mm::{dmap, pg_new, KPage, PGMASK, PGSIZE};
use crate::kernel::process::{child_name, proc_kill, proc_new, Proc, ProcInner};
use crate::kernel::sched;
use crate::kernel::syscall::{SyscallResult, EINVAL, ENOSYS, O_RDONLY};
use crate::kernel::trap::{
    TrapFrame, TF_CS, TF_FL_IF, TF_RAX, TF_RFLAGS, TF_RIP, TF_RSP, TF_SS,
};

use super::elf::{Elf, PF_W, PT_LOAD};

/// Ring-3 code segment index in the GDT.
const UCSEG: u64 = 4;
/// Ring-3 data segment index in the GDT.
const UDSEG: u64 = 5;

/// Top of the initial user stack: the first address above the lowest
/// user top-level slot.
fn ustack_top() -> u64 {
    mkva(VUSER + 1, 0, 0, 0)
}

/// Fork the calling process.
///
/// The child gets a deep copy of the parent's pmap with every writable
/// user entry downgraded to copy-on-write on both sides, shared
/// references to the parent's user frames in its tracking maps, and a
/// clone of the parent's trap frame returning 0. The parent's return
/// value is written into its frame before the child is queued, so the
/// parent's view of `fork` is complete by the time the child can run.
///
/// No TLB invalidation is needed for the parent here: its pmap cannot
/// be loaded anywhere right now except on the CPU that took this
/// syscall, and that CPU reloads it on the way back to user space.
pub fn sys_fork(parent: &Arc<Proc>, inner: &mut ProcInner, ptf: &mut TrapFrame) -> SyscallResult {
    let child = proc_new(child_name(parent));
    let mut ci = child.inner.lock();

    let (p_pmap, _) = copy_pmap(PteMod::CowDowngrade, inner.pmap(), &mut ci.pages);
    ci.p_pmap = Some(p_pmap);

    // the child references every user frame the parent does
    for (&p_pg, &va) in inner.upages.iter() {
        let pg = match inner.pages.get(&p_pg) {
            Some(pg) => Arc::clone(pg),
            None => panic!("parent not tracking page {p_pg:#x}"),
        };
        ci.pages.insert(p_pg, pg);
        ci.upages.insert(p_pg, va);
    }
    drop(ci);

    let mut chtf = *ptf;
    chtf[TF_RAX] = 0;
    ptf[TF_RAX] = child.pid();

    sched::sched_add(child.pid(), p_pmap, &chtf);

    child.pid() as SyscallResult
}

/// Give the faulting process a private copy of the copy-on-write frame
/// under `pte` and mark the process runnable again.
///
/// The new entry keeps the old flags minus the COW bit and regains
/// write permission; the replaced mapping is invalidated, so the
/// faulting thread re-executes its store against the fresh frame.
pub fn handle_cow_fault(p: &Arc<Proc>, inner: &mut ProcInner, pte: *mut u64, faultaddr: u64) {
    let (dst, p_dst) = pg_new(&mut inner.pages);
    // SAFETY: the dispatcher walked to this entry under the process
    // lock we still hold.
    let pe = unsafe { *pte };
    let p_src = pe & PTE_ADDR;
    // SAFETY: source frame is live (tracked by this process), the
    // destination is the fresh frame above.
    unsafe {
        core::ptr::copy_nonoverlapping(
            dmap(PhysAddr::new(p_src)) as *const u64,
            dst.as_ptr(),
            KPage::LEN,
        );
    }

    let va = faultaddr & PGMASK;
    let perms = ((pe & PTE_FLAGS) & !PTE_COW) | PTE_W;
    inner.page_insert(va, dst, p_dst, perms, false);

    sched::sched_runnable(p.pid(), None);
}

/// Terminate the calling process. The return value is never observed:
/// the process is dead and the syscall finalizer skips the runnable
/// mark.
pub fn sys_exit(p: &Arc<Proc>, status: i64) -> SyscallResult {
    debug_println!("{:?} exited with status {}", p.name(), status);
    proc_kill(p.pid());
    0
}

/// Build a process around an ELF image: kernel pmap copy, user stack,
/// loaded segments, and the initial ring-3 trap frame. The caller
/// decides when to queue it.
pub(crate) fn exec_elf(eobj: &[u8], cmd: String) -> Result<(Arc<Proc>, TrapFrame), SyscallResult> {
    let elf = Elf::new(eobj).map_err(|_| EINVAL)?;
    let hdrs = elf.headers().map_err(|_| EINVAL)?;
    let entry = elf.entry().map_err(|_| EINVAL)?;

    let proc = proc_new(cmd);
    let mut inner = proc.inner.lock();

    let (stack, p_stack) = pg_new(&mut inner.pages);
    let stackva = ustack_top();

    let mut tf = TrapFrame::zeroed();
    tf[TF_RSP] = stackva - 8;
    tf[TF_RIP] = entry;
    tf[TF_RFLAGS] = TF_FL_IF;
    tf[TF_CS] = UCSEG << 3 | 3;
    tf[TF_SS] = UDSEG << 3 | 3;

    // the image address space starts as a copy of the kernel's, so the
    // recursive and direct-map slots come along
    let (pmap, _) = copy_pmap(PteMod::NoRewrite, kpmap(), &mut inner.pages);
    inner.p_pmap = Some(pmap);
    inner.page_insert(stackva - PGSIZE as u64, stack, p_stack, PTE_U | PTE_W, true);

    for hdr in &hdrs {
        if hdr.etype == PT_LOAD && hdr.vaddr >= USERMIN {
            elf_segload(&mut inner, hdr);
        }
    }
    drop(inner);
    Ok((proc, tf))
}

/// Map one `PT_LOAD` segment: fresh zeroed frames for the whole
/// rounded `[vaddr, vaddr+memsz)` range, file bytes copied in, BSS
/// covered by the zero fill.
fn elf_segload(inner: &mut ProcInner, hdr: &super::elf::Phdr<'_>) {
    let mut perms = PTE_U;
    if hdr.flags & PF_W != 0 {
        perms |= PTE_W;
    }
    let sz = roundup(hdr.vaddr + hdr.memsz as u64, PGSIZE as u64)
        - rounddown(hdr.vaddr, PGSIZE as u64);
    let rsz = hdr.filesz;
    let mut i = 0usize;
    while (i as u64) < sz {
        let (pg, p_pg) = pg_new(&mut inner.pages);
        if i < hdr.sdata.len() {
            let n = core::cmp::min(PGSIZE, rsz - i);
            // SAFETY: fresh frame, source bytes bounds-checked by the
            // image reader.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    hdr.sdata[i..].as_ptr(),
                    pg.as_ptr() as *mut u8,
                    n,
                );
            }
        }
        inner.page_insert(hdr.vaddr + i as u64, pg, p_pg, perms, true);
        i += PGSIZE;
    }
}

/// Load and start the program at `path`.
///
/// The whole file is pulled through the filesystem boundary, parsed as
/// ELF64, and turned into a runnable process. Argument passing is not
/// implemented.
pub fn sys_execv(path: &[String], args: &[String]) -> SyscallResult {
    if !args.is_empty() {
        debug_println!("execv: argument passing not implemented");
        return ENOSYS;
    }
    let file = match fs::fs().open(path, O_RDONLY, 0) {
        Ok(f) => f,
        Err(e) => return e,
    };

    let mut eobj: Vec<u8> = Vec::new();
    let mut c = 0usize;
    loop {
        let mut add = [0u8; PGSIZE];
        let n = match fs::fs().read(&mut [&mut add[..]], file, c) {
            Ok(n) => n,
            Err(e) => return e,
        };
        if n == 0 {
            break;
        }
        c += n;
        eobj.extend_from_slice(&add[..n]);
    }

    let mut cmd = String::from("/");
    cmd.push_str(&path.join("/"));
    match exec_elf(&eobj, cmd) {
        Ok((proc, tf)) => {
            let pmap = proc.inner.lock().pmap();
            sched::sched_add(proc.pid(), pmap, &tf);
            0
        }
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fs::testfs::mount_testfs;
    use crate::kernel::mm::pmap::{is_mapped, pmap_walk, PTE_P, VREC};
    use crate::kernel::mm::pte_at;
    use crate::kernel::process::elf::mkimage;
    use crate::kernel::syscall::{syscall, SYS_FORK};
    use crate::kernel::testutil::{map_user_page, read_user, uproc, write_user};
    use crate::kernel::trap::{TrapRecord, PGFAULT};

    fn pte_of(p: &Arc<Proc>, va: u64) -> u64 {
        let inner = p.inner.lock();
        let pte = pmap_walk(inner.pmap(), va, false, 0, None).expect("mapped");
        unsafe { *pte }
    }

    fn fault_record(pid: u64, va: u64) -> TrapRecord {
        let mut tf = TrapFrame::zeroed();
        tf[crate::kernel::trap::TF_TRAP] = PGFAULT;
        tf[TF_RIP] = 0xbeef;
        TrapRecord {
            trapno: PGFAULT,
            pid,
            faultaddr: va,
            tf,
        }
    }

    #[test]
    fn fork_shares_frames_read_only_with_cow() {
        mount_testfs();
        let parent = uproc("forker");
        let va = USERMIN + 0xa0_0000;
        map_user_page(&parent, va);
        write_user(&parent, va, b"original page contents");

        let mut tf = TrapFrame::zeroed();
        tf[TF_RAX] = SYS_FORK;
        tf[crate::kernel::trap::TF_RSP] = 0x7777;
        syscall(parent.pid(), &mut tf);
        let child_pid = tf[TF_RAX];
        assert!(child_pid > parent.pid());

        let child = crate::kernel::process::proc_get(child_pid);
        // both sides: W clear, COW set, same physical frame
        let ppte = pte_of(&parent, va);
        let cpte = pte_of(&child, va);
        assert_eq!(ppte, cpte);
        assert_eq!(ppte & PTE_W, 0);
        assert_ne!(ppte & PTE_COW, 0);
        assert_ne!(ppte & PTE_P, 0);

        // the child's frame reads equal to the parent's
        let mut got = [0u8; 22];
        read_user(&child, va, &mut got);
        assert_eq!(&got, b"original page contents");

        // the child is runnable with the parent's frame, RAX zeroed
        let ctx = sched::runnable_ctx(child_pid).unwrap();
        assert_eq!(ctx.tf[TF_RAX], 0);
        assert_eq!(ctx.tf[crate::kernel::trap::TF_RSP], 0x7777);
        assert_eq!(
            ctx.p_pmap,
            Some(child.inner.lock().pmap())
        );
    }

    #[test]
    fn fork_tracks_shared_frames_in_the_child_maps() {
        mount_testfs();
        let parent = uproc("tracker");
        let va = USERMIN + 0xb0_0000;
        let pa = map_user_page(&parent, va);
        let mut tf = TrapFrame::zeroed();
        tf[TF_RAX] = SYS_FORK;
        syscall(parent.pid(), &mut tf);
        let child = crate::kernel::process::proc_get(tf[TF_RAX]);
        let ci = child.inner.lock();
        assert!(ci.pages.contains_key(&pa.as_u64()));
        assert_eq!(ci.upages.get(&pa.as_u64()), Some(&va));
    }

    #[test]
    fn cow_fault_gives_the_writer_a_private_page() {
        mount_testfs();
        let parent = uproc("cow");
        let va = USERMIN + 0xc0_0000;
        map_user_page(&parent, va);
        write_user(&parent, va, b"shared");

        let mut tf = TrapFrame::zeroed();
        tf[TF_RAX] = SYS_FORK;
        syscall(parent.pid(), &mut tf);
        let child = crate::kernel::process::proc_get(tf[TF_RAX]);
        let shared_pte = pte_of(&child, va);

        // the child stores to the page and faults
        crate::kernel::trap::dispatch::handle_pgfault(&fault_record(child.pid(), va + 3));

        let cpte = pte_of(&child, va);
        let ppte = pte_of(&parent, va);
        // writer: fresh frame, writable, no longer COW
        assert_ne!(cpte & PTE_ADDR, shared_pte & PTE_ADDR);
        assert_ne!(cpte & PTE_W, 0);
        assert_eq!(cpte & PTE_COW, 0);
        // the other side still points at the shared frame, untouched
        assert_eq!(ppte, shared_pte);

        // contents were copied, then diverge
        let mut got = [0u8; 6];
        read_user(&child, va, &mut got);
        assert_eq!(&got, b"shared");
        write_user(&child, va, b"child!");
        read_user(&parent, va, &mut got);
        assert_eq!(&got, b"shared");
        read_user(&child, va, &mut got);
        assert_eq!(&got, b"child!");

        assert!(sched::is_runnable(child.pid()));
    }

    #[test]
    fn faults_outside_cow_entries_kill_the_process() {
        mount_testfs();
        let p = uproc("segv");
        let va = USERMIN + 0xd0_0000;
        map_user_page(&p, va); // present, writable, not COW
        crate::kernel::trap::dispatch::handle_pgfault(&fault_record(p.pid(), va));
        assert!(p.dead());

        let q = uproc("segv2");
        let pid = q.pid();
        crate::kernel::trap::dispatch::handle_pgfault(&fault_record(pid, USERMIN + 0xe0_0000));
        assert!(q.dead());
    }

    #[test]
    #[should_panic(expected = "kernel page marked COW")]
    fn kernel_range_cow_is_fatal() {
        mount_testfs();
        let p = uproc("kcow");
        let kva = mkva(0x20, 0, 0, 1);
        {
            let mut inner = p.inner.lock();
            let pmap = inner.pmap();
            let pte = pmap_walk(pmap, kva, true, PTE_W, Some(&mut inner.pages)).unwrap();
            unsafe { *pte = 0x1000 | PTE_P | PTE_COW };
        }
        crate::kernel::trap::dispatch::handle_pgfault(&fault_record(p.pid(), kva));
    }

    #[test]
    fn exec_builds_a_ring3_image() {
        mount_testfs();
        let entry = USERMIN + 0x40_0100;
        let vaddr = USERMIN + 0x40_0000;
        // 6 file bytes, memsz spilling into a second (BSS) page
        let img = mkimage(entry, vaddr, PF_W, b"CODE!!", 0x1200);
        let (proc, tf) = exec_elf(&img, String::from("/bin/demo")).unwrap();

        assert_eq!(tf[TF_RIP], entry);
        assert_eq!(tf[TF_RSP], ustack_top() - 8);
        assert_eq!(tf[TF_CS], 0x23);
        assert_eq!(tf[TF_SS], 0x2b);
        assert_ne!(tf[TF_RFLAGS] & TF_FL_IF, 0);

        let inner = proc.inner.lock();
        let pmap = inner.pmap();
        // the stack page sits just below the stack top, user-writable
        let spte = pmap_walk(pmap, ustack_top() - PGSIZE as u64, false, 0, None).unwrap();
        let spte = unsafe { *spte };
        assert_ne!(spte & PTE_U, 0);
        assert_ne!(spte & PTE_W, 0);
        // segment pages mapped, BSS zeroed
        assert!(is_mapped(pmap, vaddr, 0x1200));
        drop(inner);
        let mut got = [0u8; 6];
        read_user(&proc, vaddr, &mut got);
        assert_eq!(&got, b"CODE!!");
        let mut bss = [0xffu8; 8];
        read_user(&proc, vaddr + 0x1000, &mut bss);
        assert_eq!(bss, [0u8; 8]);
        // the copy self-maps like every address space
        let rec = unsafe { *pte_at(pmap, VREC) };
        assert_eq!(rec & PTE_ADDR, pmap.as_u64());
    }

    #[test]
    fn execv_pulls_the_image_through_the_filesystem() {
        let fsys = mount_testfs();
        let entry = USERMIN + 0x41_0000;
        let img = mkimage(entry, entry, 0, b"\x90\x90", 0x10);
        fsys.add_file(&["scenario-exec", "bin"], &img);
        let path = [String::from("scenario-exec"), String::from("bin")];
        assert_eq!(sys_execv(&path, &[]), 0);
    }

    #[test]
    fn execv_propagates_open_failures_and_rejects_garbage() {
        mount_testfs();
        let missing = [String::from("scenario-exec"), String::from("nope")];
        assert_eq!(
            sys_execv(&missing, &[]),
            crate::kernel::syscall::ENOENT
        );

        let fsys = mount_testfs();
        fsys.add_file(&["scenario-exec", "junk"], b"this is not an image");
        let junk = [String::from("scenario-exec"), String::from("junk")];
        assert_eq!(sys_execv(&junk, &[]), EINVAL);
    }
}
