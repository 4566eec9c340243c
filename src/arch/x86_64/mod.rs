// src/arch/x86_64/mod.rs
//! x86-64 CPU and platform primitives
//!
//! Everything that touches privileged state (CR2, TLB, LAPIC MMIO, raw
//! serial) is compiled for bare-metal targets only; hosted builds get
//! inert stand-ins so the kernel logic above this layer stays exercisable.

pub mod pic;
pub mod port;

use crate::arch::Cpu;

/// x86-64 implementation of the [`Cpu`] trait.
pub struct X86Cpu;

impl Cpu for X86Cpu {
    fn halt() {
        #[cfg(target_os = "none")]
        x86_64::instructions::hlt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }

    fn disable_interrupts() {
        #[cfg(target_os = "none")]
        x86_64::instructions::interrupts::disable();
    }

    fn enable_interrupts() {
        #[cfg(target_os = "none")]
        x86_64::instructions::interrupts::enable();
    }

    fn are_interrupts_enabled() -> bool {
        #[cfg(target_os = "none")]
        return x86_64::instructions::interrupts::are_enabled();
        #[cfg(not(target_os = "none"))]
        return false;
    }
}

/// Local APIC MMIO base. Identity-mapped with caching disabled at boot.
pub const LAPIC_BASE: u64 = 0xfee0_0000;

/// Read the local APIC id of the executing CPU.
///
/// Safe to call with interrupts cleared; performs a single MMIO read.
/// Hosted builds report CPU 0.
#[inline]
pub fn lapic_id() -> usize {
    #[cfg(target_os = "none")]
    // SAFETY: the LAPIC id register is a read-only MMIO word present on
    // every x86-64 CPU; the page is mapped with caching disabled at boot.
    unsafe {
        return (((LAPIC_BASE + 0x20) as *const u32).read_volatile() >> 24) as usize;
    }
    #[cfg(not(target_os = "none"))]
    return 0;
}

/// Write the LAPIC interrupt command register.
///
/// The high word selects the destination and must be visible before the
/// low word, whose write triggers the IPI; both stores are volatile and
/// separated by a fence.
#[inline]
pub fn lapic_icr_write(hi: u32, low: u32) {
    #[cfg(target_os = "none")]
    // SAFETY: ICR high/low are MMIO words; the high word must land
    // first, the low word commits the send.
    unsafe {
        ((LAPIC_BASE + 0x310) as *mut u32).write_volatile(hi);
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
        ((LAPIC_BASE + 0x300) as *mut u32).write_volatile(low);
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (hi, low);
    }
}

/// Read CR2, the faulting address of the most recent page fault.
#[inline]
pub fn read_cr2() -> u64 {
    #[cfg(target_os = "none")]
    return x86_64::registers::control::Cr2::read_raw();
    #[cfg(not(target_os = "none"))]
    return 0;
}

/// Invalidate the TLB entry for one virtual address.
#[inline]
pub fn invlpg(va: u64) {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(va));
    #[cfg(not(target_os = "none"))]
    {
        let _ = va;
    }
}

/// Emit one number on the raw debug port.
///
/// This is the only diagnostic callable from interrupt context: no
/// allocation, no locks, no formatting machinery. Prints `0x`-prefixed
/// hex followed by a newline.
pub fn pnum(v: u64) {
    #[cfg(target_os = "none")]
    {
        const COM1: u16 = 0x3f8;
        let mut out = port::PortWriteOnly::<u8>::new(COM1);
        let mut putb = |b: u8| {
            // SAFETY: COM1 data port; transmit-ready is not polled because
            // this path runs with the machine possibly wedged.
            unsafe { out.write(b) };
        };
        putb(b'0');
        putb(b'x');
        for i in (0..16).rev() {
            let nib = ((v >> (i * 4)) & 0xf) as u8;
            putb(if nib < 10 { b'0' + nib } else { b'a' + nib - 10 });
        }
        putb(b'\n');
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = v;
    }
}
