// src/arch/x86_64/pic.rs
//! 8259 programmable interrupt controller bring-up
//!
//! The board has two cascaded 8259-compatible PICs. They are programmed
//! once at boot for auto-EOI operation with all IRQs masked; drivers
//! unmask their own line via [`irq_unmask`]. All IRQs are delivered to
//! CPU 0 until redirected.

use core::sync::atomic::{AtomicU16, Ordering};

use crate::kernel::trap::IRQ_BASE;

const PIC1: u16 = 0x20;
const PIC1_DATA: u16 = PIC1 + 1;
const PIC2: u16 = 0xa0;
const PIC2_DATA: u16 = PIC2 + 1;

/// Current IRQ mask, one bit per line across both PICs. All masked at reset.
static INTMASK: AtomicU16 = AtomicU16::new(0xffff);

/// Write one byte to a PIC port, with a settle delay.
///
/// Hosted builds compile this away; the mask bookkeeping above is all
/// that remains observable.
fn outb(port: u16, val: u8) {
    #[cfg(target_os = "none")]
    {
        use super::port::PortWriteOnly;
        let mut p = PortWriteOnly::<u8>::new(port);
        let mut settle = PortWriteOnly::<u8>::new(0x80);
        // SAFETY: PIC command/data ports; the 0x80 write is the
        // conventional POST-port delay.
        unsafe {
            p.write(val);
            settle.write(0);
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (port, val);
    }
}

/// Program both PICs: vector base [`IRQ_BASE`], cascaded mode, auto-EOI.
///
/// Must run once, with interrupts cleared, before any IRQ is unmasked.
pub fn init_8259() {
    // master: icw1 (icw4 required), icw2 vector base, icw3 cascade on
    // line 2, icw4 auto-EOI in 8086 mode
    outb(PIC1, 0x11);
    outb(PIC1_DATA, IRQ_BASE as u8);
    outb(PIC1_DATA, 4);
    outb(PIC1_DATA, 3);

    // slave: same dance with its cascade identity
    outb(PIC2, 0x11);
    outb(PIC2_DATA, IRQ_BASE as u8 + 8);
    outb(PIC2_DATA, 2);
    outb(PIC2_DATA, 3);

    // ocw3: special mask mode, then select the IRQ register for reads
    outb(PIC1, 0x68);
    outb(PIC1, 0x0a);
    outb(PIC2, 0x68);
    outb(PIC2, 0x0a);

    // enable the slave's cascade line
    irq_unmask(2);
}

/// Unmask one IRQ line on the PIC pair.
///
/// # Panics
///
/// Panics on an out-of-range line number.
pub fn irq_unmask(irq: u8) {
    assert!(irq <= 16, "irq {irq} out of range");
    let mask = INTMASK.fetch_and(!(1u16 << irq), Ordering::SeqCst) & !(1u16 << irq);
    outb(PIC1_DATA, mask as u8);
    outb(PIC2_DATA, (mask >> 8) as u8);
}

/// The IRQ mask currently programmed into the PIC pair.
pub fn irq_mask() -> u16 {
    INTMASK.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmask_clears_one_line() {
        irq_unmask(1);
        assert_eq!(irq_mask() & (1 << 1), 0);
        irq_unmask(14);
        assert_eq!(irq_mask() & (1 << 14), 0);
    }
}
