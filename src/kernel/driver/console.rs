// src/kernel/driver/console.rs
//! Console output
//!
//! One byte-at-a-time sink behind a trait, so the same `putc` path
//! feeds VGA text memory on hardware and a capture buffer under test.
//! Writes from user space (stdout/stderr) land here with the kernel's
//! one text attribute.

use alloc::boxed::Box;
use core::fmt;
use spin::Mutex;

/// Text attribute for everything the kernel prints: white on blue.
pub const CONSOLE_ATTR: u8 = 0x17;

/// A console back end.
pub trait ConsoleSink: Send {
    /// Emit one byte with the given text attribute.
    fn putc(&mut self, b: u8, attr: u8);
}

static SINK: Mutex<Option<Box<dyn ConsoleSink>>> = Mutex::new(None);

/// Install the console back end. Bare-metal init installs
/// [`VgaText`]; until something is installed, output is dropped.
pub fn set_sink(sink: Box<dyn ConsoleSink>) {
    *SINK.lock() = Some(sink);
}

/// Emit one byte on the console.
pub fn putc(b: u8) {
    if let Some(sink) = SINK.lock().as_mut() {
        sink.putc(b, CONSOLE_ATTR);
    }
}

struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            putc(b);
        }
        Ok(())
    }
}

/// Formatted output to the console sink.
pub fn write_fmt(args: fmt::Arguments) {
    use fmt::Write;
    let _ = ConsoleWriter.write_fmt(args);
}

/// VGA text-mode back end: 80x25 cells at the legacy address.
#[cfg(target_os = "none")]
pub struct VgaText {
    row: usize,
    col: usize,
}

#[cfg(target_os = "none")]
impl VgaText {
    const COLS: usize = 80;
    const ROWS: usize = 25;
    const BASE: *mut u16 = 0xb8000 as *mut u16;

    /// A writer starting at the top of the screen.
    pub const fn new() -> Self {
        Self { row: 0, col: 0 }
    }

    fn cell(&self) -> *mut u16 {
        // SAFETY: row/col stay inside the 80x25 window.
        unsafe { Self::BASE.add(self.row * Self::COLS + self.col) }
    }

    fn newline(&mut self) {
        self.col = 0;
        if self.row + 1 < Self::ROWS {
            self.row += 1;
            return;
        }
        // scroll: move rows up one, blank the last
        // SAFETY: all addresses stay inside the text buffer.
        unsafe {
            core::ptr::copy(
                Self::BASE.add(Self::COLS),
                Self::BASE,
                Self::COLS * (Self::ROWS - 1),
            );
            for c in 0..Self::COLS {
                Self::BASE
                    .add(Self::COLS * (Self::ROWS - 1) + c)
                    .write_volatile((CONSOLE_ATTR as u16) << 8 | b' ' as u16);
            }
        }
    }
}

#[cfg(target_os = "none")]
impl ConsoleSink for VgaText {
    fn putc(&mut self, b: u8, attr: u8) {
        if b == b'\n' {
            self.newline();
            return;
        }
        // SAFETY: `cell` is inside the text buffer.
        unsafe {
            self.cell().write_volatile((attr as u16) << 8 | b as u16);
        }
        self.col += 1;
        if self.col == Self::COLS {
            self.newline();
        }
    }
}

#[cfg(test)]
pub use capture::{test_capture, Capture};
