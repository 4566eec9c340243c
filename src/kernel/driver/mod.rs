// src/kernel/driver/mod.rs
//! Device drivers and output glue

pub mod console;
pub mod ide;
pub mod keyboard;
pub mod serial;

use core::fmt;

/// Back end of the `console_print!` macros.
pub fn write_console(args: fmt::Arguments) {
    console::write_fmt(args);
}

/// Back end of the `debug_print!` macros: serial on bare metal,
/// discarded on hosted builds.
pub fn write_debug(args: fmt::Arguments) {
    serial::write_fmt(args);
}
