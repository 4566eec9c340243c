// src/kernel/driver/serial.rs
//! 16550 serial output for the kernel log
//!
//! Debug output only ever goes here, never to the console. Hosted
//! builds discard it.

use core::fmt;

#[cfg(target_os = "none")]
mod uart {
    use crate::arch::x86_64::port::{Port, PortWriteOnly};
    use spin::Mutex;

    const COM1: u16 = 0x3f8;

    pub struct SerialPort {
        initialized: bool,
    }

    impl SerialPort {
        const fn new() -> Self {
            Self { initialized: false }
        }

        fn init(&mut self) {
            let mut out = |off: u16, v: u8| {
                let mut p = PortWriteOnly::<u8>::new(COM1 + off);
                // SAFETY: COM1 register bank.
                unsafe { p.write(v) };
            };
            out(1, 0x00); // interrupts off
            out(3, 0x80); // DLAB
            out(0, 0x03); // 38400 baud, divisor low
            out(1, 0x00); // divisor high
            out(3, 0x03); // 8n1
            out(2, 0xc7); // FIFO on, cleared
            self.initialized = true;
        }

        pub fn write_byte(&mut self, b: u8) {
            if !self.initialized {
                self.init();
            }
            let lsr = Port::<u8>::new(COM1 + 5);
            // SAFETY: polling the line-status register, then one data
            // write.
            unsafe {
                while lsr.read() & 0x20 == 0 {
                    core::hint::spin_loop();
                }
                let mut data = PortWriteOnly::<u8>::new(COM1);
                data.write(b);
            }
        }
    }

    pub static SERIAL1: Mutex<SerialPort> = Mutex::new(SerialPort::new());
}

struct SerialWriter;

impl fmt::Write for SerialWriter {
    #[cfg(target_os = "none")]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut port = uart::SERIAL1.lock();
        for b in s.bytes() {
            port.write_byte(b);
        }
        Ok(())
    }

    #[cfg(not(target_os = "none"))]
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        Ok(())
    }
}

/// Formatted output to the serial log.
pub fn write_fmt(args: fmt::Arguments) {
    use fmt::Write;
    let _ = SerialWriter.write_fmt(args);
}
