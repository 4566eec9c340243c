// src/kernel/driver/keyboard.rs
//! Keyboard daemon
//!
//! The canonical interrupt-driven device: a long-lived task owns the
//! controller and multiplexes two event sources over channels. IRQ
//! signals arrive from the trap dispatcher; reader requests arrive
//! from [`kbd_get`]. The request channel is only selectable while the
//! accumulator holds bytes - a reader cannot be served input that does
//! not exist yet - which gives reads their blocking contract for free.

use alloc::vec::Vec;
use core::future::Future;
use core::task::Poll;
use spin::{Lazy, Once};

use crate::arch::pic;
use crate::arch::x86_64::port::PortReadOnly;
use crate::kernel::ipc::Channel;
use crate::kernel::task::spawn_task;
use crate::kernel::trap::IRQ_KBD;

/// Scancode set 1 to byte, the usual US layout. Zero means the code
/// does not produce input (releases, modifiers, extended prefixes).
#[rustfmt::skip]
const KEYMAP: [u8; 84] = [
    0,    0x1b, b'1', b'2', b'3', b'4', b'5', b'6',  // 0x00
    b'7', b'8', b'9', b'0', b'-', b'=', 0x08, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i',  // 0x10
    b'o', b'p', b'[', b']', b'\n', 0,   b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';',  // 0x20
    b'\'', b'`', 0,   b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0,    b'*',  // 0x30
    0,    b' ', 0,    0,    0,    0,    0,    0,
    0,    0,    0,    0,    0,    0,    0,    b'7',  // 0x40
    b'8', b'9', b'-', b'4', b'5', b'6', b'+', b'1',
    b'2', b'3', b'0', b'.',                          // 0x50
];

/// Where scancodes come from. The production source is the 8042 port
/// pair; tests substitute a scripted one.
pub trait ScancodeSource: Send + 'static {
    /// Whether the controller has a byte ready (the input-buffer-full
    /// bit of the status port).
    fn ready(&mut self) -> bool;
    /// Read one scancode.
    fn read(&mut self) -> u8;
    /// Discard any pending byte at init time.
    fn flush(&mut self) {}
}

/// The PS/2 controller's status and data ports.
pub struct I8042 {
    status: PortReadOnly<u8>,
    data: PortReadOnly<u8>,
}

impl I8042 {
    /// Handle onto the fixed legacy ports.
    pub const fn new() -> Self {
        Self {
            status: PortReadOnly::new(0x64),
            data: PortReadOnly::new(0x60),
        }
    }
}

impl Default for I8042 {
    fn default() -> Self {
        Self::new()
    }
}

impl ScancodeSource for I8042 {
    fn ready(&mut self) -> bool {
        // SAFETY: standard PC/AT status port read.
        unsafe { self.status.read() & 1 != 0 }
    }

    fn read(&mut self) -> u8 {
        // SAFETY: standard PC/AT data port read.
        unsafe { self.data.read() }
    }

    fn flush(&mut self) {
        let _ = self.read();
    }
}

struct Cons {
    /// IRQ signals from the trap dispatcher.
    kbd_int: Channel<()>,
    /// Byte-count requests from readers.
    reqc: Channel<usize>,
    /// Responses back to readers.
    reader: Channel<Vec<u8>>,
}

static CONS: Lazy<Cons> = Lazy::new(|| Cons {
    kbd_int: Channel::new(16),
    reqc: Channel::new(16),
    reader: Channel::new(16),
});

static KBD_INIT: Once<()> = Once::new();

/// Start the keyboard daemon over `src` and unmask its IRQ.
pub fn kbd_init<S: ScancodeSource>(mut src: S) {
    KBD_INIT.call_once(|| {
        src.flush();
        spawn_task(kbd_daemon(src));
        pic::irq_unmask(IRQ_KBD);
    });
}

/// Signal the daemon that its IRQ fired; the keyboard trap handler's
/// whole body.
pub(crate) async fn kbd_irq() {
    CONS.kbd_int.send(()).await;
}

/// Read keyboard input: blocks for at least one byte, returns at most
/// `cnt`.
pub async fn kbd_get(cnt: usize) -> Vec<u8> {
    CONS.reqc.send(cnt).await;
    CONS.reader.recv().await
}

enum Event {
    Irq,
    Req(usize),
}

/// Wait for the next daemon event. The request branch only exists
/// while `serve` holds.
fn next_event<'a>(
    irq: &'a Channel<()>,
    req: &'a Channel<usize>,
    serve: bool,
) -> impl Future<Output = Event> + 'a {
    core::future::poll_fn(move |cx| {
        if let Poll::Ready(()) = irq.poll_recv(cx) {
            return Poll::Ready(Event::Irq);
        }
        if serve {
            if let Poll::Ready(l) = req.poll_recv(cx) {
                return Poll::Ready(Event::Req(l));
            }
        }
        Poll::Pending
    })
}

async fn kbd_daemon<S: ScancodeSource>(mut src: S) {
    let mut data: Vec<u8> = Vec::new();
    loop {
        let serve = !data.is_empty();
        match next_event(&CONS.kbd_int, &CONS.reqc, serve).await {
            Event::Irq => {
                if !src.ready() {
                    continue;
                }
                let sc = src.read() as usize;
                if let Some(&c) = KEYMAP.get(sc) {
                    if c != 0 {
                        data.push(c);
                    }
                }
            }
            Event::Req(l) => {
                let l = core::cmp::min(l, data.len());
                let out = data[..l].to_vec();
                data.clear();
                CONS.reader.send(out).await;
            }
        }
    }
}
