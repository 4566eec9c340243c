// src/kernel/driver/ide.rs
//! IDE request/ack plumbing
//!
//! The block driver itself lives with the filesystem outside this
//! crate; what the kernel core owns is the channel shape between them:
//! requests go down [`IDE_REQUEST`], the disk daemon parks on
//! [`IDE_INT_DONE`], and the `INT_DISK` trap handler is one signal on
//! that channel.

use alloc::boxed::Box;
use spin::Lazy;

use crate::kernel::ipc::Channel;

/// Bytes per disk sector.
pub const SECTOR_SIZE: usize = 512;

/// One block request: submitted on [`IDE_REQUEST`], acknowledged on
/// its own `ack` channel once the transfer completes.
pub struct IdeRequest {
    /// Block number.
    pub block: u64,
    /// Write (true) or read (false).
    pub write: bool,
    /// The sector buffer: read target or write source.
    pub data: Box<[u8; SECTOR_SIZE]>,
    /// Completion signal back to the submitter.
    pub ack: Channel<()>,
}

/// Build a request with a zeroed buffer unless one is supplied.
pub fn idereq_new(block: u64, write: bool, data: Option<Box<[u8; SECTOR_SIZE]>>) -> IdeRequest {
    IdeRequest {
        block,
        write,
        data: data.unwrap_or_else(|| Box::new([0; SECTOR_SIZE])),
        ack: Channel::new(2),
    }
}

/// The request queue into the block driver.
pub static IDE_REQUEST: Lazy<Channel<IdeRequest>> = Lazy::new(|| Channel::new(16));

/// Interrupt notifications for the block driver's daemon.
pub static IDE_INT_DONE: Lazy<Channel<()>> = Lazy::new(|| Channel::new(16));

/// Signal the disk daemon; the disk trap handler's whole body.
pub(crate) async fn disk_irq() {
    IDE_INT_DONE.send(()).await;
}
