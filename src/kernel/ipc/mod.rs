//! In-process message passing for kernel tasks

pub mod channel;

pub use channel::{Channel, RecvFuture, SendFuture};
