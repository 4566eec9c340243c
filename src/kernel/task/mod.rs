// src/kernel/task/mod.rs
//! Cooperative kernel tasks
//!
//! Every trap handler, device daemon, and the dispatcher itself is an
//! ordinary task on the [`executor`]. Tasks may block on channels and
//! locks and be polled from any worker; interrupt context is *not* a
//! task and never touches any of this.

pub mod executor;

pub use executor::{poll_runtime, spawn_task, Executor, TaskId, RUNTIME};

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Cooperatively give up the worker: resolves on the next poll.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
