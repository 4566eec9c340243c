// src/kernel/ipc/channel.rs
//! Bounded channels between kernel tasks
//!
//! A lock-free ring carries the values; one waker slot per direction
//! parks the task waiting on the full or empty condition. That is all
//! the device daemons need: each channel has one producing task and
//! one consuming task at a time.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::future::Future;
use core::mem::MaybeUninit;
use core::pin::Pin;
use core::sync::atomic::{AtomicU32, Ordering};
use core::task::{Context, Poll, Waker};
use spin::Mutex;

/// Lock-free ring buffer; capacity must be a power of two and the
/// ring holds capacity - 1 values.
struct RingBuffer<T> {
    buffer: Vec<UnsafeCell<MaybeUninit<T>>>,
    /// Consumer index.
    head: AtomicU32,
    /// Producer index.
    tail: AtomicU32,
    mask: u32,
}

impl<T> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of 2");
        let mut buffer = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            buffer.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Self {
            buffer,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            mask: (capacity - 1) as u32,
        }
    }

    fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let next_tail = (tail + 1) & self.mask;
        if next_tail == head {
            return Err(value);
        }
        // SAFETY: the slot at `tail` is outside the published window.
        unsafe {
            (*self.buffer[tail as usize].get()).write(value);
        }
        self.tail.store(next_tail, Ordering::Release);
        Ok(())
    }

    fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: the slot at `head` was published by the release
        // store of tail.
        let value = unsafe { (*self.buffer[head as usize].get()).assume_init_read() };
        self.head.store((head + 1) & self.mask, Ordering::Release);
        Some(value)
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        ((tail.wrapping_sub(head)) & self.mask) as usize
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

// SAFETY: the ring is the standard SPSC construction; the waker slots
// are mutex-guarded.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

struct Shared<T> {
    ring: RingBuffer<T>,
    rx_waker: Mutex<Option<Waker>>,
    tx_waker: Mutex<Option<Waker>>,
    capacity: usize,
}

/// A bounded channel endpoint; clone to share between tasks.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send> Channel<T> {
    /// A channel holding up to `capacity - 1` values; `capacity` must
    /// be a power of two.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                ring: RingBuffer::new(capacity),
                rx_waker: Mutex::new(None),
                tx_waker: Mutex::new(None),
                capacity,
            }),
        }
    }

    /// Non-blocking send; hands the value back when the channel is
    /// full.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        self.shared.ring.push(value)?;
        if let Some(w) = self.shared.rx_waker.lock().take() {
            w.wake();
        }
        Ok(())
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<T> {
        let value = self.shared.ring.pop()?;
        if let Some(w) = self.shared.tx_waker.lock().take() {
            w.wake();
        }
        Some(value)
    }

    /// Poll-level receive: parks the calling task until a value
    /// arrives.
    pub fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<T> {
        if let Some(v) = self.try_recv() {
            return Poll::Ready(v);
        }
        *self.shared.rx_waker.lock() = Some(cx.waker().clone());
        // a send may have raced the waker registration
        match self.try_recv() {
            Some(v) => Poll::Ready(v),
            None => Poll::Pending,
        }
    }

    /// Send, waiting for space.
    pub fn send(&self, value: T) -> SendFuture<'_, T> {
        SendFuture {
            ch: self,
            value: Some(value),
        }
    }

    /// Receive, waiting for a value.
    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture { ch: self }
    }

    /// Values currently buffered.
    pub fn len(&self) -> usize {
        self.shared.ring.len()
    }

    /// Whether the channel holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Future of [`Channel::send`].
pub struct SendFuture<'a, T> {
    ch: &'a Channel<T>,
    value: Option<T>,
}

impl<T: Send + Unpin> Future for SendFuture<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let value = this.value.take().expect("polled after completion");
        match this.ch.try_send(value) {
            Ok(()) => Poll::Ready(()),
            Err(value) => {
                *this.ch.shared.tx_waker.lock() = Some(cx.waker().clone());
                // a recv may have raced the waker registration
                match this.ch.try_send(value) {
                    Ok(()) => Poll::Ready(()),
                    Err(value) => {
                        this.value = Some(value);
                        Poll::Pending
                    }
                }
            }
        }
    }
}

/// Future of [`Channel::recv`].
pub struct RecvFuture<'a, T> {
    ch: &'a Channel<T>,
}

impl<T: Send> Future for RecvFuture<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.ch.poll_recv(cx)
    }
}
