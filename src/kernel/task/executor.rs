// src/kernel/task/executor.rs
//! Future executor
//!
//! Runs the kernel's cooperative tasks over a lock-free wake queue.
//! Wakers push task ids onto the queue; workers pop and poll. There is
//! no preemption - a task runs until it returns `Pending` or
//! completes, which is exactly the discipline the rest of the kernel
//! assumes.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::task::Wake;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicU64, Ordering};
use core::task::{Context, Poll, Waker};
use crossbeam_queue::ArrayQueue;
use spin::{Lazy, Mutex};

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// A fresh, unique id.
    pub fn new() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// One spawned task: a boxed future plus its id.
pub struct Task {
    id: TaskId,
    future: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl Task {
    /// Wrap a future into a task.
    pub fn new(future: impl Future<Output = ()> + 'static + Send) -> Self {
        Self {
            id: TaskId::new(),
            future: Box::pin(future),
        }
    }

    fn from_pinned(future: Pin<Box<dyn Future<Output = ()> + Send>>) -> Self {
        Self {
            id: TaskId::new(),
            future,
        }
    }

    fn poll(&mut self, context: &mut Context) -> Poll<()> {
        self.future.as_mut().poll(context)
    }
}

struct TaskWaker {
    task_id: TaskId,
    task_queue: Arc<ArrayQueue<TaskId>>,
}

impl TaskWaker {
    fn waker(self: Arc<Self>) -> Waker {
        Waker::from(self)
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // queue full: the id is dropped, but then something else is
        // already scheduled to run and will re-wake
        let _ = self.task_queue.push(self.task_id);
    }
}

const DEFAULT_QUEUE_SIZE: usize = 256;

/// The executor: a wake queue of task ids plus the task map.
pub struct Executor {
    task_queue: Arc<ArrayQueue<TaskId>>,
    tasks: Mutex<BTreeMap<TaskId, Task>>,
}

impl Executor {
    /// An executor with the default queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_SIZE)
    }

    /// An executor with a specific wake-queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            task_queue: Arc::new(ArrayQueue::new(capacity)),
            tasks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Add a task and schedule it immediately.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static + Send) -> TaskId {
        self.spawn_task(Task::new(future))
    }

    /// Add an already-boxed task and schedule it immediately.
    pub fn spawn_boxed(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) -> TaskId {
        self.spawn_task(Task::from_pinned(future))
    }

    fn spawn_task(&self, task: Task) -> TaskId {
        let task_id = task.id;
        self.tasks.lock().insert(task_id, task);
        let _ = self.task_queue.push(task_id);
        task_id
    }

    /// Poll one scheduled task.
    ///
    /// Returns `Some(true)` if it completed, `Some(false)` if it is
    /// still pending, `None` if nothing was scheduled.
    pub fn run_one(&self) -> Option<bool> {
        loop {
            let task_id = self.task_queue.pop()?;
            // stale ids happen: a waker can fire for a task that
            // completed in the meantime
            let Some(mut task) = self.tasks.lock().remove(&task_id) else {
                continue;
            };

            let waker = Arc::new(TaskWaker {
                task_id,
                task_queue: Arc::clone(&self.task_queue),
            })
            .waker();
            let mut context = Context::from_waker(&waker);

            return Some(match task.poll(&mut context) {
                Poll::Ready(()) => true,
                Poll::Pending => {
                    self.tasks.lock().insert(task_id, task);
                    false
                }
            });
        }
    }

    /// Run until the wake queue drains. Tasks parked on channels or
    /// locks stay in the map and come back via their wakers.
    ///
    /// Returns the number of tasks that completed.
    pub fn run_until_idle(&self) -> usize {
        let mut completed = 0;
        while let Some(was_completed) = self.run_one() {
            if was_completed {
                completed += 1;
            }
        }
        completed
    }

    /// Tasks currently alive, parked ones included.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Task ids waiting in the wake queue.
    pub fn queued_count(&self) -> usize {
        self.task_queue.len()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel-wide task runtime.
pub static RUNTIME: Lazy<Executor> = Lazy::new(Executor::new);

/// Spawn a task on [`RUNTIME`].
pub fn spawn_task(future: impl Future<Output = ()> + 'static + Send) -> TaskId {
    RUNTIME.spawn(future)
}

/// Poll one task on [`RUNTIME`]; the idle loop's step function.
pub fn poll_runtime() -> Option<bool> {
    RUNTIME.run_one()
}
