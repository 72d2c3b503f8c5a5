use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use slab::Slab;

use super::waker::TaskHeader;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Sentinel stored in [`TaskHeader::key`] before the loop has slotted the task.
pub(crate) const UNSLOTTED: usize = usize::MAX;

/// State of a single task slot.
enum TaskSlot {
    /// Task is parked (waiting for a wakeup).
    Parked(BoxFuture),
    /// Task is ready to be polled.
    Ready(BoxFuture),
    /// Task has been taken out of the slab for polling.
    Running,
}

struct Task {
    header: Arc<TaskHeader>,
    slot: TaskSlot,
}

/// Slab of live tasks owned by one event loop.
///
/// Keys are recycled; a wakeup is matched against the task header so a
/// stale waker for a reused key never polls the wrong future.
pub(crate) struct TaskSlab {
    tasks: Slab<Task>,
}

impl TaskSlab {
    pub(crate) fn new() -> Self {
        TaskSlab { tasks: Slab::new() }
    }

    /// Insert a freshly spawned task. It starts Ready for its first poll.
    pub(crate) fn insert(&mut self, header: Arc<TaskHeader>, future: BoxFuture) -> usize {
        let key = self.tasks.insert(Task {
            header: header.clone(),
            slot: TaskSlot::Ready(future),
        });
        header.key.store(key, Ordering::Release);
        key
    }

    /// Take a Ready task out for polling. Returns None if the slot is
    /// not in the Ready state.
    pub(crate) fn take_ready(&mut self, key: usize) -> Option<(Arc<TaskHeader>, BoxFuture)> {
        let task = self.tasks.get_mut(key)?;
        match std::mem::replace(&mut task.slot, TaskSlot::Running) {
            TaskSlot::Ready(fut) => Some((task.header.clone(), fut)),
            other => {
                task.slot = other;
                None
            }
        }
    }

    /// Park a task back after it returned Poll::Pending.
    pub(crate) fn park(&mut self, key: usize, future: BoxFuture) {
        if let Some(task) = self.tasks.get_mut(key) {
            task.slot = TaskSlot::Parked(future);
        }
    }

    /// Mark a Parked task as Ready. Returns true if the task was parked
    /// and now needs to be queued.
    pub(crate) fn wake(&mut self, key: usize, header: &Arc<TaskHeader>) -> bool {
        let Some(task) = self.tasks.get_mut(key) else {
            return false;
        };
        if !Arc::ptr_eq(&task.header, header) {
            return false;
        }
        match std::mem::replace(&mut task.slot, TaskSlot::Running) {
            TaskSlot::Parked(fut) => {
                task.slot = TaskSlot::Ready(fut);
                true
            }
            other => {
                task.slot = other;
                false
            }
        }
    }

    /// Whether `key` currently holds the task identified by `header`.
    pub(crate) fn holds(&self, key: usize, header: &Arc<TaskHeader>) -> bool {
        self.tasks
            .get(key)
            .is_some_and(|task| Arc::ptr_eq(&task.header, header))
    }

    /// Remove a task (completed or cancelled), dropping its future.
    pub(crate) fn remove(&mut self, key: usize) -> Option<Arc<TaskHeader>> {
        if self.tasks.contains(key) {
            let task = self.tasks.remove(key);
            Some(task.header)
        } else {
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Drop every remaining task.
    pub(crate) fn clear(&mut self) -> usize {
        let n = self.tasks.len();
        for (_, task) in self.tasks.iter() {
            task.header.done.store(true, Ordering::Release);
        }
        self.tasks.clear();
        n
    }
}

/// Handle to a spawned task. Dropping the handle detaches the task.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) header: Arc<TaskHeader>,
}

impl TaskHandle {
    /// Cancel the task. The future is dropped at its current suspension
    /// point the next time the loop processes its queue. No-op if the task
    /// already completed.
    pub fn cancel(&self) {
        self.header.cancel();
    }

    /// Whether the task ran to completion or was dropped.
    pub fn is_finished(&self) -> bool {
        self.header.done.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Live-task accounting shared between the handle and the loop.
pub(crate) struct TaskCount {
    live: AtomicUsize,
    limit: usize,
}

impl TaskCount {
    pub(crate) fn new(limit: usize) -> Self {
        TaskCount {
            live: AtomicUsize::new(0),
            limit,
        }
    }

    /// Reserve a slot for a new task. Returns false at the limit.
    pub(crate) fn acquire(&self) -> bool {
        if self.limit == 0 {
            self.live.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok()
    }

    pub(crate) fn release(&self, n: usize) {
        self.live.fetch_sub(n, Ordering::AcqRel);
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}
