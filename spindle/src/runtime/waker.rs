use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::Wake;

use crossbeam_channel::Sender;

use super::task::{BoxFuture, UNSLOTTED};

/// Messages delivered to an event loop from its handles and wakers.
pub(crate) enum Message {
    /// Insert a new task into the slab.
    Spawn(Arc<TaskHeader>, BoxFuture),
    /// Requeue a parked task (or drop it if cancelled).
    Wake(Arc<TaskHeader>),
    /// Run a closure on the loop thread.
    Post(Box<dyn FnOnce() + Send>),
    /// Unblock a waiting loop so it re-reads timers and the root future.
    Nudge,
    /// Leave `run()`.
    Stop,
}

/// Per-task state shared by the loop, the task's wakers and its
/// [`TaskHandle`](super::TaskHandle).
///
/// The waker is the header itself: waking sends the header back to the
/// owning loop over its channel, so wakes are safe from any thread.
pub(crate) struct TaskHeader {
    pub(crate) key: AtomicUsize,
    /// Set while a Wake message is in flight; coalesces repeated wakes.
    queued: AtomicBool,
    pub(crate) cancelled: AtomicBool,
    pub(crate) done: AtomicBool,
    tx: Sender<Message>,
}

impl TaskHeader {
    pub(crate) fn new(tx: Sender<Message>) -> Self {
        TaskHeader {
            key: AtomicUsize::new(UNSLOTTED),
            queued: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            tx,
        }
    }

    /// Called by the loop right before polling, so wakes issued during the
    /// poll are delivered.
    pub(crate) fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(self: &Arc<Self>) {
        if self.done.load(Ordering::Acquire) || self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        // Bypass coalescing: the loop must see the cancel even if a wake is queued.
        let _ = self.tx.send(Message::Wake(self.clone()));
    }
}

impl Wake for TaskHeader {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.done.load(Ordering::Acquire) || self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        // A closed channel means the loop is gone; nothing left to wake.
        let _ = self.tx.send(Message::Wake(self.clone()));
    }
}

/// Waker for the root future driven by `block_on`.
pub(crate) struct RootWaker {
    woken: AtomicBool,
    tx: Sender<Message>,
}

impl RootWaker {
    pub(crate) fn new(tx: Sender<Message>) -> Self {
        RootWaker {
            woken: AtomicBool::new(true),
            tx,
        }
    }

    /// Consume a pending wakeup.
    pub(crate) fn take(&self) -> bool {
        self.woken.swap(false, Ordering::AcqRel)
    }
}

impl Wake for RootWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.woken.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Message::Nudge);
        }
    }
}
