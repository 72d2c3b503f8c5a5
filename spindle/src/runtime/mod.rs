//! Single-threaded cooperative executor.
//!
//! An [`EventLoop`] owns a slab of tasks and a timer queue and runs them on
//! whichever thread calls [`EventLoop::run`] or [`EventLoop::block_on`] (the
//! loop's *affinity thread*). Everything else talks to it through a
//! [`LoopHandle`], which is `Send + Sync` and marshals work over a channel:
//!
//! - `task`: `TaskSlab` (slab of boxed futures) and `TaskHandle`
//! - `waker`: loop messages, per-task wakers, the `block_on` root waker
//! - `timer`: deadline-ordered timer queue shared under one mutex
//! - `select`: `select`, `join`, `timeout` combinators
//!
//! Wakes never poll inline: a waker only enqueues the task, and the loop
//! polls it on its next turn.

pub(crate) mod select;
pub(crate) mod task;
pub(crate) mod timer;
pub(crate) mod waker;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::{TASKS_ACTIVE, TASKS_CANCELLED, TASKS_COMPLETED, TASKS_SPAWNED};
use crate::promise::Promise;

pub use self::task::TaskHandle;
pub use self::timer::TimerId;
use self::task::{TaskCount, TaskSlab};
use self::timer::{TimerAction, TimerQueue};
use self::waker::{Message, RootWaker, TaskHeader};

/// State shared between a loop and all of its handles.
pub(crate) struct Shared {
    tx: Sender<Message>,
    timers: Mutex<TimerQueue>,
    tasks: TaskCount,
    affinity: Mutex<Option<ThreadId>>,
    config: Config,
}

impl Shared {
    fn send(&self, msg: Message) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::LoopStopped)
    }
}

/// A single-threaded event loop.
pub struct EventLoop {
    shared: Arc<Shared>,
    rx: Receiver<Message>,
    tasks: TaskSlab,
    ready: VecDeque<usize>,
    stop_requested: bool,
}

impl EventLoop {
    /// Build a loop from a validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = crossbeam_channel::unbounded();
        debug!(name = %config.name, max_tasks = config.max_tasks, "event loop created");
        Ok(EventLoop {
            shared: Arc::new(Shared {
                tx,
                timers: Mutex::new(TimerQueue::new()),
                tasks: TaskCount::new(config.max_tasks),
                affinity: Mutex::new(None),
                config,
            }),
            rx,
            tasks: TaskSlab::new(),
            ready: VecDeque::with_capacity(64),
            stop_requested: false,
        })
    }

    /// A cloneable handle for posting work onto this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run until [`LoopHandle::stop`] is called.
    pub fn run(&mut self) {
        self.enter();
        self.stop_requested = false;
        while !self.stop_requested {
            self.turn();
        }
        debug!(name = %self.shared.config.name, live = self.tasks.len(), "event loop stopped");
    }

    /// Drive `future` to completion on the current thread, running every
    /// other task of the loop while it is pending.
    pub fn block_on<F: Future>(&mut self, future: F) -> F::Output {
        self.enter();
        let root = Arc::new(RootWaker::new(self.shared.tx.clone()));
        let waker = Waker::from(root.clone());
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);
        loop {
            if root.take()
                && let Poll::Ready(out) = future.as_mut().poll(&mut cx)
            {
                return out;
            }
            self.turn();
        }
    }

    fn enter(&self) {
        *self.shared.affinity.lock() = Some(thread::current().id());
    }

    /// One loop iteration: drain messages, fire timers, poll the ready
    /// batch, then block until the next message or deadline if idle.
    fn turn(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.dispatch(msg);
        }
        self.fire_timers();
        self.poll_ready();
        if self.ready.is_empty() && !self.stop_requested {
            self.wait();
        }
    }

    fn wait(&mut self) {
        let deadline = self.shared.timers.lock().next_deadline();
        let msg = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    return;
                }
                match self.rx.recv_timeout(deadline - now) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return,
                }
            }
            // Shared holds a sender, so this only returns once a message arrives.
            None => match self.rx.recv() {
                Ok(msg) => msg,
                Err(_) => return,
            },
        };
        self.dispatch(msg);
    }

    fn dispatch(&mut self, msg: Message) {
        match msg {
            Message::Spawn(header, future) => {
                if header.is_cancelled() {
                    drop(future);
                    self.retire(&header, false);
                    return;
                }
                let key = self.tasks.insert(header, future);
                trace!(task = key, "task spawned");
                self.ready.push_back(key);
            }
            Message::Wake(header) => {
                let key = header.key.load(std::sync::atomic::Ordering::Acquire);
                if header.is_cancelled() {
                    if self.tasks.holds(key, &header) {
                        // Dropping the slab entry drops the future at its
                        // current suspension point.
                        self.tasks.remove(key);
                        self.retire(&header, false);
                    }
                } else if self.tasks.wake(key, &header) {
                    self.ready.push_back(key);
                }
            }
            Message::Post(f) => f(),
            Message::Nudge => {}
            Message::Stop => self.stop_requested = true,
        }
    }

    fn fire_timers(&mut self) {
        let fired = self.shared.timers.lock().expire(Instant::now());
        for action in fired {
            match action {
                TimerAction::Wake(waker) => waker.wake(),
                TimerAction::Run(f) => f(),
            }
        }
    }

    fn poll_ready(&mut self) {
        // Only the batch queued at the start of the turn; tasks woken while
        // polling run next turn, after messages and timers.
        for _ in 0..self.ready.len() {
            let Some(key) = self.ready.pop_front() else {
                break;
            };
            let Some((header, mut future)) = self.tasks.take_ready(key) else {
                continue;
            };
            if header.is_cancelled() {
                drop(future);
                self.tasks.remove(key);
                self.retire(&header, false);
                continue;
            }
            header.clear_queued();
            let waker = Waker::from(header.clone());
            let mut cx = Context::from_waker(&waker);
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    drop(future);
                    self.tasks.remove(key);
                    self.retire(&header, true);
                }
                Poll::Pending => self.tasks.park(key, future),
            }
        }
    }

    fn retire(&self, header: &TaskHeader, completed: bool) {
        header.done.store(true, std::sync::atomic::Ordering::Release);
        self.shared.tasks.release(1);
        TASKS_ACTIVE.decrement();
        if completed {
            TASKS_COMPLETED.increment();
        } else {
            TASKS_CANCELLED.increment();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let dropped = self.tasks.clear();
        // Futures still in flight on the channel are dropped with it.
        let queued = self
            .rx
            .try_iter()
            .filter(|msg| matches!(msg, Message::Spawn(..)))
            .count();
        let total = dropped + queued;
        if total > 0 {
            self.shared.tasks.release(total);
            TASKS_ACTIVE.sub(total as i64);
            TASKS_CANCELLED.add(total as u64);
            debug!(name = %self.shared.config.name, tasks = total, "event loop dropped with live tasks");
        }
    }
}

/// Cloneable, thread-safe handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    /// Run `f` on the loop thread during its next turn.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.send(Message::Post(Box::new(f)))
    }

    /// Run `f` on the loop thread once `delay` has elapsed.
    pub fn post_delayed<F>(&self, delay: Duration, f: F) -> Result<TimerId>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self
            .shared
            .timers
            .lock()
            .insert(Instant::now() + delay, TimerAction::Run(Box::new(f)));
        // The loop may be blocked on an older, later deadline.
        if let Err(e) = self.shared.send(Message::Nudge) {
            self.shared.timers.lock().cancel(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Cancel a timer from [`post_delayed`](Self::post_delayed). Returns
    /// false if it already fired or was cancelled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.shared.timers.lock().cancel(id)
    }

    /// A future that completes after `duration`. Dropping it cancels the timer.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep {
            shared: self.shared.clone(),
            deadline: Instant::now() + duration,
            timer: None,
        }
    }

    /// Spawn a task onto the loop. The task first runs on the loop's next
    /// turn; use [`TaskHandle::cancel`] to drop it early.
    pub fn spawn<F>(&self, future: F) -> Result<TaskHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.shared.tasks.acquire() {
            return Err(Error::TaskLimit);
        }
        let header = Arc::new(TaskHeader::new(self.shared.tx.clone()));
        let handle = TaskHandle {
            header: header.clone(),
        };
        if let Err(e) = self.shared.send(Message::Spawn(header, Box::pin(future))) {
            self.shared.tasks.release(1);
            return Err(e);
        }
        TASKS_SPAWNED.increment();
        TASKS_ACTIVE.increment();
        Ok(handle)
    }

    /// Hop onto the loop thread: run `f` there and complete the returned
    /// promise with its result.
    pub fn invoke<R, F>(&self, f: F) -> Promise<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce() -> Result<R> + Send + 'static,
    {
        let promise = Promise::pending();
        let completer = promise.clone();
        if let Err(e) = self.post(move || {
            completer.complete(f());
        }) {
            promise.complete(Err(e));
        }
        promise
    }

    /// Ask [`EventLoop::run`] to return after the current turn.
    pub fn stop(&self) {
        let _ = self.shared.send(Message::Stop);
    }

    /// Whether the caller is running on this loop's thread.
    pub fn is_affinity_thread(&self) -> bool {
        *self.shared.affinity.lock() == Some(thread::current().id())
    }

    /// Configuration the loop was built with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Number of spawned tasks that have not yet finished.
    pub fn live_tasks(&self) -> usize {
        self.shared.tasks.live()
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.shared.config.name)
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}

/// Future returned by [`LoopHandle::sleep`].
pub struct Sleep {
    shared: Arc<Shared>,
    deadline: Instant,
    timer: Option<TimerId>,
}

impl Sleep {
    /// When this sleep completes.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if Instant::now() >= this.deadline {
            if let Some(id) = this.timer.take() {
                this.shared.timers.lock().cancel(id);
            }
            return Poll::Ready(());
        }
        let mut timers = this.shared.timers.lock();
        match this.timer {
            Some(id) => {
                if !timers.update_waker(id, cx.waker()) {
                    this.timer = None;
                    return Poll::Ready(());
                }
            }
            None => {
                let id = timers.insert(this.deadline, TimerAction::Wake(cx.waker().clone()));
                this.timer = Some(id);
                drop(timers);
                let on_loop = *this.shared.affinity.lock() == Some(thread::current().id());
                if !on_loop {
                    let _ = this.shared.send(Message::Nudge);
                }
            }
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.timer.take() {
            self.shared.timers.lock().cancel(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event_loop() -> EventLoop {
        EventLoop::new(Config::default()).unwrap()
    }

    #[test]
    fn block_on_returns_output() {
        let mut el = event_loop();
        assert_eq!(el.block_on(async { 7 }), 7);
    }

    #[test]
    fn posted_closures_run_on_loop_thread() {
        let mut el = event_loop();
        let handle = el.handle();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let check = handle.clone();
        handle
            .post(move || {
                assert!(check.is_affinity_thread());
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        el.block_on(handle.sleep(Duration::from_millis(5)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn spawned_tasks_run_and_retire() {
        let mut el = event_loop();
        let handle = el.handle();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let h = hits.clone();
            handle
                .spawn(async move {
                    h.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let sleeper = handle.clone();
        el.block_on(async move { sleeper.sleep(Duration::from_millis(5)).await });
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(handle.live_tasks(), 0);
    }

    #[test]
    fn cancelled_task_is_dropped_before_resuming() {
        let mut el = event_loop();
        let handle = el.handle();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sleeper = handle.clone();
        let task = handle
            .spawn(async move {
                sleeper.sleep(Duration::from_millis(20)).await;
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let waiter = handle.clone();
        el.block_on(async move {
            waiter.sleep(Duration::from_millis(2)).await;
            task.cancel();
            waiter.sleep(Duration::from_millis(40)).await;
            assert!(task.is_finished());
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn delayed_posts_fire_in_order_and_cancel() {
        let mut el = event_loop();
        let handle = el.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(10, 'b'), (1, 'a')] {
            let order = order.clone();
            handle
                .post_delayed(Duration::from_millis(delay), move || order.lock().push(tag))
                .unwrap();
        }
        let order_c = order.clone();
        let cancelled = handle
            .post_delayed(Duration::from_millis(5), move || order_c.lock().push('x'))
            .unwrap();
        assert!(handle.cancel_timer(cancelled));
        el.block_on(handle.sleep(Duration::from_millis(30)));
        assert_eq!(*order.lock(), vec!['a', 'b']);
    }

    #[test]
    fn task_limit_is_enforced() {
        let mut el = EventLoop::new(Config {
            max_tasks: 1,
            ..Default::default()
        })
        .unwrap();
        let handle = el.handle();
        let sleeper = handle.clone();
        handle
            .spawn(async move { sleeper.sleep(Duration::from_millis(5)).await })
            .unwrap();
        assert!(matches!(handle.spawn(async {}), Err(Error::TaskLimit)));
        el.block_on(handle.sleep(Duration::from_millis(20)));
        assert!(handle.spawn(async {}).is_ok());
    }

    #[test]
    fn invoke_hops_from_another_thread() {
        let mut el = event_loop();
        let handle = el.handle();
        let remote = handle.clone();
        let promise = thread::spawn(move || {
            let check = remote.clone();
            remote.invoke(move || Ok(check.is_affinity_thread()))
        })
        .join()
        .unwrap();
        assert!(el.block_on(promise.wait()).unwrap());
    }

    #[test]
    fn run_returns_after_stop() {
        let mut el = event_loop();
        let handle = el.handle();
        let stopper = handle.clone();
        handle
            .post_delayed(Duration::from_millis(5), move || stopper.stop())
            .unwrap();
        el.run();
    }

    #[test]
    fn dropped_loop_rejects_new_work() {
        let el = event_loop();
        let handle = el.handle();
        drop(el);
        assert!(matches!(handle.post(|| {}), Err(Error::LoopStopped)));
        assert!(matches!(handle.spawn(async {}), Err(Error::LoopStopped)));
    }
}
