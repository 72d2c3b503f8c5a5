//! Exactly-once completion cell with callback fan-out.
//!
//! A [`Promise`] is completed once, with a value or an error. Every
//! subscriber registered through [`Promise::on_complete`] (and the
//! combinators built on it) fires synchronously on the completer's stack,
//! in registration order. Awaiting a completed promise returns immediately.
//!
//! Cancellation completes the promise with [`Error::Cancelled`], runs the
//! optional cancel hook and drops the spawned body at its current
//! suspension point.
//!
//! A promise that is rejected with anything other than a cancellation and
//! then dropped without anyone having looked at the error logs it at
//! `error!` level and bumps `spindle/promise/unobserved_rejections`.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use slab::Slab;
use tracing::error;

use crate::error::{Error, Result};
use crate::metrics::UNOBSERVED_REJECTIONS;
use crate::runtime::{LoopHandle, TaskHandle};

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct State<T> {
    result: Option<Result<T>>,
    callbacks: Vec<Callback<T>>,
    waiters: Slab<Waker>,
    cancel_hook: Option<Box<dyn FnOnce() + Send>>,
    task: Option<TaskHandle>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    observed: AtomicBool,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if self.observed.load(Ordering::Acquire) {
            return;
        }
        if let Some(Err(e)) = &self.state.get_mut().result
            && !e.is_cancelled()
        {
            UNOBSERVED_REJECTIONS.increment();
            error!(error = %e, "promise rejected and never observed");
        }
    }
}

/// Shared handle to a single eventual result.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> Promise<T> {
    pub(crate) fn pending() -> Self {
        Promise {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    result: None,
                    callbacks: Vec::new(),
                    waiters: Slab::new(),
                    cancel_hook: None,
                    task: None,
                }),
                observed: AtomicBool::new(false),
            }),
        }
    }

    /// Whether the promise has been completed (including by cancellation).
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().result.is_some()
    }

    fn observe(&self) {
        self.shared.observed.store(true, Ordering::Release);
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// An already-resolved promise.
    pub fn resolved(value: T) -> Self {
        let promise = Self::pending();
        promise.complete(Ok(value));
        promise
    }

    /// An already-rejected promise.
    pub fn rejected(error: Error) -> Self {
        let promise = Self::pending();
        promise.complete(Err(error));
        promise
    }

    /// Start `future` on `handle`'s loop right away and complete the promise
    /// with its output.
    pub fn spawn<F>(handle: &LoopHandle, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let promise = Self::pending();
        let completer = promise.clone();
        match handle.spawn(async move {
            let result = future.await;
            completer.complete(result);
        }) {
            Ok(task) => {
                let mut state = promise.shared.state.lock();
                if state.result.is_none() {
                    state.task = Some(task);
                }
            }
            Err(e) => {
                promise.complete(Err(e));
            }
        }
        promise
    }

    /// Install a hook that runs when [`cancel`](Self::cancel) takes effect.
    pub fn with_cancel_hook<F>(self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.state.lock().cancel_hook = Some(Box::new(hook));
        self
    }

    /// Complete the promise. Returns false (and drops `result`) if it was
    /// already complete.
    pub(crate) fn complete(&self, result: Result<T>) -> bool {
        self.settle(result).is_some()
    }

    fn settle(&self, result: Result<T>) -> Option<Settled> {
        let mut state = self.shared.state.lock();
        if state.result.is_some() {
            return None;
        }
        state.result = Some(result.clone());
        let callbacks = std::mem::take(&mut state.callbacks);
        let waiters = std::mem::take(&mut state.waiters);
        let settled = Settled {
            hook: state.cancel_hook.take(),
            task: state.task.take(),
        };
        drop(state);

        for (_, waker) in waiters {
            waker.wake();
        }
        for callback in callbacks {
            callback(&result);
        }
        Some(settled)
    }

    /// Complete with [`Error::Cancelled`], run the cancel hook and drop the
    /// spawned body. Returns false if the promise was already complete.
    pub fn cancel(&self) -> bool {
        let Some(settled) = self.settle(Err(Error::Cancelled)) else {
            return false;
        };
        if let Some(hook) = settled.hook {
            hook();
        }
        if let Some(task) = settled.task {
            task.cancel();
        }
        true
    }

    /// Register a callback for completion. Runs immediately if already complete.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        self.observe();
        let mut state = self.shared.state.lock();
        match &state.result {
            Some(result) => {
                let result = result.clone();
                drop(state);
                callback(&result);
            }
            None => state.callbacks.push(Box::new(callback)),
        }
    }

    /// Derive a promise by transforming the value; errors pass through.
    pub fn then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let next = Promise::pending();
        let completer = next.clone();
        self.on_complete(move |result| {
            completer.complete(match result {
                Ok(value) => f(value.clone()),
                Err(e) => Err(e.clone()),
            });
        });
        next
    }

    /// Derive a promise by running an async continuation on `handle`'s loop.
    pub fn and_then<U, F, Fut>(&self, handle: &LoopHandle, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        let source = self.clone();
        Promise::spawn(handle, async move {
            let value = source.await?;
            f(value).await
        })
    }

    /// Handle an error: `f` may recover with a value or fail again.
    pub fn catch<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(Error) -> Result<T> + Send + 'static,
    {
        let next = Promise::pending();
        let completer = next.clone();
        self.on_complete(move |result| {
            completer.complete(match result {
                Ok(value) => Ok(value.clone()),
                Err(e) => f(e.clone()),
            });
        });
        next
    }

    /// Replace any error with a value.
    pub fn recover<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(Error) -> T + Send + 'static,
    {
        self.catch(move |e| Ok(f(e)))
    }

    /// Run `f` on completion, passing the result through unchanged.
    pub fn finally<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce() + Send + 'static,
    {
        let next = Promise::pending();
        let completer = next.clone();
        self.on_complete(move |result| {
            f();
            completer.complete(result.clone());
        });
        next
    }

    /// The result, if complete.
    pub fn try_get(&self) -> Option<Result<T>> {
        let result = self.shared.state.lock().result.clone();
        if result.is_some() {
            self.observe();
        }
        result
    }

    /// Surface a stored error. Pending and resolved promises return `Ok`.
    pub fn rethrow(&self) -> Result<()> {
        match self.try_get() {
            Some(Err(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Wait for the result.
    pub fn wait(&self) -> Wait<T> {
        Wait {
            promise: self.clone(),
            key: None,
        }
    }
}

struct Settled {
    hook: Option<Box<dyn FnOnce() + Send>>,
    task: Option<TaskHandle>,
}

impl<T: Clone + Send + 'static> IntoFuture for Promise<T> {
    type Output = Result<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Wait<T> {
        Wait {
            promise: self,
            key: None,
        }
    }
}

/// Future returned by [`Promise::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct Wait<T> {
    promise: Promise<T>,
    key: Option<usize>,
}

impl<T: Clone> Future for Wait<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let this = &mut *self;
        let mut state = this.promise.shared.state.lock();
        if let Some(result) = &state.result {
            let result = result.clone();
            drop(state);
            this.key = None;
            this.promise.observe();
            return Poll::Ready(result);
        }
        match this.key {
            Some(key) => match state.waiters.get_mut(key) {
                Some(waker) if !waker.will_wake(cx.waker()) => *waker = cx.waker().clone(),
                Some(_) => {}
                None => this.key = Some(state.waiters.insert(cx.waker().clone())),
            },
            None => this.key = Some(state.waiters.insert(cx.waker().clone())),
        }
        Poll::Pending
    }
}

impl<T> Drop for Wait<T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.promise.shared.state.lock().waiters.try_remove(key);
        }
    }
}

/// Write side of a promise completed by hand.
///
/// Dropping a `Deferred` that was never completed cancels its promise.
pub struct Deferred<T: Clone + Send + 'static> {
    promise: Promise<T>,
}

impl<T: Clone + Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    pub fn new() -> Self {
        Deferred {
            promise: Promise::pending(),
        }
    }

    /// The read side.
    pub fn promise(&self) -> Promise<T> {
        self.promise.clone()
    }

    pub fn resolve(&self, value: T) -> bool {
        self.promise.complete(Ok(value))
    }

    pub fn reject(&self, error: Error) -> bool {
        self.promise.complete(Err(error))
    }
}

impl<T: Clone + Send + 'static> Drop for Deferred<T> {
    fn drop(&mut self) {
        self.promise.complete(Err(Error::Cancelled));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tracing_test::traced_test;

    use super::*;

    #[test]
    fn completes_exactly_once() {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        assert!(!promise.is_done());
        assert!(deferred.resolve(1));
        assert!(!deferred.resolve(2));
        assert!(!deferred.reject(Error::Closed));
        assert_eq!(promise.try_get().unwrap().unwrap(), 1);
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..4 {
            let order = order.clone();
            promise.on_complete(move |r| order.lock().push((tag, *r.as_ref().unwrap())));
        }
        deferred.resolve(10);
        let late = order.clone();
        promise.on_complete(move |r| late.lock().push((4, *r.as_ref().unwrap())));
        assert_eq!(*order.lock(), vec![(0, 10), (1, 10), (2, 10), (3, 10), (4, 10)]);
    }

    #[test]
    fn then_propagates_errors_and_catch_recovers() {
        let deferred = Deferred::<u32>::new();
        let doubled = deferred.promise().then(|v| Ok(v * 2));
        let failed = doubled.then(|_| Err::<u32, _>(Error::Protocol("bad".into())));
        let recovered = failed.recover(|_| 99);
        deferred.resolve(4);
        assert_eq!(doubled.try_get().unwrap().unwrap(), 8);
        assert!(matches!(failed.try_get(), Some(Err(Error::Protocol(_)))));
        assert_eq!(recovered.try_get().unwrap().unwrap(), 99);
    }

    #[test]
    fn finally_runs_on_both_paths() {
        let runs = Arc::new(AtomicUsize::new(0));
        for ok in [true, false] {
            let deferred = Deferred::<u32>::new();
            let r = runs.clone();
            let after = deferred.promise().finally(move || {
                r.fetch_add(1, Ordering::SeqCst);
            });
            if ok {
                deferred.resolve(1);
            } else {
                deferred.reject(Error::Closed);
            }
            assert_eq!(after.try_get().unwrap().is_ok(), ok);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel_runs_hook_once() {
        let hooked = Arc::new(AtomicUsize::new(0));
        let h = hooked.clone();
        let promise = Promise::<u32>::pending().with_cancel_hook(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(promise.cancel());
        assert!(!promise.cancel());
        assert!(matches!(promise.try_get(), Some(Err(Error::Cancelled))));
        assert_eq!(hooked.load(Ordering::SeqCst), 1);

        let done = Promise::resolved(1);
        assert!(!done.cancel());
    }

    #[test]
    fn dropped_deferred_cancels() {
        let promise = {
            let deferred = Deferred::<u32>::new();
            deferred.promise()
        };
        assert!(matches!(promise.rethrow(), Err(Error::Cancelled)));
    }

    #[traced_test]
    #[test]
    fn unobserved_rejection_is_logged_on_drop() {
        let promise = Promise::<u32>::rejected(Error::Protocol("lost".into()));
        drop(promise);
        assert!(logs_contain("promise rejected and never observed"));
    }

    #[traced_test]
    #[test]
    fn observed_or_cancelled_rejections_stay_quiet() {
        let seen = Promise::<u32>::rejected(Error::Closed);
        assert!(seen.rethrow().is_err());
        drop(seen);

        let cancelled = Promise::<u32>::pending();
        cancelled.cancel();
        drop(cancelled);

        assert!(!logs_contain("promise rejected and never observed"));
    }
}
