use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

/// Single-slot suspend/resume cell.
///
/// [`yield_now`](Self::yield_now) parks the caller until [`resume`](Self::resume).
/// There is no buffering: a `resume` with nobody parked is lost, so callers
/// keep their own "work pending" state and check it before yielding. A new
/// yield resumes whichever yield was parked before it (last in wins).
///
/// The returned [`Yield`] registers on its first poll, so a caller may poll
/// it while holding its own lock to make "check state, then park" atomic
/// with respect to a producer that updates state under that lock and calls
/// `resume` afterwards.
#[derive(Default)]
pub struct Cooperator {
    slot: Mutex<Option<(u64, Waker)>>,
    next_id: AtomicU64,
}

impl Cooperator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until the next `resume` (or a newer `yield_now`).
    pub fn yield_now(&self) -> Yield<'_> {
        Yield {
            cooperator: self,
            id: None,
        }
    }

    /// Wake the parked yield, if any. Returns whether one was resumed.
    pub fn resume(&self) -> bool {
        let parked = self.slot.lock().take();
        match parked {
            Some((_, waker)) => {
                waker.wake();
                true
            }
            None => false,
        }
    }

    /// Whether a yield is currently parked.
    pub fn is_parked(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl std::fmt::Debug for Cooperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cooperator")
            .field("parked", &self.is_parked())
            .finish()
    }
}

/// Future returned by [`Cooperator::yield_now`]. Completes once it has been
/// resumed or displaced; dropping it while parked withdraws it.
#[must_use = "futures do nothing unless polled"]
pub struct Yield<'a> {
    cooperator: &'a Cooperator,
    id: Option<u64>,
}

impl Future for Yield<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.id {
            None => {
                let id = self.cooperator.next_id.fetch_add(1, Ordering::Relaxed);
                self.id = Some(id);
                let displaced = self
                    .cooperator
                    .slot
                    .lock()
                    .replace((id, cx.waker().clone()));
                if let Some((_, waker)) = displaced {
                    waker.wake();
                }
                Poll::Pending
            }
            Some(id) => {
                let mut slot = self.cooperator.slot.lock();
                match slot.as_mut() {
                    Some((current, waker)) if *current == id => {
                        if !waker.will_wake(cx.waker()) {
                            *waker = cx.waker().clone();
                        }
                        Poll::Pending
                    }
                    _ => Poll::Ready(()),
                }
            }
        }
    }
}

impl Drop for Yield<'_> {
    fn drop(&mut self) {
        let Some(id) = self.id else {
            return;
        };
        let mut slot = self.cooperator.slot.lock();
        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
            *slot = None;
        }
    }
}
