use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Outcome of a baton hand-off.
#[derive(Debug, Clone)]
pub struct BatonResult<T> {
    /// The value (or error) offered by the other side.
    pub value: Result<T>,
    /// True if this side found the partner already waiting and resumed it;
    /// false if this side was the one parked and got resumed.
    pub resumed: bool,
    /// True if the value is the terminal value of a finished baton.
    pub finished: bool,
}

impl<T> BatonResult<T> {
    pub fn into_result(self) -> Result<T> {
        self.value
    }
}

struct Waiter<T> {
    id: u64,
    offered: Result<T>,
    /// None for a non-suspending toss.
    waker: Option<Waker>,
}

struct State<T> {
    waiter: Option<Waiter<T>>,
    finished: Option<Result<T>>,
    /// Results handed to parked waiters that have not been polled yet.
    delivered: HashMap<u64, BatonResult<T>>,
    next_id: u64,
}

enum Offer<T> {
    Done(BatonResult<T>),
    Parked(u64),
    Rejected(Error),
}

/// Two-party rendezvous slot.
///
/// At most one side is ever parked. The next arrival swaps values with it:
/// the parked side is resumed with the arrival's value and the arrival
/// returns the parked side's value, so successive hand-offs strictly
/// alternate. A finished baton replays its terminal value to every later
/// caller without suspending.
pub struct Baton<T> {
    state: Mutex<State<T>>,
}

impl<T> Default for Baton<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Baton<T> {
    pub fn new() -> Self {
        Baton {
            state: Mutex::new(State {
                waiter: None,
                finished: None,
                delivered: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished.is_some()
    }
}

impl<T: Clone> Baton<T> {
    /// Hand `value` to the partner and wait for the partner's value.
    pub async fn pass(&self, value: T) -> Result<T> {
        self.exchange(Ok(value)).await.value
    }

    /// Deliver `error` to the partner and wait for the partner's value.
    pub async fn raise(&self, error: Error) -> Result<T> {
        self.exchange(Err(error)).await.value
    }

    /// Full-result hand-off.
    pub fn exchange(&self, value: Result<T>) -> Exchange<'_, T, fn(&Result<T>) -> Result<()>> {
        Exchange {
            baton: self,
            stage: Stage::Offer(value, None),
        }
    }

    /// Like [`exchange`](Self::exchange), but a waiter found on arrival is
    /// first shown to `check`. If `check` fails, its error is returned and
    /// the waiter stays parked, untouched.
    pub fn exchange_checked<F>(&self, value: Result<T>, check: F) -> Exchange<'_, T, F>
    where
        F: FnOnce(&Result<T>) -> Result<()>,
    {
        Exchange {
            baton: self,
            stage: Stage::Offer(value, Some(check)),
        }
    }

    /// Permanently close the baton with `value`. A parked partner is resumed
    /// with it and its own offer is returned. Finishing twice is an error.
    pub fn finish(&self, value: T) -> Result<Option<BatonResult<T>>> {
        self.finish_with(Ok(value))
    }

    /// Permanently close the baton with `error`.
    pub fn raise_finish(&self, error: Error) -> Result<Option<BatonResult<T>>> {
        self.finish_with(Err(error))
    }

    fn finish_with(&self, value: Result<T>) -> Result<Option<BatonResult<T>>> {
        let mut state = self.state.lock();
        if state.finished.is_some() {
            return Err(Error::AlreadyFinished);
        }
        state.finished = Some(value.clone());
        let Some(waiter) = state.waiter.take() else {
            return Ok(None);
        };
        let waker = Self::deliver(&mut state, &waiter, value, true);
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(Some(BatonResult {
            value: waiter.offered,
            resumed: true,
            finished: true,
        }))
    }

    /// Non-suspending pass. Takes the parked partner's value if there is one;
    /// otherwise leaves `value` for the next arrival and returns `None`.
    pub fn toss(&self, value: T) -> Result<Option<T>> {
        self.toss_with(Ok(value))
    }

    /// Non-suspending raise.
    pub fn toss_raise(&self, error: Error) -> Result<Option<T>> {
        self.toss_with(Err(error))
    }

    fn toss_with(&self, value: Result<T>) -> Result<Option<T>> {
        let mut state = self.state.lock();
        if let Some(finished) = &state.finished {
            return finished.clone().map(Some);
        }
        match state.waiter.take() {
            Some(waiter) => {
                let waker = Self::deliver(&mut state, &waiter, value, false);
                drop(state);
                if let Some(waker) = waker {
                    waker.wake();
                }
                waiter.offered.map(Some)
            }
            None => {
                let id = Self::next_id(&mut state);
                state.waiter = Some(Waiter {
                    id,
                    offered: value,
                    waker: None,
                });
                Ok(None)
            }
        }
    }

    /// Hand `value` to a parked partner, if any, and return its offer.
    /// Never registers a waiter.
    pub fn take(&self, value: T) -> Option<Result<T>> {
        self.take_if(value, |_| true)
    }

    /// Like [`take`](Self::take), but only if `cond` accepts the parked
    /// partner's offer.
    pub fn take_if<F>(&self, value: T, cond: F) -> Option<Result<T>>
    where
        F: FnOnce(&Result<T>) -> bool,
    {
        let mut state = self.state.lock();
        if state.finished.is_some() || !cond(&state.waiter.as_ref()?.offered) {
            return None;
        }
        let waiter = state.waiter.take()?;
        let waker = Self::deliver(&mut state, &waiter, Ok(value), false);
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
        Some(waiter.offered)
    }

    /// Return the terminal error, if the baton was finished with one.
    pub fn rethrow(&self) -> Result<()> {
        match &self.state.lock().finished {
            Some(Err(e)) => Err(e.clone()),
            _ => Ok(()),
        }
    }

    fn next_id(state: &mut State<T>) -> u64 {
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    /// Record `value` for a removed waiter. Returns its waker; the caller
    /// wakes it after releasing the lock.
    fn deliver(state: &mut State<T>, waiter: &Waiter<T>, value: Result<T>, finished: bool) -> Option<Waker> {
        let waker = waiter.waker.clone()?;
        state.delivered.insert(
            waiter.id,
            BatonResult {
                value,
                resumed: false,
                finished,
            },
        );
        Some(waker)
    }

    fn offer<F>(&self, value: Result<T>, check: Option<F>, waker: &Waker) -> Offer<T>
    where
        F: FnOnce(&Result<T>) -> Result<()>,
    {
        let mut state = self.state.lock();
        if let Some(finished) = &state.finished {
            return Offer::Done(BatonResult {
                value: finished.clone(),
                resumed: true,
                finished: true,
            });
        }
        if let Some(waiter) = &state.waiter {
            if let Some(check) = check
                && let Err(e) = check(&waiter.offered)
            {
                return Offer::Rejected(e);
            }
            let Some(waiter) = state.waiter.take() else {
                return Offer::Rejected(Error::Closed);
            };
            let partner = Self::deliver(&mut state, &waiter, value, false);
            drop(state);
            if let Some(partner) = partner {
                partner.wake();
            }
            return Offer::Done(BatonResult {
                value: waiter.offered,
                resumed: true,
                finished: false,
            });
        }
        let id = Self::next_id(&mut state);
        state.waiter = Some(Waiter {
            id,
            offered: value,
            waker: Some(waker.clone()),
        });
        Offer::Parked(id)
    }
}

impl<T> std::fmt::Debug for Baton<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Baton")
            .field("waiting", &state.waiter.is_some())
            .field("finished", &state.finished.is_some())
            .finish()
    }
}

enum Stage<T, F> {
    Offer(Result<T>, Option<F>),
    Parked(u64),
    Done,
}

/// Future returned by [`Baton::exchange`]. Dropping it while parked
/// withdraws the offer; a result already delivered to it is discarded.
#[must_use = "futures do nothing unless polled"]
pub struct Exchange<'a, T, F> {
    baton: &'a Baton<T>,
    stage: Stage<T, F>,
}

impl<T, F> Unpin for Exchange<'_, T, F> {}

impl<T: Clone, F> Future for Exchange<'_, T, F>
where
    F: FnOnce(&Result<T>) -> Result<()>,
{
    type Output = BatonResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<BatonResult<T>> {
        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Offer(value, check) => match self.baton.offer(value, check, cx.waker()) {
                Offer::Done(result) => Poll::Ready(result),
                Offer::Rejected(e) => Poll::Ready(BatonResult {
                    value: Err(e),
                    resumed: false,
                    finished: false,
                }),
                Offer::Parked(id) => {
                    self.stage = Stage::Parked(id);
                    Poll::Pending
                }
            },
            Stage::Parked(id) => {
                let mut state = self.baton.state.lock();
                if let Some(result) = state.delivered.remove(&id) {
                    return Poll::Ready(result);
                }
                if let Some(waiter) = state.waiter.as_mut()
                    && waiter.id == id
                    && let Some(waker) = waiter.waker.as_mut()
                    && !waker.will_wake(cx.waker())
                {
                    *waker = cx.waker().clone();
                }
                drop(state);
                self.stage = Stage::Parked(id);
                Poll::Pending
            }
            Stage::Done => panic!("Exchange polled after completion"),
        }
    }
}

impl<T, F> Drop for Exchange<'_, T, F> {
    fn drop(&mut self) {
        let Stage::Parked(id) = self.stage else {
            return;
        };
        let mut state = self.baton.state.lock();
        if state.waiter.as_ref().is_some_and(|w| w.id == id) {
            state.waiter = None;
        } else {
            state.delivered.remove(&id);
        }
    }
}
