use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use super::LoopHandle;
use crate::error::{Error, Result};

/// Result of [`select()`]: which branch completed first.
#[derive(Debug, PartialEq, Eq)]
pub enum Either<A, B> {
    /// The first (left) future completed.
    Left(A),
    /// The second (right) future completed.
    Right(B),
}

impl<T> Either<T, T> {
    /// Extract the value regardless of which branch completed.
    pub fn into_inner(self) -> T {
        match self {
            Either::Left(v) | Either::Right(v) => v,
        }
    }
}

pin_project_lite::pin_project! {
    /// Future that polls two sub-futures and returns whichever completes first.
    /// **Biased**: always polls `a` before `b`.
    pub struct Select<A, B> {
        #[pin] a: A,
        #[pin] b: B,
    }
}

impl<A: Future, B: Future> Future for Select<A, B> {
    type Output = Either<A::Output, B::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(val) = this.a.poll(cx) {
            return Poll::Ready(Either::Left(val));
        }
        if let Poll::Ready(val) = this.b.poll(cx) {
            return Poll::Ready(Either::Right(val));
        }
        Poll::Pending
    }
}

/// Poll two futures concurrently, returning whichever completes first.
///
/// **Biased**: always polls `a` before `b`. When both are ready simultaneously,
/// `a` wins. The losing future is dropped by the caller, which withdraws any
/// baton waiter, pipe read or timer it had registered.
pub fn select<A: Future, B: Future>(a: A, b: B) -> Select<A, B> {
    Select { a, b }
}

pin_project_lite::pin_project! {
    /// Future that drives two sub-futures to completion and yields both outputs.
    pub struct Join<A: Future, B: Future> {
        #[pin] a: A,
        #[pin] b: B,
        a_out: Option<A::Output>,
        b_out: Option<B::Output>,
    }
}

impl<A: Future, B: Future> Future for Join<A, B> {
    type Output = (A::Output, B::Output);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if this.a_out.is_none()
            && let Poll::Ready(val) = this.a.poll(cx)
        {
            *this.a_out = Some(val);
        }
        if this.b_out.is_none()
            && let Poll::Ready(val) = this.b.poll(cx)
        {
            *this.b_out = Some(val);
        }
        if this.a_out.is_some() && this.b_out.is_some() {
            match (this.a_out.take(), this.b_out.take()) {
                (Some(a), Some(b)) => Poll::Ready((a, b)),
                _ => Poll::Pending,
            }
        } else {
            Poll::Pending
        }
    }
}

/// Run two futures concurrently on the current task and wait for both.
pub fn join<A: Future, B: Future>(a: A, b: B) -> Join<A, B> {
    Join {
        a,
        b,
        a_out: None,
        b_out: None,
    }
}

/// Race `future` against a sleep of `duration` on `handle`'s loop.
///
/// Whichever loses is dropped; a timed-out operation is cancelled at its
/// current suspension point and the call returns [`Error::Timeout`].
pub async fn timeout<F: Future>(handle: &LoopHandle, duration: Duration, future: F) -> Result<F::Output> {
    match select(future, handle.sleep(duration)).await {
        Either::Left(out) => Ok(out),
        Either::Right(()) => Err(Error::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runtime::EventLoop;
    use std::future::{pending, ready};

    #[test]
    fn select_is_biased_to_the_left() {
        let mut el = EventLoop::new(Config::default()).unwrap();
        let out = el.block_on(select(ready(1), ready(2)));
        assert_eq!(out, Either::Left(1));
        assert_eq!(out.into_inner(), 1);
    }

    #[test]
    fn join_waits_for_both() {
        let mut el = EventLoop::new(Config::default()).unwrap();
        let handle = el.handle();
        let (a, b) = el.block_on(async {
            join(
                async {
                    handle.sleep(Duration::from_millis(5)).await;
                    "slow"
                },
                ready("fast"),
            )
            .await
        });
        assert_eq!((a, b), ("slow", "fast"));
    }

    #[test]
    fn timeout_cancels_the_operation() {
        let mut el = EventLoop::new(Config::default()).unwrap();
        let handle = el.handle();
        let out = el.block_on(timeout(&handle, Duration::from_millis(5), pending::<()>()));
        assert!(matches!(out, Err(Error::Timeout)));
        let out = el.block_on(timeout(&handle, Duration::from_secs(5), ready(3)));
        assert_eq!(out.unwrap(), 3);
    }
}
