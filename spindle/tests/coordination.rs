//! Integration tests: batons, cooperators and promises driven by a real
//! event loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use spindle::{Baton, Config, Cooperator, Deferred, Error, EventLoop, Promise, timeout};

// ── Helpers ─────────────────────────────────────────────────────────

fn event_loop() -> EventLoop {
    let config = Config {
        name: "coordination-test".into(),
        ..Config::default()
    };
    EventLoop::new(config).unwrap()
}

// ── Baton ───────────────────────────────────────────────────────────

#[test]
fn baton_strictly_alternates_over_many_passes() {
    const ROUNDS: u64 = 10_000;
    let mut el = event_loop();
    let handle = el.handle();
    let baton = Arc::new(Baton::new());

    let partner = baton.clone();
    let odd = Promise::spawn(&handle, async move {
        let mut received = Vec::with_capacity(ROUNDS as usize);
        for i in 0..ROUNDS {
            received.push(partner.pass(i * 2 + 1).await?);
        }
        Ok(received)
    });

    let even = el.block_on(async {
        let mut received = Vec::with_capacity(ROUNDS as usize);
        for i in 0..ROUNDS {
            received.push(baton.pass(i * 2).await.unwrap());
        }
        received
    });
    let odd = el.block_on(odd.wait()).unwrap();

    assert_eq!(even, (0..ROUNDS).map(|i| i * 2 + 1).collect::<Vec<_>>());
    assert_eq!(odd, (0..ROUNDS).map(|i| i * 2).collect::<Vec<_>>());
}

#[test]
fn finishing_resumes_parked_partner_with_terminal_value() {
    let mut el = event_loop();
    let handle = el.handle();
    let baton = Arc::new(Baton::new());

    let waiter = baton.clone();
    let parked = Promise::spawn(&handle, async move { Ok(waiter.exchange(Ok(1)).await) });

    let offered = el.block_on(async {
        // Let the spawned exchange park first.
        handle.sleep(Duration::from_millis(5)).await;
        baton.finish(42).unwrap()
    });
    let offered = offered.expect("partner was parked");
    assert_eq!(offered.value.unwrap(), 1);
    assert!(offered.finished);

    let result = el.block_on(parked.wait()).unwrap();
    assert_eq!(result.value.unwrap(), 42);
    assert!(result.finished);
    assert!(!result.resumed);

    // Every later pass replays the terminal value without suspending.
    for _ in 0..3 {
        assert_eq!(el.block_on(baton.pass(7)).unwrap(), 42);
    }
    assert!(matches!(baton.finish(0), Err(Error::AlreadyFinished)));
}

#[test]
fn raised_errors_cross_the_baton() {
    let mut el = event_loop();
    let handle = el.handle();
    let baton = Arc::new(Baton::<u32>::new());

    let partner = baton.clone();
    let raiser = Promise::spawn(&handle, async move { partner.raise(Error::Interrupted).await });

    let got = el.block_on(baton.pass(5));
    assert!(matches!(got, Err(Error::Interrupted)));
    assert_eq!(el.block_on(raiser.wait()).unwrap(), 5);
}

#[test]
fn toss_pairs_with_a_later_pass() {
    let mut el = event_loop();
    let baton = Baton::new();
    assert_eq!(baton.toss(3).unwrap(), None);
    // The pass finds the tossed value and returns at once.
    assert_eq!(el.block_on(baton.pass(4)).unwrap(), 3);
    assert_eq!(baton.toss(5).unwrap(), None);
    assert_eq!(baton.toss(6).unwrap(), Some(5));
}

// ── Cooperator ──────────────────────────────────────────────────────

#[test]
fn newer_yield_displaces_older() {
    let mut el = event_loop();
    let handle = el.handle();
    let coop = Arc::new(Cooperator::new());
    let woken = Arc::new(AtomicUsize::new(0));

    let first = {
        let coop = coop.clone();
        let woken = woken.clone();
        Promise::spawn(&handle, async move {
            coop.yield_now().await;
            woken.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };

    el.block_on(async {
        handle.sleep(Duration::from_millis(5)).await;
        assert!(coop.is_parked());
    });

    let second = {
        let coop = coop.clone();
        let woken = woken.clone();
        Promise::spawn(&handle, async move {
            coop.yield_now().await;
            woken.fetch_add(10, Ordering::SeqCst);
            Ok(())
        })
    };

    // The second yield parks and resumes the first.
    el.block_on(first.wait()).unwrap();
    assert_eq!(woken.load(Ordering::SeqCst), 1);
    assert!(!second.is_done());

    assert!(coop.resume());
    el.block_on(second.wait()).unwrap();
    assert_eq!(woken.load(Ordering::SeqCst), 11);
    assert!(!coop.resume());
}

// ── Promise ─────────────────────────────────────────────────────────

#[test]
fn promise_fans_out_to_every_awaiter() {
    let mut el = event_loop();
    let handle = el.handle();
    let deferred = Deferred::<String>::new();
    let promise = deferred.promise();

    let awaiters: Vec<_> = (0..8)
        .map(|_| {
            let p = promise.clone();
            Promise::spawn(&handle, async move { p.await })
        })
        .collect();

    el.block_on(handle.sleep(Duration::from_millis(5)));
    assert!(awaiters.iter().all(|a| !a.is_done()));

    deferred.resolve("done".into());
    for awaiter in awaiters {
        assert_eq!(el.block_on(awaiter.wait()).unwrap(), "done");
    }
    // A late awaiter sees the stored result immediately.
    assert_eq!(el.block_on(promise.wait()).unwrap(), "done");
}

#[test]
fn cancel_stops_spawned_body_and_runs_hook() {
    let mut el = event_loop();
    let handle = el.handle();
    let progressed = Arc::new(AtomicUsize::new(0));
    let hooked = Arc::new(AtomicUsize::new(0));

    let body_progress = progressed.clone();
    let sleeper = handle.clone();
    let hook = hooked.clone();
    let promise = Promise::<u32>::spawn(&handle, async move {
        sleeper.sleep(Duration::from_secs(60)).await;
        body_progress.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    })
    .with_cancel_hook(move || {
        hook.fetch_add(1, Ordering::SeqCst);
    });

    el.block_on(handle.sleep(Duration::from_millis(5)));
    assert!(promise.cancel());
    assert!(!promise.cancel());

    assert!(matches!(el.block_on(promise.wait()), Err(Error::Cancelled)));
    el.block_on(handle.sleep(Duration::from_millis(5)));
    assert_eq!(progressed.load(Ordering::SeqCst), 0);
    assert_eq!(hooked.load(Ordering::SeqCst), 1);
    assert_eq!(handle.live_tasks(), 0);
}

#[test]
fn timeout_cancels_slow_operation() {
    let mut el = event_loop();
    let handle = el.handle();
    let baton = Baton::<u32>::new();

    let started = Instant::now();
    let result = el.block_on(timeout(&handle, Duration::from_millis(20), baton.pass(1)));
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(20));

    // The timed-out pass withdrew its offer; the slot is empty again.
    assert_eq!(baton.toss(2).unwrap(), None);
}

#[test]
fn and_then_chains_async_steps() {
    let mut el = event_loop();
    let handle = el.handle();
    let sleeper = handle.clone();
    let chained = Promise::resolved(20u32).and_then(&handle, move |v| {
        let sleeper = sleeper.clone();
        async move {
            sleeper.sleep(Duration::from_millis(1)).await;
            Ok(v + 1)
        }
    });
    assert_eq!(el.block_on(chained.wait()).unwrap(), 21);
}

#[test]
fn invoke_runs_on_the_loop_thread() {
    let mut el = event_loop();
    let handle = el.handle();
    let probe = handle.clone();
    let promise = handle.invoke(move || Ok(probe.is_affinity_thread()));
    assert!(el.block_on(promise.wait()).unwrap());
}
