use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::task::Waker;
use std::time::Instant;

/// Identifies a pending timer so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What to do when a timer fires.
pub(crate) enum TimerAction {
    /// Wake a sleeping future.
    Wake(Waker),
    /// Run a closure posted with `post_delayed`.
    Run(Box<dyn FnOnce() + Send>),
}

/// Pending timers of one event loop, ordered by deadline.
///
/// Cancelled timers leave a stale heap entry behind; it is skipped when it
/// reaches the top because its id is no longer in `actions`.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    actions: HashMap<u64, TimerAction>,
    next_id: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            actions: HashMap::new(),
            next_id: 0,
        }
    }

    pub(crate) fn insert(&mut self, deadline: Instant, action: TimerAction) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.actions.insert(id, action);
        TimerId(id)
    }

    /// Replace the waker of a pending sleep. Returns false if the timer
    /// already fired or was cancelled.
    pub(crate) fn update_waker(&mut self, id: TimerId, waker: &Waker) -> bool {
        match self.actions.get_mut(&id.0) {
            Some(TimerAction::Wake(current)) => {
                if !current.will_wake(waker) {
                    *current = waker.clone();
                }
                true
            }
            Some(TimerAction::Run(_)) => true,
            None => false,
        }
    }

    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        self.actions.remove(&id.0).is_some()
    }

    /// The earliest live deadline, discarding cancelled entries on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek() {
            if self.actions.contains_key(id) {
                return Some(*deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every action whose deadline is at or before `now`,
    /// in deadline order.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<TimerAction> {
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            let id = *id;
            self.heap.pop();
            if let Some(action) = self.actions.remove(&id) {
                fired.push(action);
            }
        }
        fired
    }

    pub(crate) fn len(&self) -> usize {
        self.actions.len()
    }
}
