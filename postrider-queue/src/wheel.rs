//! Deadline-indexed scheduler.
//!
//! A [`TimeWheel`] holds `(when, value)` entries and hands each one to
//! exactly one of the tasks blocked in [`TimeWheel::dispatch`], never before
//! its deadline. Internally it is a min-heap behind a mutex, with a
//! [`Notify`] waking sleepers when an earlier entry arrives or the wheel
//! closes.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

struct Entry<T> {
    when: DateTime<Utc>,
    seq: u64,
    value: T,
}

// Ordered by deadline (earliest first out of the heap), with the insertion
// sequence as tie-breaker so values never need to be comparable.
impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.when, other.seq).cmp(&(self.when, self.seq))
    }
}

struct State<T> {
    entries: BinaryHeap<Entry<T>>,
    next_seq: u64,
    closed: bool,
}

/// Shared deadline queue; clones refer to the same wheel.
pub struct TimeWheel<T> {
    state: Arc<Mutex<State<T>>>,
    notify: Arc<Notify>,
}

impl<T> Clone for TimeWheel<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl<T> Default for TimeWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimeWheel<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                entries: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Schedule `value` to be dispatched once wall clock reaches `when`.
    ///
    /// Entries added after [`TimeWheel::close`] are silently discarded.
    pub fn add(&self, when: DateTime<Utc>, value: T) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push(Entry { when, seq, value });
        }
        self.notify.notify_waiters();
    }

    /// Wait for the next due entry.
    ///
    /// Concurrent callers each receive distinct entries. Returns `None` once
    /// the wheel has been closed.
    pub async fn dispatch(&self) -> Option<T> {
        loop {
            // Register for wakeups before inspecting state, so an add() or
            // close() racing with the check cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let sleep_for = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.closed {
                    return None;
                }
                match state.entries.peek() {
                    Some(entry) => {
                        let wait = entry.when.signed_duration_since(Utc::now());
                        match wait.to_std() {
                            // Deadline already passed.
                            Err(_) => {
                                let entry = state.entries.pop()?;
                                return Some(entry.value);
                            }
                            Ok(wait) => Some(wait),
                        }
                    }
                    None => None,
                }
            };

            match sleep_for {
                Some(wait) => {
                    tokio::select! {
                        () = notified => {}
                        () = tokio::time::sleep(wait) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Close the wheel: pending entries are dropped and every waiter in
    /// [`TimeWheel::dispatch`] returns `None`.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            state.entries.clear();
        }
        self.notify.notify_waiters();
    }
}
