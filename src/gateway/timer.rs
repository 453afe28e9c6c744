//! Cancellable timers for the event loop
//!
//! The gateway schedules timers through [`Timers`] and receives expirations
//! back as plain values, so the scheduler and correlator never sleep
//! themselves. Production uses a [`DelayQueue`]; tests drive a manual clock.

use std::collections::HashMap;
use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;

use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::warn;

use crate::core::RequestId;

/// Identifies one scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

/// What to do when a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Send the deactivate frame for a turnout
    TurnoutPulse { addr: u16 },
    /// Reject a programming request nobody answered
    ProgrammingTimeout { request: RequestId },
}

/// Longest delay handed to the delay queue, well inside its wheel range
const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Timer source used by the gateway
pub trait Timers {
    /// Starts a timer that fires once after `delay`
    fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerHandle;

    /// Cancels a timer; returns false if it already fired or was cancelled
    fn cancel(&mut self, handle: TimerHandle) -> bool;
}

/// Timers backed by tokio's delay queue
#[derive(Debug, Default)]
pub struct DelayQueueTimers {
    queue: DelayQueue<(TimerHandle, TimerKind)>,
    keys: HashMap<TimerHandle, Key>,
    next_handle: u64,
}

impl DelayQueueTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timers not yet fired
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Waits for the next expired timer
    ///
    /// Stays pending while no timer is scheduled, so it can sit in a
    /// `select!` next to other event sources.
    pub async fn expired(&mut self) -> (TimerHandle, TimerKind) {
        let expired = poll_fn(|cx| match self.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => Poll::Ready(expired.into_inner()),
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        })
        .await;
        self.keys.remove(&expired.0);
        expired
    }
}

impl Timers for DelayQueueTimers {
    fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        if delay > MAX_DELAY {
            warn!(?kind, requested_ms = delay.as_millis() as u64, "Clamping timer delay");
        }
        let key = self.queue.insert((handle, kind), delay.min(MAX_DELAY));
        self.keys.insert(handle, key);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.keys.remove(&handle) {
            Some(key) => {
                self.queue.remove(&key);
                true
            }
            None => false,
        }
    }
}

/// Manually advanced timers for tests
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualTimers {
    now: Duration,
    next_handle: u64,
    pending: std::collections::BTreeMap<(Duration, TimerHandle), TimerKind>,
}

#[cfg(test)]
impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward and returns every timer that fired, oldest first
    pub fn advance(&mut self, by: Duration) -> Vec<(TimerHandle, TimerKind)> {
        self.now += by;
        let mut fired = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > self.now {
                break;
            }
            let ((_, handle), kind) = entry.remove_entry();
            fired.push((handle, kind));
        }
        fired
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
impl Timers for ManualTimers {
    fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.pending.insert((self.now + delay, handle), kind);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        let key = self.pending.keys().find(|(_, h)| *h == handle).copied();
        key.map(|key| self.pending.remove(&key)).is_some()
    }
}
