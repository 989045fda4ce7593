//! Timer registry driven by the loop thread.
//!
//! Timers live in a [`Slab`] and are addressed by [`TimerId`], which pairs the
//! slot with a strictly increasing sequence number. The sequence is the
//! generation check: a stale id whose slot has been reused never matches.
//!
//! A fire scan snapshots the due timers first and then invokes them one by
//! one, so callbacks may create or cancel timers freely. Cancelled and retired
//! timers stay in their slots until [`TimerRegistry::compact`] runs at the end
//! of the scan.

use std::fmt;
use std::time::Duration;

use minstant::Instant;

use super::slab::{Slab, SlabIndex};
use crate::trace::trace;

/// Identity of a scheduled timer.
///
/// Ordered by creation: ids from one registry strictly increase and are never
/// reused, even after cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId {
    seq: u64,
    slot: u32,
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.seq)
    }
}

struct Timer<T> {
    seq: u64,
    expiry: Instant,
    /// `Some` for recurring timers.
    interval: Option<Duration>,
    /// Taken while the callback runs.
    payload: Option<T>,
    cancelled: bool,
    /// One-shot that already fired; freed by the next compaction.
    retired: bool,
}

impl<T> Timer<T> {
    const fn is_active(&self) -> bool {
        !self.cancelled && !self.retired
    }
}

/// Set of one-shot and recurring timers.
pub struct TimerRegistry<T> {
    slab: Slab<Timer<T>>,
    next_seq: u64,
}

impl<T> Default for TimerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TimerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("active", &self.len())
            .field("slots", &self.slab.len())
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

impl<T> TimerRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slab: Slab::new(),
            next_seq: 1,
        }
    }

    /// Schedules `payload` to fire `delay` after `now`.
    ///
    /// A recurring timer fires every `delay` thereafter, measured from the
    /// time of each scan that fires it.
    pub fn set_timer(
        &mut self,
        now: Instant,
        delay: Duration,
        payload: T,
        recurring: bool,
    ) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let idx = self.slab.insert(Timer {
            seq,
            expiry: now + delay,
            interval: recurring.then_some(delay),
            payload: Some(payload),
            cancelled: false,
            retired: false,
        });
        TimerId {
            seq,
            slot: idx.into(),
        }
    }

    /// Cancels a timer. Returns `false` if it already fired, was already
    /// cancelled, or is unknown.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        match self.timer_mut(id) {
            Some(timer) if timer.is_active() => {
                timer.cancelled = true;
                true
            }
            _ => false,
        }
    }

    /// Whether `id` is still scheduled.
    #[must_use]
    pub fn is_active(&self, id: TimerId) -> bool {
        self.timer(id).is_some_and(Timer::is_active)
    }

    /// Scheduled expiry of `id`, if still active.
    #[must_use]
    pub fn expiry_of(&self, id: TimerId) -> Option<Instant> {
        self.timer(id)
            .filter(|timer| timer.is_active())
            .map(|timer| timer.expiry)
    }

    /// Earliest expiry among active timers.
    #[must_use]
    pub fn next_expiry(&self) -> Option<Instant> {
        self.slab
            .iter()
            .filter(|(_, timer)| timer.is_active())
            .map(|(_, timer)| timer.expiry)
            .fold(None, |earliest, expiry| match earliest {
                Some(e) if e <= expiry => Some(e),
                _ => Some(expiry),
            })
    }

    /// Number of active timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slab.iter().filter(|(_, t)| t.is_active()).count()
    }

    /// Whether no timer is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fires every active timer whose expiry is at or before `now`.
    ///
    /// Timers fire in slot order, not in expiry or creation order. `on_fire`
    /// receives the registry itself so callbacks can schedule or cancel
    /// timers; timers created during the scan do not fire in it, and a timer
    /// cancelled by an earlier callback of the same scan is skipped. A
    /// recurring timer is rescheduled to `now + interval` unless it was
    /// cancelled while firing.
    ///
    /// Returns the number of callbacks invoked.
    pub fn fire_expired<F>(&mut self, now: Instant, mut on_fire: F) -> usize
    where
        F: FnMut(&mut Self, TimerId, &mut T),
    {
        let due: Vec<TimerId> = self
            .slab
            .iter()
            .filter(|(_, timer)| timer.is_active() && timer.expiry <= now)
            .map(|(idx, timer)| TimerId {
                seq: timer.seq,
                slot: idx.into(),
            })
            .collect();

        let mut fired = 0;
        for id in due {
            let Some(mut payload) = self
                .timer_mut(id)
                .filter(|timer| timer.is_active())
                .and_then(|timer| timer.payload.take())
            else {
                continue;
            };

            trace!(timer = %id, "timer fired");
            on_fire(self, id, &mut payload);
            fired += 1;

            if let Some(timer) = self.timer_mut(id) {
                match timer.interval {
                    Some(interval) if !timer.cancelled => {
                        timer.expiry = now + interval;
                        timer.payload = Some(payload);
                    }
                    _ => timer.retired = true,
                }
            }
        }

        self.compact();
        fired
    }

    /// Frees the slots of cancelled and retired timers.
    pub fn compact(&mut self) {
        self.slab.retain(Timer::is_active);
    }

    /// Drops every timer. Sequence numbers keep increasing afterwards.
    pub fn clear(&mut self) {
        self.slab.clear();
    }

    fn timer(&self, id: TimerId) -> Option<&Timer<T>> {
        self.slab
            .get(SlabIndex::from(id.slot))
            .filter(|timer| timer.seq == id.seq)
    }

    fn timer_mut(&mut self, id: TimerId) -> Option<&mut Timer<T>> {
        self.slab
            .get_mut(SlabIndex::from(id.slot))
            .filter(|timer| timer.seq == id.seq)
    }
}
