//! Local event queue and the loop's wake signal.
//!
//! Any thread may push into the [`EventQueue`]; only the loop thread drains
//! it. Every push pulses the [`WakeSignal`], an eventfd that the loop's
//! composite wait polls alongside the channel sockets.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::Sender;
use minstant::Instant;
use rustix::event::{EventfdFlags, eventfd};
use rustix::io::Errno;

use crate::event::Event;
use crate::trace::error;

/// Work item handed to the loop thread.
#[derive(Debug)]
pub enum Envelope {
    /// Dispatch `event` to the policy handler.
    Local(Event),
    /// Send `event` to the peer on behalf of another thread and report the
    /// outcome on `reply`. Abandoned once `deadline` has passed.
    Remote {
        event: Event,
        deadline: Instant,
        reply: Sender<bool>,
    },
    /// Arm a one-shot timer that wakes the loop after the given delay.
    ForceWake(Duration),
}

/// Edge-style wake primitive backed by a non-blocking eventfd.
///
/// Pulses coalesce: any number of [`pulse`](Self::pulse) calls before a
/// [`reset`](Self::reset) produce one readable edge. The `cancelled` flag is
/// sticky and tells blocking channel calls that the owner is stopping.
#[derive(Debug)]
pub struct WakeSignal {
    fd: OwnedFd,
    cancelled: AtomicBool,
}

impl WakeSignal {
    /// Creates an unsignalled, uncancelled wake signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the eventfd cannot be created.
    pub fn new() -> io::Result<Self> {
        let fd = eventfd(0, EventfdFlags::NONBLOCK | EventfdFlags::CLOEXEC)?;
        Ok(Self {
            fd,
            cancelled: AtomicBool::new(false),
        })
    }

    /// Makes the signal readable.
    pub fn pulse(&self) {
        match rustix::io::write(&self.fd, &1u64.to_ne_bytes()) {
            Ok(_) => {}
            // Counter saturated: the signal is already readable.
            Err(e) if e == Errno::AGAIN => {}
            Err(e) => error!(error = %e, "wake signal pulse failed"),
        }
    }

    /// Consumes pending pulses.
    pub fn reset(&self) {
        let mut buf = [0u8; 8];
        match rustix::io::read(&self.fd, &mut buf[..]) {
            Ok(_) => {}
            Err(e) if e == Errno::AGAIN => {}
            Err(e) => error!(error = %e, "wake signal reset failed"),
        }
    }

    /// Marks the owner as stopping and pulses.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.pulse();
    }

    /// Whether [`cancel`](Self::cancel) was called since the last [`rearm`](Self::rearm).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Clears the cancelled flag and any pending pulse.
    pub fn rearm(&self) {
        self.cancelled.store(false, Ordering::Release);
        self.reset();
    }
}

impl AsFd for WakeSignal {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for WakeSignal {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Unbounded FIFO of [`Envelope`]s shared between callers and the loop.
#[derive(Debug)]
pub struct EventQueue {
    items: Mutex<VecDeque<Envelope>>,
    wake: Arc<WakeSignal>,
}

impl EventQueue {
    /// Creates an empty queue that pulses `wake` on every push.
    #[must_use]
    pub fn new(wake: Arc<WakeSignal>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            wake,
        }
    }

    // Pushes and swaps never leave the deque half-modified; poison is ignored.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.items
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Appends `envelope` and wakes the loop.
    pub fn push(&self, envelope: Envelope) {
        self.lock().push_back(envelope);
        self.wake.pulse();
    }

    /// Appends a local event and wakes the loop.
    pub fn notify(&self, event: Event) {
        self.push(Envelope::Local(event));
    }

    /// Takes everything queued so far, leaving the queue empty.
    ///
    /// The lock is released before the caller dispatches, so handlers may
    /// push again; those items land in the next batch.
    #[must_use]
    pub fn take_batch(&self) -> VecDeque<Envelope> {
        std::mem::take(&mut *self.lock())
    }

    /// Discards everything queued. Pending remote requests see their reply
    /// channel disconnect.
    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// The signal pulsed by this queue.
    #[must_use]
    pub fn wake_signal(&self) -> &Arc<WakeSignal> {
        &self.wake
    }
}

/// Whether the signal is currently readable, without consuming it.
#[cfg(test)]
pub(crate) fn is_signalled(wake: &WakeSignal) -> bool {
    use mio::unix::SourceFd;
    use mio::{Events, Interest, Poll, Token};

    // A fresh epoll instance reports current readiness on registration.
    let mut poll = Poll::new().unwrap();
    poll.registry()
        .register(&mut SourceFd(&wake.as_raw_fd()), Token(0), Interest::READABLE)
        .unwrap();
    let mut events = Events::with_capacity(1);
    poll.poll(&mut events, Some(Duration::ZERO)).unwrap();
    !events.is_empty()
}

#[cfg(test)]
mod tests {
    use std::thread;

    use proptest::prelude::*;

    use super::*;

    fn queue() -> EventQueue {
        EventQueue::new(Arc::new(WakeSignal::new().unwrap()))
    }

    fn locals(batch: VecDeque<Envelope>) -> Vec<Event> {
        batch
            .into_iter()
            .map(|env| match env {
                Envelope::Local(event) => event,
                other => panic!("unexpected envelope {other:?}"),
            })
            .collect()
    }

    #[test]
    fn pulse_and_reset() {
        let wake = WakeSignal::new().unwrap();
        assert!(!is_signalled(&wake));
        wake.pulse();
        wake.pulse();
        assert!(is_signalled(&wake));
        wake.reset();
        assert!(!is_signalled(&wake));
        wake.reset();
    }

    #[test]
    fn cancel_is_sticky_until_rearm() {
        let wake = WakeSignal::new().unwrap();
        wake.cancel();
        assert!(wake.is_cancelled());
        wake.reset();
        assert!(wake.is_cancelled());
        wake.rearm();
        assert!(!wake.is_cancelled());
        assert!(!is_signalled(&wake));
    }

    #[test]
    fn push_pulses_wake() {
        let q = queue();
        assert!(q.is_empty());
        q.notify(Event::Heartbeat);
        assert!(is_signalled(q.wake_signal()));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn take_batch_empties_queue() {
        let q = queue();
        q.notify(Event::LauncherStarted);
        q.notify(Event::LauncherExited);
        let batch = q.take_batch();
        assert!(q.is_empty());
        assert_eq!(locals(batch), vec![Event::LauncherStarted, Event::LauncherExited]);
    }

    #[test]
    fn clear_disconnects_remote_replies() {
        let q = queue();
        let (tx, rx) = crossbeam_channel::bounded(1);
        q.push(Envelope::Remote {
            event: Event::ConfigChanged,
            deadline: Instant::now(),
            reply: tx,
        });
        q.clear();
        assert!(rx.recv().is_err());
    }

    #[test]
    fn concurrent_producers_keep_per_thread_order() {
        let q = Arc::new(queue());
        let handles: Vec<_> = [Event::LauncherStarted, Event::ShowControl]
            .into_iter()
            .map(|event| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for _ in 0..100 {
                        q.notify(event);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let events = locals(q.take_batch());
        assert_eq!(events.len(), 200);
        assert_eq!(events.iter().filter(|e| **e == Event::ShowControl).count(), 100);
    }

    proptest! {
        #[test]
        fn batch_preserves_push_order(tags in proptest::collection::vec(1u32..=11, 0..64)) {
            let q = queue();
            let pushed: Vec<Event> = tags
                .into_iter()
                .map(|t| Event::try_from(t).unwrap())
                .collect();
            for event in &pushed {
                q.notify(*event);
            }
            prop_assert_eq!(locals(q.take_batch()), pushed);
        }
    }
}
