//! The event loop.
//!
//! An [`Engine`] owns one [`Channel`], a [`TimerRegistry`] and a
//! [`PolicyHandler`], and runs them on a single dedicated thread. Other
//! threads talk to it only through the [`EventQueue`]:
//!
//! ```text
//!   notify(event) ──────────┐
//!   notify_remote(event) ───┤ EventQueue ──► loop thread ──► PolicyHandler
//!                           │   (mutex)        │   ▲
//!   peer process ◄──────────┼──── Channel ◄────┘   │
//!                           └──────────────── TimerRegistry
//! ```
//!
//! One iteration of the loop:
//!
//! 1. If the queue is empty, block in [`Channel::wait`] until a record
//!    arrives, the peer comes or goes, the queue is pushed to, or the next
//!    timer is due.
//! 2. Dispatch every queued local event in FIFO order.
//! 3. Dispatch every record already received, dropping stale ones.
//! 4. Fire expired timers.
//!
//! Connection changes seen after each phase are turned into exactly one
//! synthetic [`Event::PeerConnected`] or [`Event::PeerDisconnected`], queued
//! like any local event. Transport errors never reach the handler.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use super::queue::{Envelope, EventQueue, WakeSignal};
use super::timing::{Timeout, TimerId, TimerRegistry};
use crate::config::EngineConfig;
use crate::context::RuntimeContext;
use crate::event::Event;
use crate::ipc::{Channel, ChannelError, ConnectionState};
use crate::policy::PolicyHandler;
use crate::trace::{debug, error, info, trace, warn};
use crate::wire::{WireMessage, monotonic_ms};

/// Part of a cross-thread `notify_remote` budget kept back for the reply.
pub const REPLY_MARGIN: Duration = Duration::from_millis(5);

/// Callback run by a timer on the loop thread.
pub type TimerCallback = Box<dyn FnMut(&mut LoopContext<'_>) + Send>;

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The loop thread could not be started.
    #[error("failed to spawn loop thread")]
    Spawn(#[source] io::Error),
    /// The loop thread panicked; its channel, timers and handler are lost.
    #[error("event loop panicked")]
    LoopPanicked,
    /// The channel could not be wired to the wake signal.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// The wake signal could not be created.
    #[error("failed to create wake signal")]
    WakeSignal(#[source] io::Error),
}

/// Lifecycle of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Constructed, never started.
    NotRunning,
    /// The loop thread is running.
    Running,
    /// Stop was requested; the loop thread may still be finishing.
    StopRequested,
    /// The loop thread was joined. The engine may be started again.
    Joined,
}

/// State shared between the owner, foreign threads and the loop thread.
struct Shared {
    queue: EventQueue,
    running: AtomicBool,
    loop_thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn wake(&self) -> &WakeSignal {
        self.queue.wake_signal()
    }

    fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake().cancel();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn on_loop_thread(&self) -> bool {
        let current = thread::current().id();
        self.loop_thread
            .lock()
            .map(|id| *id == Some(current))
            .unwrap_or(false)
    }

    fn set_loop_thread(&self, id: Option<ThreadId>) {
        if let Ok(mut slot) = self.loop_thread.lock() {
            *slot = id;
        }
    }
}

/// Marks the loop stopped when the loop thread ends, including by unwinding.
///
/// Dropping the queued envelopes disconnects every pending
/// [`EngineHandle::notify_remote`] reply, so waiting callers return at once.
struct LoopExit<'a>(&'a Shared);

impl Drop for LoopExit<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("loop thread panicked");
        }
        self.0.running.store(false, Ordering::Release);
        self.0.set_loop_thread(None);
        self.0.queue.clear();
    }
}

/// Everything the loop thread owns while it runs.
struct LoopState {
    channel: Channel,
    timers: TimerRegistry<TimerCallback>,
    handler: Box<dyn PolicyHandler>,
}

/// Cloneable handle for posting events from any thread.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("running", &self.shared.is_running())
            .finish_non_exhaustive()
    }
}

impl EngineHandle {
    /// Queues `event` for the local handler. Never blocks beyond the queue lock.
    pub fn notify(&self, event: Event) {
        self.shared.queue.notify(event);
    }

    /// Sends `event` to the peer process through the loop thread.
    ///
    /// Blocks the calling thread until the loop thread reports the outcome
    /// or `timeout` elapses. Returns `false` if the engine is not running,
    /// the write failed or timed out, or this is called from the loop thread
    /// itself (use [`LoopContext::notify_remote`] there).
    ///
    /// `true` means the record was written. `false` means the write was not
    /// confirmed: the loop gives up [`REPLY_MARGIN`] before `timeout` so the
    /// reply normally arrives in time, but a loop thread descheduled past
    /// that margin may still deliver a record the caller saw fail.
    pub fn notify_remote(&self, event: Event, timeout: Duration) -> bool {
        if !self.shared.is_running() {
            debug!(%event, "notify_remote on stopped engine");
            return false;
        }
        if self.shared.on_loop_thread() {
            warn!(%event, "notify_remote called on the loop thread");
            return false;
        }

        let (reply, outcome) = crossbeam_channel::bounded(1);
        self.shared.queue.push(Envelope::Remote {
            event,
            deadline: Instant::now() + timeout,
            reply,
        });
        outcome.recv_timeout(timeout).unwrap_or(false)
    }

    /// Asks the loop to exit. Does not block.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }
}

/// Single-threaded event loop with timers and a peer channel.
pub struct Engine {
    shared: Arc<Shared>,
    config: EngineConfig,
    role: &'static str,
    /// Loop state while no thread owns it.
    idle: Option<LoopState>,
    thread: Option<JoinHandle<LoopState>>,
    joined: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("role", &self.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Binds `channel` and `handler` into a new, stopped engine.
    ///
    /// # Errors
    ///
    /// [`EngineError::WakeSignal`] if the eventfd cannot be created, or
    /// [`EngineError::Channel`] if the channel cannot poll it.
    pub fn new(
        ctx: &RuntimeContext,
        mut channel: Channel,
        handler: Box<dyn PolicyHandler>,
    ) -> Result<Self, EngineError> {
        let wake = Arc::new(WakeSignal::new().map_err(EngineError::WakeSignal)?);
        channel.set_cancel_event(Arc::clone(&wake))?;
        Ok(Self {
            shared: Arc::new(Shared {
                queue: EventQueue::new(wake),
                running: AtomicBool::new(false),
                loop_thread: Mutex::new(None),
            }),
            config: ctx.config().engine.clone(),
            role: ctx.role_name(),
            idle: Some(LoopState {
                channel,
                timers: TimerRegistry::new(),
                handler,
            }),
            thread: None,
            joined: false,
        })
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        match (&self.thread, self.shared.is_running()) {
            (Some(_), true) => EngineState::Running,
            (Some(_), false) => EngineState::StopRequested,
            (None, _) if self.joined => EngineState::Joined,
            (None, _) => EngineState::NotRunning,
        }
    }

    /// Handle for other threads.
    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawns the loop thread. Does nothing if it is already running; a loop
    /// that stopped on its own is joined first.
    ///
    /// # Errors
    ///
    /// [`EngineError::Spawn`] if the thread cannot be created (the loop
    /// state is lost), or [`EngineError::LoopPanicked`] if a previous run
    /// panicked.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.thread.is_some() {
            if self.shared.is_running() {
                return Ok(());
            }
            self.wait(self.config.force_wake())?;
        }
        let state = self.idle.take().ok_or(EngineError::LoopPanicked)?;

        self.shared.wake().rearm();
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let role = self.role;
        let handle = thread::Builder::new()
            .name(format!("tandem-{role}"))
            .spawn(move || {
                let _exit = LoopExit(&shared);
                shared.set_loop_thread(Some(thread::current().id()));
                info!(role, "loop thread started");
                let state = run_loop(&shared, state, &config);
                info!(role, "loop thread exiting");
                state
            })
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                error!(role, error = %e, "failed to spawn loop thread");
                EngineError::Spawn(e)
            })?;

        self.thread = Some(handle);
        self.joined = false;
        Ok(())
    }

    /// Asks the loop to exit and wakes it. Does not block.
    pub fn stop(&self) {
        debug!(role = self.role, "stop requested");
        self.shared.request_stop();
    }

    /// Joins the loop thread, then drops every timer.
    ///
    /// If the loop is still running, a one-shot timer is armed first so the
    /// loop wakes after `timeout` even if no other wake arrives. Returns at
    /// once if the loop was never started.
    ///
    /// # Errors
    ///
    /// [`EngineError::LoopPanicked`] if the loop thread panicked.
    pub fn wait(&mut self, timeout: Duration) -> Result<(), EngineError> {
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };
        if self.shared.is_running() {
            self.shared.queue.push(Envelope::ForceWake(timeout));
        }

        debug!(role = self.role, "waiting for loop thread");
        let joined = handle.join();
        self.joined = true;
        self.shared.queue.clear();
        match joined {
            Ok(mut state) => {
                state.timers.clear();
                self.idle = Some(state);
                Ok(())
            }
            Err(_) => {
                error!(role = self.role, "loop thread panicked");
                Err(EngineError::LoopPanicked)
            }
        }
    }

    /// [`stop`](Self::stop) followed by [`wait`](Self::wait) with the
    /// configured force-wake delay.
    ///
    /// # Errors
    ///
    /// See [`wait`](Self::wait).
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        self.stop();
        self.wait(self.config.force_wake())
    }

    /// Queues `event` for the local handler.
    pub fn notify(&self, event: Event) {
        self.shared.queue.notify(event);
    }

    /// See [`EngineHandle::notify_remote`].
    pub fn notify_remote(&self, event: Event, timeout: Duration) -> bool {
        self.handle().notify_remote(event, timeout)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.shutdown();
        }
    }
}

/// Engine access for handlers and timer callbacks.
///
/// Only the loop thread ever holds one, so timer and channel operations made
/// through it cannot race.
pub struct LoopContext<'a> {
    shared: &'a Shared,
    channel: &'a mut Channel,
    timers: &'a mut TimerRegistry<TimerCallback>,
}

impl<'a> LoopContext<'a> {
    fn new(
        shared: &'a Shared,
        channel: &'a mut Channel,
        timers: &'a mut TimerRegistry<TimerCallback>,
    ) -> Self {
        Self {
            shared,
            channel,
            timers,
        }
    }

    /// Schedules `callback` after `delay`, repeating every `delay` if `recurring`.
    pub fn set_timer<F>(&mut self, delay: Duration, callback: F, recurring: bool) -> TimerId
    where
        F: FnMut(&mut LoopContext<'_>) + Send + 'static,
    {
        let id = self
            .timers
            .set_timer(Instant::now(), delay, Box::new(callback), recurring);
        trace!(timer = %id, ?delay, recurring, "timer set");
        id
    }

    /// Cancels a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        let cancelled = self.timers.cancel_timer(id);
        trace!(timer = %id, cancelled, "timer cancel");
        cancelled
    }

    /// Number of scheduled timers, the engine's own included.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Queues a local event; it is handled in a later batch.
    pub fn notify(&mut self, event: Event) {
        self.shared.queue.notify(event);
    }

    /// Writes `event` to the peer, blocking the loop for up to `timeout`.
    pub fn notify_remote(&mut self, event: Event, timeout: Duration) -> bool {
        match self.channel.write(&WireMessage::now(event), timeout) {
            Ok(()) => {
                trace!(%event, "sent");
                true
            }
            Err(e) => {
                debug!(%event, error = %e, "remote notify dropped");
                false
            }
        }
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    /// Makes the loop exit after the current phase.
    pub fn request_stop(&mut self) {
        self.shared.request_stop();
    }
}

/// Queues one synthetic event per observed connection change.
fn observe_connection(shared: &Shared, channel: &Channel, connected: &mut bool) {
    let now_connected = channel.is_connected();
    if now_connected != *connected {
        *connected = now_connected;
        let event = if now_connected {
            Event::PeerConnected
        } else {
            Event::PeerDisconnected
        };
        debug!(endpoint = %channel.name(), %event, "connection changed");
        shared.queue.notify(event);
    }
}

fn run_loop(shared: &Shared, mut state: LoopState, config: &EngineConfig) -> LoopState {
    let LoopState {
        channel,
        timers,
        handler,
    } = &mut state;
    let mut connected = channel.is_connected();

    while shared.is_running() {
        if shared.queue.is_empty() {
            let timeout = timers
                .next_expiry()
                .map(|at| at.checked_duration_since(Instant::now()).unwrap_or(Duration::ZERO));
            if let Err(e) = channel.wait(Timeout::from(timeout)) {
                warn!(endpoint = %channel.name(), error = %e, "channel wait failed, resetting");
                channel.reset_connection();
            }
        }
        observe_connection(shared, channel, &mut connected);
        if !shared.is_running() {
            break;
        }

        for envelope in shared.queue.take_batch() {
            match envelope {
                Envelope::Local(event) => {
                    trace!(%event, "local event");
                    let mut ctx = LoopContext::new(shared, channel, timers);
                    handler.process_event(&mut ctx, event);
                }
                Envelope::Remote {
                    event,
                    deadline,
                    reply,
                } => {
                    let budget = deadline
                        .checked_duration_since(Instant::now())
                        .map(|left| left.saturating_sub(REPLY_MARGIN));
                    let sent = match budget {
                        Some(left) if !left.is_zero() => {
                            LoopContext::new(shared, channel, timers).notify_remote(event, left)
                        }
                        _ => false,
                    };
                    let _ = reply.try_send(sent);
                }
                Envelope::ForceWake(delay) => {
                    timers.set_timer(
                        Instant::now(),
                        delay,
                        Box::new(|ctx: &mut LoopContext<'_>| {
                            trace!("force wake");
                            ctx.shared.wake().pulse();
                        }),
                        false,
                    );
                }
            }
        }
        observe_connection(shared, channel, &mut connected);

        let threshold = config.stale_threshold();
        while let Some(msg) = channel.read() {
            let now_ms = monotonic_ms();
            if msg.is_stale(now_ms, threshold) {
                trace!(event = %msg.event, age_ms = msg.age_ms(now_ms), "dropping stale record");
                continue;
            }
            if msg.event.is_synthetic() {
                trace!(event = %msg.event, "dropping synthetic event from peer");
                continue;
            }
            trace!(event = %msg.event, age_ms = msg.age_ms(now_ms), "remote event");
            let mut ctx = LoopContext::new(shared, channel, timers);
            handler.process_event(&mut ctx, msg.event);
        }
        observe_connection(shared, channel, &mut connected);

        timers.fire_expired(Instant::now(), |timers, _, callback| {
            let mut ctx = LoopContext::new(shared, channel, timers);
            callback(&mut ctx);
        });
    }

    let dropped = shared.queue.len();
    if dropped > 0 {
        debug!(dropped, "discarding queued events at exit");
    }
    shared.queue.clear();
    state
}
