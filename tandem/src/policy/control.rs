use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::event::Event;
use crate::policy::PolicyHandler;
use crate::runtime::{LoopContext, TimerId};
use crate::trace::{info, trace, warn};

/// What the control process believes about the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServiceStatus {
    /// No word from the service yet.
    #[default]
    Unknown,
    /// Ready or heartbeating within the watchdog timeout.
    Online,
    /// Connected but silent for longer than the watchdog timeout.
    Unresponsive,
    /// The connection is gone.
    Offline,
}

/// Point-in-time copy of the control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlSnapshot {
    pub status: ServiceStatus,
    pub launcher_running: bool,
    pub suppression_enabled: bool,
    pub heartbeats: u64,
    pub show_requests: u64,
    pub config_changes: u64,
}

/// Shared, read-mostly view of the control state for UI threads.
#[derive(Debug, Clone, Default)]
pub struct ControlView {
    inner: Arc<Mutex<ControlSnapshot>>,
}

impl ControlView {
    fn lock(&self) -> MutexGuard<'_, ControlSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        self.lock().status
    }

    #[must_use]
    pub fn snapshot(&self) -> ControlSnapshot {
        *self.lock()
    }

    fn update(&self, f: impl FnOnce(&mut ControlSnapshot)) {
        f(&mut self.lock());
    }
}

/// Foreground control policy.
///
/// Tracks service liveness with a one-shot watchdog that every
/// [`Event::ServiceReady`] or [`Event::Heartbeat`] re-arms; if it fires the
/// service is marked [`ServiceStatus::Unresponsive`]. Everything else is
/// recorded in the [`ControlView`] for the UI.
#[derive(Debug)]
pub struct ControlPolicy {
    watchdog_timeout: Duration,
    watchdog: Option<TimerId>,
    view: ControlView,
}

impl ControlPolicy {
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            watchdog_timeout: config.policy.watchdog_timeout(),
            watchdog: None,
            view: ControlView::default(),
        }
    }

    /// View shared with the UI. Clone it before handing the policy to the engine.
    #[must_use]
    pub fn view(&self) -> ControlView {
        self.view.clone()
    }

    fn arm_watchdog(&mut self, ctx: &mut LoopContext<'_>) {
        self.disarm_watchdog(ctx);
        let view = self.view.clone();
        let id = ctx.set_timer(
            self.watchdog_timeout,
            move |_: &mut LoopContext<'_>| {
                view.update(|s| {
                    if matches!(s.status, ServiceStatus::Online | ServiceStatus::Unknown) {
                        warn!("service unresponsive");
                        s.status = ServiceStatus::Unresponsive;
                    }
                });
            },
            false,
        );
        self.watchdog = Some(id);
    }

    fn disarm_watchdog(&mut self, ctx: &mut LoopContext<'_>) {
        if let Some(id) = self.watchdog.take() {
            ctx.cancel_timer(id);
        }
    }
}

impl PolicyHandler for ControlPolicy {
    fn process_event(&mut self, ctx: &mut LoopContext<'_>, event: Event) {
        match event {
            Event::PeerConnected => {
                info!("connected to service");
                self.view.update(|s| s.status = ServiceStatus::Unknown);
                self.arm_watchdog(ctx);
            }
            Event::PeerDisconnected => {
                info!("service connection lost");
                self.disarm_watchdog(ctx);
                self.view.update(|s| s.status = ServiceStatus::Offline);
            }
            Event::ServiceReady => {
                info!("service ready");
                self.view.update(|s| s.status = ServiceStatus::Online);
                self.arm_watchdog(ctx);
            }
            Event::Heartbeat => {
                trace!("heartbeat");
                self.view.update(|s| {
                    s.status = ServiceStatus::Online;
                    s.heartbeats += 1;
                });
                self.arm_watchdog(ctx);
            }
            Event::LauncherStarted => self.view.update(|s| s.launcher_running = true),
            Event::LauncherExited => self.view.update(|s| s.launcher_running = false),
            Event::SuppressionEnabled => self.view.update(|s| s.suppression_enabled = true),
            Event::SuppressionDisabled => self.view.update(|s| s.suppression_enabled = false),
            Event::ShowControl => self.view.update(|s| s.show_requests += 1),
            Event::ConfigChanged => self.view.update(|s| s.config_changes += 1),
            Event::ShutdownRequested => {
                info!("shutdown requested");
                self.disarm_watchdog(ctx);
                ctx.request_stop();
            }
        }
    }
}
