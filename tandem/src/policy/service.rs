use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::event::Event;
use crate::policy::PolicyHandler;
use crate::runtime::{LoopContext, TimerId};
use crate::trace::{debug, info, trace};

/// Background service policy.
///
/// Greets each control process with [`Event::ServiceReady`], then sends a
/// [`Event::Heartbeat`] every heartbeat interval for as long as it stays
/// connected. Launcher, suppression and show requests raised locally are
/// forwarded to the control process.
#[derive(Debug)]
pub struct ServicePolicy {
    heartbeat_interval: Duration,
    send_timeout: Duration,
    heartbeat: Option<TimerId>,
}

impl ServicePolicy {
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            heartbeat_interval: config.policy.heartbeat_interval(),
            send_timeout: config.engine.remote_send_timeout(),
            heartbeat: None,
        }
    }

    fn start_heartbeat(&mut self, ctx: &mut LoopContext<'_>) {
        self.stop_heartbeat(ctx);
        let timeout = self.send_timeout;
        let id = ctx.set_timer(
            self.heartbeat_interval,
            move |ctx: &mut LoopContext<'_>| {
                if !ctx.notify_remote(Event::Heartbeat, timeout) {
                    debug!("heartbeat not delivered");
                }
            },
            true,
        );
        self.heartbeat = Some(id);
    }

    fn stop_heartbeat(&mut self, ctx: &mut LoopContext<'_>) {
        if let Some(id) = self.heartbeat.take() {
            ctx.cancel_timer(id);
        }
    }
}

impl PolicyHandler for ServicePolicy {
    fn process_event(&mut self, ctx: &mut LoopContext<'_>, event: Event) {
        match event {
            Event::PeerConnected => {
                info!("control process connected");
                ctx.notify_remote(Event::ServiceReady, self.send_timeout);
                self.start_heartbeat(ctx);
            }
            Event::PeerDisconnected => {
                info!("control process disconnected");
                self.stop_heartbeat(ctx);
            }
            Event::LauncherStarted
            | Event::LauncherExited
            | Event::SuppressionEnabled
            | Event::SuppressionDisabled
            | Event::ShowControl => {
                if !ctx.notify_remote(event, self.send_timeout) {
                    debug!(%event, "not forwarded, no control process");
                }
            }
            Event::ConfigChanged => info!("configuration change requested"),
            Event::ShutdownRequested => {
                info!("shutdown requested");
                self.stop_heartbeat(ctx);
                ctx.request_stop();
            }
            Event::Heartbeat | Event::ServiceReady => {
                trace!(%event, "ignored by service");
            }
        }
    }
}
