//! Symbolic events exchanged between the control process and the service.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Closed set of events understood by both processes.
///
/// Events carry no payload beyond their identity. The discriminant is the
/// `u32` tag written on the wire, so existing values must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Event {
    /// A peer process connected to the channel (synthesised locally).
    PeerConnected = 1,
    /// The peer process went away (synthesised locally).
    PeerDisconnected = 2,
    /// Periodic liveness signal from the service.
    Heartbeat = 3,
    /// The service accepted the control process and is ready.
    ServiceReady = 4,
    /// A game launcher process was observed starting.
    LauncherStarted = 5,
    /// The observed game launcher exited.
    LauncherExited = 6,
    /// Overlay suppression was switched on.
    SuppressionEnabled = 7,
    /// Overlay suppression was switched off.
    SuppressionDisabled = 8,
    /// Settings changed; the receiver should reload them.
    ConfigChanged = 9,
    /// The receiver should stop its event loop.
    ShutdownRequested = 10,
    /// Bring the control window to the foreground.
    ShowControl = 11,
}

impl Event {
    /// Every event, in tag order.
    pub const ALL: [Self; 11] = [
        Self::PeerConnected,
        Self::PeerDisconnected,
        Self::Heartbeat,
        Self::ServiceReady,
        Self::LauncherStarted,
        Self::LauncherExited,
        Self::SuppressionEnabled,
        Self::SuppressionDisabled,
        Self::ConfigChanged,
        Self::ShutdownRequested,
        Self::ShowControl,
    ];

    /// Wire tag for this event.
    #[inline]
    #[must_use]
    pub const fn tag(self) -> u32 {
        self as u32
    }

    /// Kebab-case name used on the command line and in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PeerConnected => "peer-connected",
            Self::PeerDisconnected => "peer-disconnected",
            Self::Heartbeat => "heartbeat",
            Self::ServiceReady => "service-ready",
            Self::LauncherStarted => "launcher-started",
            Self::LauncherExited => "launcher-exited",
            Self::SuppressionEnabled => "suppression-enabled",
            Self::SuppressionDisabled => "suppression-disabled",
            Self::ConfigChanged => "config-changed",
            Self::ShutdownRequested => "shutdown-requested",
            Self::ShowControl => "show-control",
        }
    }

    /// Whether the engine produces this event itself from channel transitions.
    #[must_use]
    pub const fn is_synthetic(self) -> bool {
        matches!(self, Self::PeerConnected | Self::PeerDisconnected)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tag that does not name any [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown event tag {0}")]
pub struct UnknownTag(pub u32);

impl TryFrom<u32> for Event {
    type Error = UnknownTag;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|event| event.tag() == tag)
            .ok_or(UnknownTag(tag))
    }
}

impl From<Event> for u32 {
    fn from(event: Event) -> Self {
        event.tag()
    }
}

/// Name that does not match any [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event `{0}`")]
pub struct UnknownEventName(pub String);

impl FromStr for Event {
    type Err = UnknownEventName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|event| event.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownEventName(s.to_owned()))
    }
}
