//! Timeouts and deadlines for blocking calls.

use std::time::Duration;

use minstant::Instant;

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Self::Infinite, Self::Duration)
    }
}

impl Timeout {
    /// Absolute deadline measured from `now`, `None` when infinite.
    #[must_use]
    pub fn deadline_from(self, now: Instant) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::Duration(d) => Some(now + d),
        }
    }
}

/// Time left until `deadline`, zero once it has passed, `None` when there is no deadline.
#[must_use]
pub fn remaining(deadline: Option<Instant>, now: Instant) -> Option<Duration> {
    deadline.map(|dl| dl.checked_duration_since(now).unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_saturates() {
        let now = Instant::now();
        let dl = now + Duration::from_millis(10);
        assert_eq!(remaining(Some(dl), now), Some(Duration::from_millis(10)));
        assert_eq!(
            remaining(Some(now), now + Duration::from_millis(3)),
            Some(Duration::ZERO)
        );
        assert_eq!(remaining(None, now), None);
        assert_eq!(Timeout::Infinite.deadline_from(now), None);
    }

    #[test]
    fn option_conversion() {
        assert_eq!(Timeout::from(None), Timeout::Infinite);
        assert_eq!(
            Timeout::from(Some(Duration::from_secs(1))),
            Timeout::Duration(Duration::from_secs(1))
        );
    }
}
