//! Timing primitives for the loop thread.
//!
//! - `registry`: one-shot and recurring timers addressed by [`TimerId`].
//! - `time`: [`Timeout`] and deadline arithmetic for blocking calls.

mod registry;
mod slab;
mod time;

pub use registry::{TimerId, TimerRegistry};
pub use time::{Timeout, remaining};
