//! Decision logic plugged into the engine.
//!
//! The engine calls [`PolicyHandler::process_event`] on its loop thread for
//! every local event and every fresh remote event. Handlers must not block
//! beyond the bounded sends they make through the [`LoopContext`].
//!
//! - `service`: the background service side.
//! - `control`: the foreground control side.

mod control;
mod service;

pub use control::{ControlPolicy, ControlSnapshot, ControlView, ServiceStatus};
pub use service::ServicePolicy;

use crate::event::Event;
use crate::runtime::LoopContext;

/// Role-specific reaction to events.
pub trait PolicyHandler: Send {
    /// Handles one event on the loop thread.
    fn process_event(&mut self, ctx: &mut LoopContext<'_>, event: Event);
}

impl<F> PolicyHandler for F
where
    F: FnMut(&mut LoopContext<'_>, Event) + Send,
{
    fn process_event(&mut self, ctx: &mut LoopContext<'_>, event: Event) {
        self(ctx, event);
    }
}
