//! Event loop runtime.
//!
//! - `engine`: the loop thread, its lifecycle and the handler-facing [`LoopContext`].
//! - `queue`: the cross-thread event queue and its eventfd wake signal.
//! - `timing`: timer registry and deadline helpers (loop-thread only).

pub mod engine;
pub mod queue;
pub mod timing;

pub use engine::{Engine, EngineError, EngineHandle, EngineState, LoopContext, TimerCallback};
pub use queue::{Envelope, EventQueue, WakeSignal};
pub use timing::{Timeout, TimerId, TimerRegistry};
