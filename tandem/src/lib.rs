//! Event-driven coordination between a foreground control process and a
//! background service on the same host.
//!
//! Each process runs one [`Engine`]: a dedicated loop thread that owns a
//! [`Channel`] to the peer, a timer registry and a [`PolicyHandler`]. Local
//! events, remote events and timer expirations are all delivered to the
//! handler on that thread.

// Bindings that only feed log fields go unused when the trace macros are no-ops.
#![cfg_attr(not(feature = "tracing"), allow(unused_variables))]

pub mod config;
pub mod context;
pub mod event;
pub mod ipc;
pub mod policy;
pub mod runtime;
pub mod trace;
pub mod wire;

pub use config::{ConfigError, RuntimeConfig};
pub use context::RuntimeContext;
pub use event::Event;
pub use ipc::{Channel, ChannelError, ConnectionState, EndpointName, Role, is_server_available};
pub use policy::{ControlPolicy, ControlView, PolicyHandler, ServicePolicy, ServiceStatus};
pub use runtime::{Engine, EngineError, EngineHandle, EngineState, LoopContext, TimerId};
pub use trace::init_tracing;
pub use wire::WireMessage;
