//! Cross-process transport.
//!
//! - `endpoint`: abstract socket names and server discovery.
//! - `socket`: non-blocking `SOCK_SEQPACKET` sockets for mio.
//! - `channel`: the connection state machine and record I/O on top.

pub mod channel;
pub mod endpoint;
pub mod socket;

pub use channel::{Channel, ChannelError, ConnectionState, Role};
pub use endpoint::{EndpointName, InvalidEndpoint, is_server_available};
