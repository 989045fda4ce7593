//! Endpoint naming and server discovery.
//!
//! Endpoints live in the Linux abstract socket namespace: the name is not a
//! filesystem path, needs no cleanup, and disappears when the owning socket
//! is closed.

use std::fmt;
use std::fs;
use std::io::ErrorKind;

use thiserror::Error;

use super::socket::SeqPacketListener;
use crate::trace::debug;

/// Longest abstract name: `sun_path` minus the leading NUL.
pub const MAX_NAME_LEN: usize = 107;

/// The name cannot be used as an abstract socket address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid endpoint name `{name}`: {reason}")]
pub struct InvalidEndpoint {
    pub name: String,
    pub reason: &'static str,
}

/// Validated abstract socket name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointName(String);

impl EndpointName {
    /// Validates `name`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEndpoint`] if the name is empty, longer than
    /// [`MAX_NAME_LEN`] bytes or contains a NUL byte.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidEndpoint> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("name must not be empty")
        } else if name.len() > MAX_NAME_LEN {
            Some("name length must be <= 107 bytes")
        } else if name.contains('\0') {
            Some("name must not contain NUL")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(InvalidEndpoint { name, reason }),
            None => Ok(Self(name)),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Kernel table of Unix sockets in this network namespace.
const PROC_NET_UNIX: &str = "/proc/net/unix";

/// `__SO_ACCEPTCON` in the table's `Flags` column: the socket is listening.
const SO_ACCEPTCON: u32 = 0x0001_0000;

/// `SOCK_SEQPACKET` in the table's `Type` column.
const SEQPACKET_TYPE: u32 = 5;

/// Whether a server is listening on `name`.
///
/// Looks the name up in `/proc/net/unix` without touching it, so a server
/// binding at the same moment is never disturbed. If the table cannot be
/// read, falls back to binding a throwaway socket: `EADDRINUSE` then means
/// another socket holds the name. Never blocks.
#[must_use]
pub fn is_server_available(name: &EndpointName) -> bool {
    match fs::read_to_string(PROC_NET_UNIX) {
        Ok(table) => table_has_listener(&table, name),
        Err(e) => {
            debug!(endpoint = %name, error = %e, "socket table unreadable, checking by bind");
            name_is_bound(name)
        }
    }
}

fn name_is_bound(name: &EndpointName) -> bool {
    match SeqPacketListener::bind_unlistened(name) {
        Ok(_throwaway) => false,
        Err(e) if e.kind() == ErrorKind::AddrInUse => true,
        Err(e) => {
            debug!(endpoint = %name, error = %e, "server check failed");
            false
        }
    }
}

/// Whether `table` lists a listening sequenced-packet socket bound to `name`.
fn table_has_listener(table: &str, name: &EndpointName) -> bool {
    let path = name.to_string();
    table
        .lines()
        .skip(1)
        .filter_map(parse_socket_line)
        .any(|(flags, kind, bound)| {
            flags & SO_ACCEPTCON != 0 && kind == SEQPACKET_TYPE && bound == path
        })
}

/// Splits `Num RefCount Protocol Flags Type St Inode Path` into flags, type
/// and the path, which runs to the end of the line and may contain spaces.
fn parse_socket_line(line: &str) -> Option<(u32, u32, &str)> {
    let mut rest = line.trim_start();
    let mut fields = [""; 7];
    for field in &mut fields {
        let end = rest.find(char::is_whitespace)?;
        *field = &rest[..end];
        rest = rest[end..].trim_start();
    }
    let flags = u32::from_str_radix(fields[3], 16).ok()?;
    let kind = u32::from_str_radix(fields[4], 16).ok()?;
    Some((flags, kind, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_names() {
        assert!(EndpointName::new("tandem.control").is_ok());
        assert!(EndpointName::new("a".repeat(MAX_NAME_LEN)).is_ok());

        let err = EndpointName::new("").unwrap_err();
        assert_eq!(err.reason, "name must not be empty");
        let err = EndpointName::new("a".repeat(MAX_NAME_LEN + 1)).unwrap_err();
        assert_eq!(err.reason, "name length must be <= 107 bytes");
        let err = EndpointName::new("bad\0name").unwrap_err();
        assert_eq!(err.reason, "name must not contain NUL");
    }

    #[test]
    fn display_marks_abstract() {
        let name = EndpointName::new("tandem.control").unwrap();
        assert_eq!(name.to_string(), "@tandem.control");
    }

    #[test]
    fn availability_follows_listening_socket() {
        let name = EndpointName::new(format!("tandem.avail.{}", std::process::id())).unwrap();
        assert!(!is_server_available(&name));

        // Bound but not listening is no server.
        let bound = SeqPacketListener::bind_unlistened(&name).unwrap();
        assert!(!is_server_available(&name));
        drop(bound);

        let listener = SeqPacketListener::bind(&name, 1).unwrap();
        assert!(is_server_available(&name));
        // Checking neither connects nor holds the name.
        assert!(listener.try_accept().unwrap().is_none());
        drop(listener);
        assert!(!is_server_available(&name));
        drop(SeqPacketListener::bind(&name, 1).unwrap());
    }

    #[test]
    fn socket_table_lines() {
        let name = EndpointName::new("tandem control").unwrap();
        let table = "\
Num       RefCount Protocol Flags    Type St Inode Path
0000000000000000: 00000002 00000000 00010000 0001 01 20412 @tandem control
0000000000000000: 00000002 00000000 00000000 0005 01 20413 @tandem control
0000000000000000: 00000003 00000000 00000000 0005 03 20414
0000000000000000: 00000002 00000000 00010000 0005 01  9415 @tandem control2
";
        assert!(!table_has_listener(table, &name), "stream and unlistened only");

        let listening = format!(
            "{table}0000000000000000: 00000002 00000000 00010000 0005 01  9416 @tandem control\n"
        );
        assert!(table_has_listener(&listening, &name));

        assert_eq!(
            parse_socket_line("0000000000000000: 00000002 00000000 00010000 0005 01  9416 @a b"),
            Some((SO_ACCEPTCON, SEQPACKET_TYPE, "@a b"))
        );
        assert_eq!(parse_socket_line("garbage"), None);
    }
}
