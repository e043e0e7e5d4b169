//! Backend targets, protocol descriptors and round-robin membership.

mod round_robin;
mod target;

pub use round_robin::RoundRobinQueue;
pub use target::BackendTarget;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest datagram a UDP peer can send us.
pub const UDP_MAX_DATAGRAM: usize = 0xFFFF;

/// Chunk size used when draining a TCP stream to EOF.
pub const TCP_READ_CHUNK: usize = 0xFFFF;

/// Transport protocol a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Maximum size of one received unit.
    ///
    /// For TCP, a stream framed by EOF, this is the per-read chunk and the
    /// health probe's reply budget. For UDP it is one datagram.
    pub const fn read_buffer_size(self) -> usize {
        match self {
            Protocol::Tcp => TCP_READ_CHUNK,
            Protocol::Udp => UDP_MAX_DATAGRAM,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key identifying one forwarding endpoint: (protocol, listen port).
///
/// Many backends share one `ForwardInfo`; each gets one forwarding group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForwardInfo {
    pub protocol: Protocol,
    pub port: u16,
}

impl ForwardInfo {
    pub const fn new(protocol: Protocol, port: u16) -> Self {
        Self { protocol, port }
    }

    /// The endpoint a backend is reachable behind.
    pub fn of(target: &BackendTarget) -> Self {
        Self::new(target.protocol(), target.port())
    }
}

impl fmt::Display for ForwardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_protocol_receive_sizes() {
        assert_eq!(Protocol::Tcp.read_buffer_size(), 65535);
        assert_eq!(Protocol::Udp.read_buffer_size(), 65535);
    }

    #[test]
    fn test_protocol_serde() {
        let p: Protocol = serde_json::from_str("\"TCP\"").unwrap();
        assert_eq!(p, Protocol::Tcp);
        let p: Protocol = serde_json::from_str("\"UDP\"").unwrap();
        assert_eq!(p, Protocol::Udp);
        assert!(serde_json::from_str::<Protocol>("\"SCTP\"").is_err());
    }

    #[test]
    fn test_forward_info_of_target() {
        let target = BackendTarget::new(
            Protocol::Udp,
            "192.168.0.7:5353".parse().unwrap(),
            Duration::from_secs(1),
        );
        let info = ForwardInfo::of(&target);
        assert_eq!(info, ForwardInfo::new(Protocol::Udp, 5353));
        assert_ne!(info, ForwardInfo::new(Protocol::Tcp, 5353));
        assert_eq!(info.to_string(), "UDP/5353");
    }
}
