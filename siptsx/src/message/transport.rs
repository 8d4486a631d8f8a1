use std::fmt;

use serde::{Deserialize, Serialize};

/// The transport protocol named in a Via header and implemented by a
/// transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    Ws,
}

impl TransportKind {
    /// The token used in the Via transport slot.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Ws => "WS",
        }
    }

    /// The underlying network protocol, as used in SRV service names.
    pub fn network(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp | TransportKind::Tls | TransportKind::Ws => "tcp",
        }
    }

    /// Whether the underlying network layer guarantees delivery.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    /// Whether the transport is secured.
    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Tls)
    }

    /// The default port when the Via sent-by names none.
    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Tls => 5061,
            _ => 5060,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
