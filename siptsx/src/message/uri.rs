use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use util::ArcStr;

/// A host: either a domain name or a literal IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Host {
    /// A DNS name that still needs resolution.
    Domain(ArcStr),
    /// A literal address.
    Ip(IpAddr),
}

impl Host {
    /// The literal IP address, if this host is one.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Host::Ip(ip) => Some(*ip),
            Host::Domain(_) => None,
        }
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        Host::Ip(ip)
    }
}

impl From<&str> for Host {
    fn from(s: &str) -> Self {
        match s.parse::<IpAddr>() {
            Ok(ip) => Host::Ip(ip),
            Err(_) => Host::Domain(ArcStr::from(s)),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Domain(name) => f.write_str(name),
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{}", ip),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
        }
    }
}

/// A host with an optional port, as it appears in Via sent-by and URIs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: Host,
    pub port: Option<u16>,
}

impl HostPort {
    pub fn new(host: Host, port: Option<u16>) -> Self {
        HostPort { host, port }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// URI scheme, `sip` or `sips`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Sip,
    Sips,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Sip => f.write_str("sip"),
            Scheme::Sips => f.write_str("sips"),
        }
    }
}

/// A SIP URI, reduced to the parts the transaction layer consumes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<ArcStr>,
    pub host_port: HostPort,
}

impl Uri {
    /// A `sip:` URI with an optional user part.
    pub fn sip(user: Option<&str>, host: Host, port: Option<u16>) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: user.map(ArcStr::from),
            host_port: HostPort::new(host, port),
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let uri = Uri::sip(Some("alice"), Host::from("atlanta.com"), Some(5060));
        assert_eq!(uri.to_string(), "sip:alice@atlanta.com:5060");

        let uri = Uri::sip(None, Host::from("192.0.2.4"), None);
        assert_eq!(uri.to_string(), "sip:192.0.2.4");
    }
}
