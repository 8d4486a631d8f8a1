//! Destination resolution for responses, RFC 3261 §18.2.2 / RFC 3581 /
//! RFC 3263 §5.
//!
//! Candidates are produced lazily, one stage at a time, so DNS is only
//! touched when the earlier stages yield nothing the caller could use. The
//! caller walks [`ResponseTargets::next`] until a send succeeds.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};

use itertools::Itertools;
use util::SrvEntry;

use crate::error::{Error, Result};
use crate::message::{Host, TransportKind, Via};

/// One candidate destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub kind: TransportKind,
    pub addr: SocketAddr,
}

/// The DNS operations resolution needs. Implemented by
/// [`util::DnsResolver`] and by in-memory stubs in tests.
#[async_trait::async_trait]
pub trait DnsLookup: Send + Sync {
    /// A/AAAA lookup of a host name.
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>>;

    /// SRV lookup of a service name such as `_sip._udp.example.com`.
    async fn lookup_srv(&self, service: &str) -> Result<Vec<SrvEntry>>;
}

#[async_trait::async_trait]
impl DnsLookup for util::DnsResolver {
    async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.resolve_all(host).await.map_err(Error::Io)
    }

    async fn lookup_srv(&self, service: &str) -> Result<Vec<SrvEntry>> {
        self.resolve_srv(service).await.map_err(Error::Io)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Maddr,
    ReceivedRport,
    Received,
    Literal,
    HostLookup,
    Srv,
    Done,
}

/// The lazy candidate sequence for answering along the topmost Via.
pub struct ResponseTargets<'a> {
    via: &'a Via,
    dns: &'a dyn DnsLookup,
    stage: Stage,
    pending: VecDeque<Target>,
}

impl<'a> ResponseTargets<'a> {
    pub fn new(via: &'a Via, dns: &'a dyn DnsLookup) -> Self {
        ResponseTargets {
            via,
            dns,
            stage: Stage::Maddr,
            pending: VecDeque::new(),
        }
    }

    /// The next candidate, or `None` once every stage ran dry.
    pub async fn next(&mut self) -> Option<Target> {
        loop {
            if let Some(target) = self.pending.pop_front() {
                return Some(target);
            }
            match self.stage {
                Stage::Maddr => {
                    self.stage = Stage::ReceivedRport;
                    if let Some(maddr) = &self.via.maddr {
                        let port = self.via_port();
                        match maddr {
                            Host::Ip(ip) => self.push(*ip, port),
                            Host::Domain(name) => self.lookup_into(name, port).await,
                        }
                    }
                }
                Stage::ReceivedRport => {
                    self.stage = Stage::Received;
                    if let (Some(received), Some(rport)) = (self.via.received, self.via.rport) {
                        self.push(received, rport);
                    }
                }
                Stage::Received => {
                    self.stage = Stage::Literal;
                    if let Some(received) = self.via.received {
                        self.push(received, self.via_port());
                    }
                }
                Stage::Literal => {
                    self.stage = Stage::HostLookup;
                    if let Some(ip) = self.via.sent_by.host.ip() {
                        self.push(ip, self.via_port());
                    }
                }
                Stage::HostLookup => {
                    self.stage = Stage::Srv;
                    if let (Host::Domain(name), Some(port)) =
                        (&self.via.sent_by.host, self.via.sent_by.port)
                    {
                        self.lookup_into(&name.to_string(), port).await;
                    }
                }
                Stage::Srv => {
                    self.stage = Stage::Done;
                    if let (Host::Domain(name), None) =
                        (&self.via.sent_by.host, self.via.sent_by.port)
                    {
                        let name = name.to_string();
                        self.srv_into(&name).await;
                        if self.pending.is_empty() {
                            // RFC 3263 fallback when no SRV records exist.
                            self.lookup_into(&name, self.via.transport.default_port())
                                .await;
                        }
                    }
                }
                Stage::Done => return None,
            }
        }
    }

    fn via_port(&self) -> u16 {
        self.via
            .sent_by
            .port
            .unwrap_or_else(|| self.via.transport.default_port())
    }

    fn push(&mut self, ip: IpAddr, port: u16) {
        self.pending.push_back(Target {
            kind: self.via.transport,
            addr: SocketAddr::new(ip, port),
        });
    }

    async fn lookup_into(&mut self, host: &str, port: u16) {
        match self.dns.lookup_host(host).await {
            Ok(addrs) => {
                for ip in addrs {
                    self.push(ip, port);
                }
            }
            Err(err) => log::debug!("A lookup of {} failed: {}", host, err),
        }
    }

    async fn srv_into(&mut self, host: &str) {
        let scheme = if self.via.transport.is_secure() {
            "sips"
        } else {
            "sip"
        };
        let service = format!("_{}._{}.{}", scheme, self.via.transport.network(), host);

        let records = match self.dns.lookup_srv(&service).await {
            Ok(records) => records,
            Err(err) => {
                log::debug!("SRV lookup of {} failed: {}", service, err);
                return;
            }
        };

        let ordered = records.into_iter().sorted_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.weight.cmp(&a.weight))
                .then(a.target.cmp(&b.target))
        });

        for record in ordered {
            match self.dns.lookup_host(record.target.trim_end_matches('.')).await {
                Ok(addrs) => {
                    for ip in addrs {
                        self.push(ip, record.port);
                    }
                }
                Err(err) => log::debug!("A lookup of {} failed: {}", record.target, err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HostPort, TransportKind};
    use std::collections::HashMap;

    struct StubDns {
        hosts: HashMap<String, Vec<IpAddr>>,
        srv: HashMap<String, Vec<SrvEntry>>,
    }

    impl StubDns {
        fn new() -> Self {
            StubDns {
                hosts: HashMap::new(),
                srv: HashMap::new(),
            }
        }

        fn host(mut self, name: &str, ip: &str) -> Self {
            self.hosts
                .entry(name.to_string())
                .or_default()
                .push(ip.parse().unwrap());
            self
        }

        fn srv_record(mut self, service: &str, priority: u16, weight: u16, port: u16, target: &str) -> Self {
            self.srv.entry(service.to_string()).or_default().push(SrvEntry {
                priority,
                weight,
                port,
                target: target.to_string(),
            });
            self
        }
    }

    #[async_trait::async_trait]
    impl DnsLookup for StubDns {
        async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>> {
            Ok(self.hosts.get(host).cloned().unwrap_or_default())
        }

        async fn lookup_srv(&self, service: &str) -> Result<Vec<SrvEntry>> {
            Ok(self.srv.get(service).cloned().unwrap_or_default())
        }
    }

    fn via(sent_by: HostPort) -> Via {
        Via::new(TransportKind::Udp, sent_by, "z9hG4bK74bf9")
    }

    async fn collect(via: &Via, dns: &StubDns) -> Vec<Target> {
        let mut targets = ResponseTargets::new(via, dns);
        let mut out = Vec::new();
        while let Some(t) = targets.next().await {
            out.push(t);
        }
        out
    }

    #[tokio::test]
    async fn test_received_rport_first() {
        let dns = StubDns::new();
        let mut via = via(HostPort::new(Host::from("client.atlanta.com"), Some(5060)));
        via.received = Some("192.0.2.4".parse().unwrap());
        via.rport = Some(40044);

        let targets = collect(&via, &dns).await;
        assert_eq!(targets[0].addr, "192.0.2.4:40044".parse().unwrap());
        // received with the Via port follows.
        assert_eq!(targets[1].addr, "192.0.2.4:5060".parse().unwrap());
    }

    #[tokio::test]
    async fn test_maddr_overrides_everything() {
        let dns = StubDns::new().host("mcast.example.com", "203.0.113.7");
        let mut via = via(HostPort::new(Host::from("192.0.2.1"), Some(5062)));
        via.maddr = Some(Host::from("mcast.example.com"));

        let targets = collect(&via, &dns).await;
        assert_eq!(targets[0].addr, "203.0.113.7:5062".parse().unwrap());
        // The literal sent-by IP is still offered afterwards.
        assert!(targets.contains(&Target {
            kind: TransportKind::Udp,
            addr: "192.0.2.1:5062".parse().unwrap(),
        }));
    }

    #[tokio::test]
    async fn test_host_lookup_with_port() {
        let dns = StubDns::new().host("proxy.biloxi.com", "198.51.100.9");
        let via = via(HostPort::new(Host::from("proxy.biloxi.com"), Some(5080)));

        let targets = collect(&via, &dns).await;
        assert_eq!(targets, vec![Target {
            kind: TransportKind::Udp,
            addr: "198.51.100.9:5080".parse().unwrap(),
        }]);
    }

    #[tokio::test]
    async fn test_srv_ordering() {
        let dns = StubDns::new()
            .host("a.biloxi.com", "198.51.100.1")
            .host("b.biloxi.com", "198.51.100.2")
            .host("c.biloxi.com", "198.51.100.3")
            .srv_record("_sip._udp.biloxi.com", 20, 10, 5062, "c.biloxi.com")
            .srv_record("_sip._udp.biloxi.com", 10, 5, 5060, "b.biloxi.com")
            .srv_record("_sip._udp.biloxi.com", 10, 20, 5061, "a.biloxi.com");
        let via = via(HostPort::new(Host::from("biloxi.com"), None));

        let targets = collect(&via, &dns).await;
        // priority 10 first, higher weight first within it.
        assert_eq!(targets[0].addr, "198.51.100.1:5061".parse().unwrap());
        assert_eq!(targets[1].addr, "198.51.100.2:5060".parse().unwrap());
        assert_eq!(targets[2].addr, "198.51.100.3:5062".parse().unwrap());
    }

    #[tokio::test]
    async fn test_srv_fallback_to_a() {
        let dns = StubDns::new().host("biloxi.com", "198.51.100.7");
        let via = via(HostPort::new(Host::from("biloxi.com"), None));

        let targets = collect(&via, &dns).await;
        assert_eq!(targets, vec![Target {
            kind: TransportKind::Udp,
            addr: "198.51.100.7:5060".parse().unwrap(),
        }]);
    }
}
