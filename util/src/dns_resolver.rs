//! DNS resolve with the `DnsResolver` type.

use std::io;
use std::net::IpAddr;

use hickory_resolver::error::ResolveError;
use hickory_resolver::lookup_ip::LookupIp;

/// A single SRV record returned by [`DnsResolver::resolve_srv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvEntry {
    /// Record priority, lower is preferred.
    pub priority: u16,
    /// Record weight, higher is preferred within a priority.
    pub weight: u16,
    /// Port the service listens on.
    pub port: u16,
    /// Target host name.
    pub target: String,
}

/// A DNS resolver backed by [hickory-dns](https://github.com/hickory-dns/hickory-dns).
pub struct DnsResolver {
    dns_resolver: hickory_resolver::TokioAsyncResolver,
}

impl DnsResolver {
    async fn lookup(&self, host: &str) -> std::result::Result<LookupIp, ResolveError> {
        self.dns_resolver.lookup_ip(host).await
    }

    /// Resolve a single address.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, io::Error> {
        self.resolve_all(host)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::other(format!("No address found for {}", host)))
    }

    /// Resolve all addresses.
    pub async fn resolve_all(&self, host: &str) -> Result<Vec<IpAddr>, io::Error> {
        let result = self
            .lookup(host)
            .await
            .map_err(|err| io::Error::other(format!("Failed to lookup DNS: {}", err)))?;

        let addresses = result.iter().collect();

        Ok(addresses)
    }

    /// Resolve the SRV records of a service name such as `_sip._udp.example.com`.
    pub async fn resolve_srv(&self, name: &str) -> Result<Vec<SrvEntry>, io::Error> {
        let result = self
            .dns_resolver
            .srv_lookup(name)
            .await
            .map_err(|err| io::Error::other(format!("Failed to lookup SRV: {}", err)))?;

        let entries = result
            .iter()
            .map(|srv| SrvEntry {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: srv.target().to_utf8(),
            })
            .collect();

        Ok(entries)
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self {
            dns_resolver: hickory_resolver::AsyncResolver::tokio_from_system_conf()
                .expect("Failed to get DNS resolver"),
        }
    }
}
