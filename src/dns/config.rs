//! DNS front-end configuration.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Configuration of the DNS steering server. Immutable after
/// construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the DNS server listens on (UDP and TCP).
    pub listen_addr: IpAddr,

    /// Listen port. 0 picks an ephemeral port.
    pub port: u16,

    /// Upstream resolver for queries that are not steered.
    pub upstream_addr: SocketAddr,

    /// Address returned for A queries on steered domains. Unset means
    /// such queries get an empty NOERROR answer.
    pub redirect_addr_v4: Option<Ipv4Addr>,

    /// Address returned for AAAA queries on steered domains. Unset means
    /// such queries get an empty NOERROR answer.
    pub redirect_addr_v6: Option<Ipv6Addr>,

    /// Wildcard patterns of domains whose address queries are steered at
    /// the relay.
    pub redirect_domains: Vec<String>,

    /// Maximum plain-DNS queries per second per client subnet. 0 turns
    /// rate limiting off.
    pub rate_limit: u32,

    /// Client addresses excluded from rate limiting.
    pub rate_limit_allowlist: Vec<IpAddr>,
}
