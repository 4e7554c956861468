//! Outbound dialing.
//!
//! Opens the connection to the real destination, either directly or
//! through the configured SOCKS5 upstream. Direct dials on a multi-homed
//! host bind the outbound socket to the same public IP the client
//! targeted, so replies egress through the interface the traffic was
//! steered to.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use fast_socks5::client::{Config as SocksConfig, Socks5Stream};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::debug;

use super::config::UpstreamProxy;

/// Timeout for outbound connection establishment.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("outbound dial timed out")]
    Timeout,
    #[error("no addresses resolved for {0}")]
    NoAddresses(String),
    #[error("SOCKS5 proxy error: {0}")]
    Proxy(#[from] fast_socks5::SocksError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Dials remote servers on behalf of relayed connections.
pub struct Dialer {
    proxy: Option<UpstreamProxy>,
}

impl Dialer {
    pub fn new(proxy: Option<UpstreamProxy>) -> Self {
        Self { proxy }
    }

    /// Opens a TCP connection to `host:port`. `local_addr` is the local
    /// address the client connection was accepted on; when it is a
    /// public IP the outbound socket is bound to it.
    pub async fn dial(
        &self,
        host: &str,
        port: u16,
        local_addr: SocketAddr,
    ) -> Result<TcpStream, DialError> {
        match &self.proxy {
            Some(proxy) => self.dial_via_proxy(proxy, host, port).await,
            None => self.dial_direct(host, port, local_addr.ip()).await,
        }
    }

    /// Dials through the SOCKS5 upstream. Name resolution is delegated to
    /// the proxy, and no source binding is applied.
    async fn dial_via_proxy(
        &self,
        proxy: &UpstreamProxy,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, DialError> {
        let proxy_addr = format!("{}:{}", proxy.host, proxy.port);
        debug!("dialing {}:{} via {}", host, port, proxy_addr);

        let stream = timeout(DIAL_TIMEOUT, async {
            match &proxy.credentials {
                Some(creds) => {
                    Socks5Stream::connect_with_password(
                        proxy_addr.as_str(),
                        host.to_string(),
                        port,
                        creds.username.clone(),
                        creds.password.clone(),
                        SocksConfig::default(),
                    )
                    .await
                }
                None => {
                    Socks5Stream::connect(
                        proxy_addr.as_str(),
                        host.to_string(),
                        port,
                        SocksConfig::default(),
                    )
                    .await
                }
            }
        })
        .await
        .map_err(|_| DialError::Timeout)??;

        // The SOCKS handshake is done; the inner socket is now a plain
        // byte pipe to the target.
        Ok(stream.get_socket())
    }

    /// Dials directly, binding the source address when the client reached
    /// us on a public IP.
    async fn dial_direct(
        &self,
        host: &str,
        port: u16,
        local_ip: IpAddr,
    ) -> Result<TcpStream, DialError> {
        if !is_public(local_ip) {
            let stream = timeout(DIAL_TIMEOUT, TcpStream::connect((host, port)))
                .await
                .map_err(|_| DialError::Timeout)??;
            return Ok(stream);
        }

        debug!("dialing {}:{} from {}", host, port, local_ip);

        let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
        let Some(&first) = addrs.first() else {
            return Err(DialError::NoAddresses(format!("{host}:{port}")));
        };

        // Prefer a destination of the same address family as the bind
        // address; fall back to whatever resolution gave us.
        let addr = addrs
            .iter()
            .copied()
            .find(|a| a.is_ipv4() == local_ip.is_ipv4())
            .unwrap_or(first);

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if addr.is_ipv4() == local_ip.is_ipv4() {
            socket.bind(SocketAddr::new(local_ip, 0))?;
        }

        let stream = timeout(DIAL_TIMEOUT, socket.connect(addr))
            .await
            .map_err(|_| DialError::Timeout)??;

        Ok(stream)
    }
}

/// True for addresses worth pinning the outbound source to: everything
/// except loopback, unspecified, RFC 1918 ranges and IPv6 unique-local.
/// On private or loopback addresses the kernel's default route selection
/// is already correct and binding could fail outright.
fn is_public(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return false;
    }

    match ip {
        IpAddr::V4(v4) => !v4.is_private(),
        IpAddr::V6(v6) => {
            // Unique-local fc00::/7.
            (v6.segments()[0] & 0xfe00) != 0xfc00
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests the source-binding eligibility rules: loopback, unspecified
    /// and private ranges never pin the source interface.
    #[test]
    fn public_address_classification() {
        assert!(!is_public("127.0.0.1".parse().unwrap()));
        assert!(!is_public("0.0.0.0".parse().unwrap()));
        assert!(!is_public("10.1.2.3".parse().unwrap()));
        assert!(!is_public("172.16.0.1".parse().unwrap()));
        assert!(!is_public("192.168.1.1".parse().unwrap()));
        assert!(!is_public("::1".parse().unwrap()));
        assert!(!is_public("::".parse().unwrap()));
        assert!(!is_public("fc00::1".parse().unwrap()));
        assert!(!is_public("fd12:3456::1".parse().unwrap()));

        assert!(is_public("203.0.113.10".parse().unwrap()));
        assert!(is_public("2001:db8::10".parse().unwrap()));
    }

    /// Tests a direct dial against a local listener. The accepting side
    /// is loopback, so no source binding is attempted.
    #[tokio::test]
    async fn direct_dial_to_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = Dialer::new(None);
        let local: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let (dialed, accepted) = tokio::join!(
            dialer.dial("127.0.0.1", addr.port(), local),
            listener.accept()
        );
        assert!(dialed.is_ok());
        assert!(accepted.is_ok());
    }

    /// Tests that a dial to a dead port surfaces the underlying error.
    #[tokio::test]
    async fn direct_dial_refused() {
        // Bind and immediately drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = Dialer::new(None);
        let local: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let result = dialer.dial("127.0.0.1", addr.port(), local).await;
        assert!(matches!(result, Err(DialError::Io(_))));
    }
}
