//! The SNI relay.
//!
//! Accepts TCP connections that DNS steering pointed at this host, peeks
//! the intended server name from the first bytes (TLS ClientHello SNI or
//! plain HTTP `Host`), checks it against the configured wildcard
//! patterns, dials the real destination and tunnels bytes in both
//! directions. TLS is never terminated; the relay only moves opaque
//! bytes.

mod config;
mod dial;
mod peek;
mod server;
mod tunnel;

pub use config::{Config, ProxyCredentials, ProxyUrlError, UpstreamProxy};
pub use dial::{DialError, Dialer};
pub use peek::{PeekError, PeekedStream, peek_server_name};
pub use server::{Server, ServerError};
pub use tunnel::TunnelStats;
