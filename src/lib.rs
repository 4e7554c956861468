//! SNI-aware TCP relay with a DNS steering front-end.
//!
//! This crate rewires traffic for a configured set of domains through a
//! relay host without terminating TLS:
//!
//! 1. The DNS front-end answers A/AAAA queries for steered domains with
//!    the relay's own address, so clients open their TCP connections to
//!    the relay instead of the real server.
//! 2. The relay accepts the connection, peeks the intended server name
//!    from the first bytes on the wire (TLS ClientHello SNI, or the
//!    `Host` header for plain HTTP) while preserving them for replay.
//! 3. The name is checked against the configured wildcard patterns;
//!    unlisted names are closed without dialing.
//! 4. The relay opens a connection to the real destination on port 80 or
//!    443 — directly (binding the outbound source to the public IP the
//!    client targeted) or through a SOCKS5 upstream — and tunnels bytes
//!    in both directions until both halves drain.
//!
//! # Example
//!
//! ```no_run
//! use shunt::relay;
//!
//! # async fn run() -> Result<(), relay::ServerError> {
//! let server = relay::Server::new(relay::Config {
//!     listen_addr: "0.0.0.0".parse().unwrap(),
//!     plain_port: 80,
//!     tls_port: 443,
//!     upstream_proxy: None,
//!     redirect_domains: vec!["*.example.org".to_string()],
//! });
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dns;
pub mod domains;
pub mod metrics;
pub mod relay;

pub use config::{ConfigError, File};
pub use domains::DomainPatterns;
