//! The DNS front-end that steers clients toward the relay.
//!
//! Its only coupling to the relay is that the configured redirect
//! addresses should be addresses the relay is reachable on.

mod config;
mod ratelimit;
mod server;
pub mod wire;

pub use config::Config;
pub use ratelimit::RateLimiter;
pub use server::{Server, ServerError};
