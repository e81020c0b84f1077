//! Tunnel client.
//!
//! Listens on a local TCP address and carries each accepted connection to a
//! fixed destination through the relay:
//! - [`TunnelClient`] - local accept loop, one WebSocket tunnel per connection

mod connection;

pub use connection::TunnelClient;
