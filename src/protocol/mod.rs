//! Wire-level vocabulary of the relay handshake.
//!
//! - [`TargetAddress`] - the `host:port` a tunnel connects to
//! - [`Secret`] - the shared bearer token checked on every upgrade
//!
//! Also holds the header names both ends of the tunnel agree on.

mod secret;
mod target;

pub use secret::Secret;
pub use target::TargetAddress;

/// Header carrying the destination of the tunnel, formatted `host:port`.
pub const TARGET_HEADER: &str = "x-proxy-target";

/// The only `Upgrade` token the relay accepts.
pub const UPGRADE_PROTOCOL: &str = "websocket";
