//! Z21 gateway: bridges a Z21 LAN command station to JSON WebSocket clients
//!
//! The central speaks a binary UDP protocol; clients speak JSON envelopes.
//! The gateway translates between the two, keeps a replay cache so new
//! clients start from the current layout state, sequences two-phase turnout
//! pulses, correlates CV programming results with their requests and stops
//! the layout when supervising clients disappear.
pub mod core;
pub mod gateway;
pub mod network;
pub mod protocol;
pub mod util;

// Re-export commonly used items
pub use crate::core::{Config, Error, Result};
pub use crate::gateway::{Gateway, GatewayEvent};
pub use crate::network::GatewayServer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
