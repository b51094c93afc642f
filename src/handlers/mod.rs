//! # HTTP Request Handlers
//!
//! The stateless companion endpoints next to the WebSocket pipeline:
//! single-turn chat, ephemeral token issuance, capability advertisement,
//! and the development debug scope.

pub mod chat;    // Single-turn reply + token issuance
pub mod config;  // Capability/config advertisement
pub mod debug;   // Development-only pipeline probes

pub use self::chat::*;
pub use self::config::*;
pub use self::debug::*;
