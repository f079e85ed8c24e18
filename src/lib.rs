//! Portway - a tunnel-terminating relay
//!
//! # Architecture (Layered Pipeline)
//!
//! ```text
//! Transport (TCP accept, WebSocket upgrade)
//! → Protocol (VLESS / Trojan / raw-TCP / HTTP-proxy handshake)
//! → Relay (dial target, splice bytes both ways)
//! ```
//!
//! ## Core Principles
//!
//! - Parsers are pure functions over an accumulated buffer, no IO
//! - Every inbound transport erases to one `Stream` type, so the session
//!   state machine exists once
//! - Sessions own their sockets outright; nothing is shared between them
//!   except the read-only settings
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Target
//! ├── protocol/        # Handshake parsers + address codec
//! ├── transport/       # Framing adapter: plain TCP, WebSocket; dialer
//! ├── relay/           # Session, splice, supervisor, UDP forwarder
//! ├── config.rs        # JSON configuration → runtime settings
//! └── error.rs         # Error kinds
//! ```

pub mod common;
pub mod error;

pub mod protocol;
pub mod relay;
pub mod transport;

pub mod config;

// Re-exports for convenience
pub use common::{Stream, Target};
pub use config::{Config, Settings};
pub use error::{Error, Result};
pub use protocol::ProtocolKind;
