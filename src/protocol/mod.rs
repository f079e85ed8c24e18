//! Tunnel handshake parsers
//!
//! Responsibilities:
//! - Parse the protocol-specific bytes preceding the payload
//! - Authenticate (UUID / password hash allow-lists)
//! - Produce the target address and the leftover payload
//!
//! Parsers are pure functions over an accumulated byte buffer: they own no
//! network resources and never perform IO. `Ok(None)` means the header is
//! still incomplete and the caller should wait for more inbound data.

pub mod addr;
mod http;
mod rawtcp;
mod trojan;
mod vless;

use std::collections::HashSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{Result, Target};

/// Which tunnel protocol a listener terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    VlessWs,
    TrojanWs,
    Rawtcp,
    HttpProxy,
}

impl ProtocolKind {
    /// WebSocket-framed inbound?
    pub fn message_framed(&self) -> bool {
        matches!(self, ProtocolKind::VlessWs | ProtocolKind::TrojanWs)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::VlessWs => "vless-ws",
            ProtocolKind::TrojanWs => "trojan-ws",
            ProtocolKind::Rawtcp => "rawtcp",
            ProtocolKind::HttpProxy => "http-proxy",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Command requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
    Mux,
    Unknown(u8),
}

/// What the session owes the client once the dial resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Single byte: 0x00 on success, 0x01 on failure
    StatusByte,
    /// `200 Connection established` on success, `502 Bad Gateway` on failure
    HttpEstablished,
    /// Nothing; the upstream's own response suffices
    None,
}

/// Result of a completed handshake
#[derive(Debug)]
pub struct Handshake {
    pub target: Target,
    pub command: Command,
    /// Bytes that followed the header; delivered upstream as the first write
    pub leftover: Bytes,
    pub reply: Reply,
}

/// Read-only credential sets, shared by every session of a listener
#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub allowed_uuids: HashSet<Uuid>,
    /// Lowercase SHA-224 hex digests. `None` accepts any syntactically
    /// valid password (legacy behavior).
    pub allowed_trojan_hashes: Option<HashSet<String>>,
}

/// Run the parser for `kind` over the accumulated handshake buffer.
///
/// `Ok(None)` asks the caller to wait for more bytes; the caller owns the
/// buffer-size cap and the handshake deadline.
pub fn parse_handshake(kind: ProtocolKind, auth: &Auth, buf: &[u8]) -> Result<Option<Handshake>> {
    match kind {
        ProtocolKind::VlessWs => vless::parse(auth, buf),
        ProtocolKind::TrojanWs => trojan::parse(auth, buf),
        ProtocolKind::Rawtcp => rawtcp::parse(buf),
        ProtocolKind::HttpProxy => http::parse(buf),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Feed `bytes` to the parser one byte at a time and assert the outcome
    /// is identical to parsing the whole buffer at once: `Ok(None)` on every
    /// proper prefix short of the decision point, then the same result.
    pub fn assert_fragmentation_stable(kind: ProtocolKind, auth: &Auth, bytes: &[u8]) {
        let whole = parse_handshake(kind, auth, bytes);
        let mut decided_at = None;
        for n in 0..=bytes.len() {
            let step = parse_handshake(kind, auth, &bytes[..n]);
            match (&step, decided_at) {
                (Ok(None), None) => {}
                (_, None) => decided_at = Some(n),
                // Once decided, longer prefixes must not flip an error
                // into success or vice versa.
                (Ok(Some(_)), Some(_)) => assert!(whole.is_ok(), "success flipped at {}", n),
                (Err(_), Some(_)) => assert!(whole.is_err(), "failure flipped at {}", n),
                (Ok(None), Some(m)) => panic!("regressed to NeedMore at {} after {}", n, m),
            }
        }
        match whole {
            Ok(Some(_)) => assert!(decided_at.is_some(), "never completed"),
            Ok(None) => assert!(decided_at.is_none()),
            Err(_) => assert!(decided_at.is_some(), "never failed"),
        }
    }
}
