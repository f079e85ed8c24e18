//! Configuration
//!
//! Flat JSON, one listener per process; every knob has a default. The
//! parsed [`Config`] is validated into the runtime [`Settings`] once at
//! startup, after which everything is read-only.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{Auth, ProtocolKind};

pub const DEFAULT_LISTEN_PORT: u16 = 8100;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_UPSTREAM_IDLE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_UDP_IDLE_MS: u64 = 300_000;
pub const DEFAULT_MAX_HANDSHAKE_BUFFER: usize = 8192;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    /// Bind port, shared by the TCP listener and the UDP forwarder
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Which tunnel protocol this listener terminates
    pub protocol: ProtocolKind,

    /// VLESS allow-list
    #[serde(default)]
    pub allowed_uuids: Vec<Uuid>,

    /// Trojan allow-list as SHA-224 hex digests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_trojan_hashes: Option<Vec<String>>,

    /// Trojan allow-list as plaintext secrets, hashed at load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_trojan_passwords: Option<Vec<String>>,

    /// Write the 0x00/0x01 dial-outcome byte back to the client
    /// (VLESS / Trojan / raw-TCP listeners only)
    #[serde(default = "default_true")]
    pub status_byte: bool,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_upstream_idle_timeout_ms")]
    pub upstream_idle_timeout_ms: u64,

    /// UDP forwarder upstream; both host and port must be given to
    /// enable it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_target_host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_target_port: Option<u16>,

    #[serde(default = "default_udp_idle_ms")]
    pub udp_idle_ms: u64,

    #[serde(default = "default_max_handshake_buffer")]
    pub max_handshake_buffer_bytes: usize,
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_upstream_idle_timeout_ms() -> u64 {
    DEFAULT_UPSTREAM_IDLE_TIMEOUT_MS
}

fn default_udp_idle_ms() -> u64 {
    DEFAULT_UDP_IDLE_MS
}

fn default_max_handshake_buffer() -> usize {
    DEFAULT_MAX_HANDSHAKE_BUFFER
}

/// Validated runtime settings, shared read-only by every session
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_port: u16,
    pub kind: ProtocolKind,
    pub auth: Auth,
    pub status_byte: bool,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_handshake_buffer: usize,
    pub udp: Option<UdpSettings>,
}

/// UDP forwarder settings
#[derive(Debug, Clone)]
pub struct UdpSettings {
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub idle: Duration,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// A starting-point config printed by `--gen-config`
    pub fn sample() -> Self {
        Config {
            log: LogConfig::default(),
            listen_port: DEFAULT_LISTEN_PORT,
            protocol: ProtocolKind::VlessWs,
            allowed_uuids: vec![Uuid::nil()],
            allowed_trojan_hashes: None,
            allowed_trojan_passwords: None,
            status_byte: true,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            upstream_idle_timeout_ms: DEFAULT_UPSTREAM_IDLE_TIMEOUT_MS,
            udp_target_host: None,
            udp_target_port: None,
            udp_idle_ms: DEFAULT_UDP_IDLE_MS,
            max_handshake_buffer_bytes: DEFAULT_MAX_HANDSHAKE_BUFFER,
        }
    }

    /// Validate into runtime settings.
    pub fn settings(&self) -> Result<Settings> {
        if self.protocol == ProtocolKind::VlessWs && self.allowed_uuids.is_empty() {
            return Err(Error::Config(
                "a vless-ws listener needs at least one entry in allowed_uuids".into(),
            ));
        }

        let auth = Auth {
            allowed_uuids: self.allowed_uuids.iter().copied().collect(),
            allowed_trojan_hashes: self.trojan_allow_list()?,
        };

        let udp = match (&self.udp_target_host, self.udp_target_port) {
            (Some(host), Some(port)) => Some(UdpSettings {
                listen_port: self.listen_port,
                target_host: host.clone(),
                target_port: port,
                idle: Duration::from_millis(self.udp_idle_ms),
            }),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "udp_target_host and udp_target_port must be set together".into(),
                ))
            }
        };

        Ok(Settings {
            listen_port: self.listen_port,
            kind: self.protocol,
            auth,
            status_byte: self.status_byte,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            idle_timeout: Duration::from_millis(self.upstream_idle_timeout_ms),
            max_handshake_buffer: self.max_handshake_buffer_bytes,
            udp,
        })
    }

    /// Merge configured hashes and hashed plaintext passwords. `None`
    /// keeps the legacy accept-any-valid-hash behavior.
    fn trojan_allow_list(&self) -> Result<Option<HashSet<String>>> {
        if self.allowed_trojan_hashes.is_none() && self.allowed_trojan_passwords.is_none() {
            return Ok(None);
        }

        let mut allowed = HashSet::new();
        for hash in self.allowed_trojan_hashes.iter().flatten() {
            if hash.len() != 56 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(Error::Config(format!(
                    "allowed_trojan_hashes entry is not 56 hex chars: {}",
                    hash
                )));
            }
            allowed.insert(hash.to_ascii_lowercase());
        }
        for password in self.allowed_trojan_passwords.iter().flatten() {
            allowed.insert(hex::encode(Sha224::digest(password.as_bytes())));
        }
        Ok(Some(allowed))
    }
}
