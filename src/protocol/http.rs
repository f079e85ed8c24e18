//! HTTP-proxy handshake parser
//!
//! Two modes, decided by the request line:
//! - CONNECT: the proxy answers `200 Connection established` once the
//!   upstream is dialed and relays raw bytes. The request (line and
//!   headers) is consumed, nothing of it reaches the upstream.
//! - Absolute `http://` URI: the upstream is derived from the URI and the
//!   buffered request is replayed to it verbatim, absolute URI included.
//!
//! `https://` absolute URIs are refused; those clients must use CONNECT.

use std::net::IpAddr;

use bytes::Bytes;

use crate::common::{Error, Result, Target};

use super::{Command, Handshake, Reply};

pub(super) fn parse(buf: &[u8]) -> Result<Option<Handshake>> {
    let Some(line_end) = find(buf, b"\r\n") else {
        return Ok(None);
    };
    let line = std::str::from_utf8(&buf[..line_end])
        .map_err(|_| Error::BadHandshake("request line is not UTF-8".into()))?;

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(_version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::BadHandshake("malformed request line".into()));
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        // Consume the whole header block; none of it is forwarded.
        let Some(headers_end) = find(buf, b"\r\n\r\n") else {
            return Ok(None);
        };
        let target = parse_authority(target, None)?;
        return Ok(Some(Handshake {
            target,
            command: Command::Tcp,
            leftover: Bytes::copy_from_slice(&buf[headers_end + 4..]),
            reply: Reply::HttpEstablished,
        }));
    }

    if target.starts_with("https://") {
        return Err(Error::BadHandshake(
            "https target requires CONNECT".into(),
        ));
    }
    let Some(rest) = target.strip_prefix("http://") else {
        return Err(Error::BadHandshake(format!(
            "not an absolute http URI: {}",
            target
        )));
    };

    let authority = rest.split('/').next().unwrap_or(rest);
    let target = parse_authority(authority, Some(80))?;

    // Replay everything buffered so far; remaining header and body bytes
    // follow through the splice untouched.
    Ok(Some(Handshake {
        target,
        command: Command::Tcp,
        leftover: Bytes::copy_from_slice(buf),
        reply: Reply::None,
    }))
}

/// Parse `host[:port]`, IPv6 brackets included. `default_port: None` makes
/// the port mandatory (CONNECT form).
fn parse_authority(s: &str, default_port: Option<u16>) -> Result<Target> {
    if s.is_empty() {
        return Err(Error::BadHandshake("empty authority".into()));
    }

    let (host, port) = match s.rsplit_once(':') {
        // The colon inside an unbracketed IPv6 literal is not a port
        // separator.
        Some((h, p)) if !p.contains(']') => {
            let port: u16 = p
                .parse()
                .map_err(|_| Error::BadHandshake(format!("invalid port: {}", p)))?;
            (h, port)
        }
        _ => match default_port {
            Some(port) => (s, port),
            None => {
                return Err(Error::BadHandshake(format!(
                    "CONNECT target must be host:port, got {}",
                    s
                )))
            }
        },
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(Target::ip(ip, port)),
        Err(_) => Target::domain(host, port),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
