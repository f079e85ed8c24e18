//! Address codec shared by the VLESS, Trojan and raw-TCP handshakes
//!
//! Wire form: `ATYP (1) | addr (4 / 16 / 1+len) | port (2, BE)`, except that
//! VLESS puts the port before the ATYP, so host and port decoding are
//! exposed separately. The ATYP code values differ per protocol.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::common::{Error, Result, Target};

/// ATYP values for one protocol family
#[derive(Debug, Clone, Copy)]
pub struct AtypCodes {
    pub ipv4: u8,
    pub domain: u8,
    pub ipv6: u8,
}

pub const VLESS: AtypCodes = AtypCodes {
    ipv4: 0x01,
    domain: 0x02,
    ipv6: 0x03,
};

pub const TROJAN: AtypCodes = AtypCodes {
    ipv4: 0x01,
    domain: 0x03,
    ipv6: 0x04,
};

pub const RAW: AtypCodes = AtypCodes {
    ipv4: 0x01,
    domain: 0x02,
    ipv6: 0x03,
};

/// Host portion of a decoded address, port still pending
#[derive(Debug, PartialEq, Eq)]
pub enum Host {
    Ip(IpAddr),
    Name(String),
}

impl Host {
    pub fn into_target(self, port: u16) -> Result<Target> {
        match self {
            Host::Ip(ip) => Ok(Target::ip(ip, port)),
            Host::Name(name) => Target::domain(name, port),
        }
    }
}

/// Decode `ATYP + addr` at the start of `buf`.
///
/// Returns `Ok(None)` when the buffer is too short (wait for more bytes,
/// this is not a failure), `Ok(Some((host, consumed)))` on success.
pub fn decode_host(codes: AtypCodes, buf: &[u8]) -> Result<Option<(Host, usize)>> {
    let Some(&atyp) = buf.first() else {
        return Ok(None);
    };

    if atyp == codes.ipv4 {
        if buf.len() < 5 {
            return Ok(None);
        }
        let octets: [u8; 4] = buf[1..5].try_into().map_err(internal)?;
        Ok(Some((Host::Ip(Ipv4Addr::from(octets).into()), 5)))
    } else if atyp == codes.ipv6 {
        if buf.len() < 17 {
            return Ok(None);
        }
        // Eight big-endian 16-bit groups, network order.
        let octets: [u8; 16] = buf[1..17].try_into().map_err(internal)?;
        Ok(Some((Host::Ip(Ipv6Addr::from(octets).into()), 17)))
    } else if atyp == codes.domain {
        let Some(&len) = buf.get(1) else {
            return Ok(None);
        };
        let len = len as usize;
        if len == 0 {
            return Err(Error::BadHandshake("empty domain".into()));
        }
        if buf.len() < 2 + len {
            return Ok(None);
        }
        let name = std::str::from_utf8(&buf[2..2 + len])
            .map_err(|_| Error::BadHandshake("domain is not UTF-8".into()))?;
        Ok(Some((Host::Name(name.to_string()), 2 + len)))
    } else {
        Err(Error::BadHandshake(format!("invalid ATYP 0x{:02x}", atyp)))
    }
}

/// Decode `ATYP + addr + port` at the start of `buf`.
pub fn decode(codes: AtypCodes, buf: &[u8]) -> Result<Option<(Target, usize)>> {
    let Some((host, consumed)) = decode_host(codes, buf)? else {
        return Ok(None);
    };
    let Some(port_bytes) = buf.get(consumed..consumed + 2) else {
        return Ok(None);
    };
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    Ok(Some((host.into_target(port)?, consumed + 2)))
}

/// Encode a target as `ATYP + addr + port`, the inverse of [`decode`].
pub fn encode(codes: AtypCodes, target: &Target, out: &mut Vec<u8>) {
    match target {
        Target::Socket(addr) => match addr.ip() {
            IpAddr::V4(ip) => {
                out.push(codes.ipv4);
                out.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.push(codes.ipv6);
                out.extend_from_slice(&ip.octets());
            }
        },
        Target::Domain(name, _) => {
            out.push(codes.domain);
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
        }
    }
    out.extend_from_slice(&target.port().to_be_bytes());
}

fn internal<E: std::fmt::Debug>(e: E) -> Error {
    Error::Internal(format!("{:?}", e))
}
