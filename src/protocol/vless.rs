//! VLESS handshake parser
//!
//! Header layout: version (must be 0x00), 16-byte UUID, addons
//! length + addons (skipped), command, port (BE), then ATYP + address.
//! Only the TCP command is relayed.

use bytes::Bytes;
use uuid::Uuid;

use crate::common::{Error, Result};

use super::{addr, Auth, Command, Handshake, Reply};

const VERSION: u8 = 0x00;

const CMD_TCP: u8 = 0x01;

pub(super) fn parse(auth: &Auth, buf: &[u8]) -> Result<Option<Handshake>> {
    let Some(&version) = buf.first() else {
        return Ok(None);
    };
    if version != VERSION {
        return Err(Error::BadHandshake(format!(
            "unsupported VLESS version 0x{:02x}",
            version
        )));
    }

    if buf.len() < 17 {
        return Ok(None);
    }
    let uuid = Uuid::from_slice(&buf[1..17])
        .map_err(|_| Error::BadHandshake("malformed UUID".into()))?;
    // Reject before the command or address is even looked at; an
    // unauthorized client must never cause a dial.
    if !auth.allowed_uuids.contains(&uuid) {
        return Err(Error::Unauthorized);
    }

    let Some(&addons_len) = buf.get(17) else {
        return Ok(None);
    };
    let off = 18 + addons_len as usize;

    let Some(&command) = buf.get(off) else {
        return Ok(None);
    };
    if command != CMD_TCP {
        return Err(Error::UnsupportedCommand(command));
    }

    let Some(port_bytes) = buf.get(off + 1..off + 3) else {
        return Ok(None);
    };
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    let Some((host, n)) = addr::decode_host(addr::VLESS, &buf[off + 3..])? else {
        return Ok(None);
    };
    let consumed = off + 3 + n;

    Ok(Some(Handshake {
        target: host.into_target(port)?,
        command: Command::Tcp,
        leftover: Bytes::copy_from_slice(&buf[consumed..]),
        reply: Reply::StatusByte,
    }))
}
