//! Raw-TCP handshake parser
//!
//! The whole header is a bare address prefix: ATYP + address + port (BE).
//! Everything after it is payload.

use bytes::Bytes;

use crate::common::Result;

use super::{addr, Command, Handshake, Reply};

pub(super) fn parse(buf: &[u8]) -> Result<Option<Handshake>> {
    let Some((target, consumed)) = addr::decode(addr::RAW, buf)? else {
        return Ok(None);
    };

    Ok(Some(Handshake {
        target,
        command: Command::Tcp,
        leftover: Bytes::copy_from_slice(&buf[consumed..]),
        reply: Reply::StatusByte,
    }))
}
