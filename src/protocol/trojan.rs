//! Trojan handshake parser
//!
//! Header layout: 56 hex chars (SHA-224 of the shared secret), CRLF,
//! command, ATYP + address + port (BE), CRLF. Only CONNECT (0x01) carries
//! an address.

use bytes::Bytes;

use crate::common::{Error, Result};

use super::{addr, Auth, Command, Handshake, Reply};

const HASH_LEN: usize = 56;
const CRLF: &[u8] = b"\r\n";

const CMD_CONNECT: u8 = 0x01;

pub(super) fn parse(auth: &Auth, buf: &[u8]) -> Result<Option<Handshake>> {
    if buf.len() < HASH_LEN + 2 {
        return Ok(None);
    }

    let hash = &buf[..HASH_LEN];
    if !hash.iter().all(u8::is_ascii_hexdigit) {
        return Err(Error::BadHandshake("password is not 56 hex chars".into()));
    }
    if &buf[HASH_LEN..HASH_LEN + 2] != CRLF {
        return Err(Error::BadHandshake("missing CRLF after password".into()));
    }

    // Allow-list is optional; without one any well-formed hash passes.
    if let Some(allowed) = &auth.allowed_trojan_hashes {
        let hash = std::str::from_utf8(hash)
            .map_err(|_| Error::BadHandshake("password is not ASCII".into()))?
            .to_ascii_lowercase();
        if !allowed.contains(&hash) {
            return Err(Error::Unauthorized);
        }
    }

    let Some(&command) = buf.get(HASH_LEN + 2) else {
        return Ok(None);
    };
    if command != CMD_CONNECT {
        return Err(Error::UnsupportedCommand(command));
    }

    let rest = &buf[HASH_LEN + 3..];
    let Some((target, n)) = addr::decode(addr::TROJAN, rest)? else {
        return Ok(None);
    };
    let Some(tail) = rest.get(n..n + 2) else {
        return Ok(None);
    };
    if tail != CRLF {
        return Err(Error::BadHandshake("missing CRLF after address".into()));
    }

    let consumed = HASH_LEN + 3 + n + 2;
    Ok(Some(Handshake {
        target,
        command: Command::Tcp,
        leftover: Bytes::copy_from_slice(&buf[consumed..]),
        reply: Reply::StatusByte,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::assert_fragmentation_stable;
    use crate::protocol::ProtocolKind;
    use sha2::{Digest, Sha224};

    fn password_hash(secret: &str) -> String {
        hex::encode(Sha224::digest(secret.as_bytes()))
    }

    fn header(hash: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(hash.as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.push(0x01);
        buf.extend_from_slice(&[0x03, 0x07]); // Trojan domain ATYP
        buf.extend_from_slice(b"a.b.com");
        buf.extend_from_slice(&443u16.to_be_bytes());
        buf.extend_from_slice(b"\r\n");
        buf
    }

    #[test]
    fn happy_path_without_allow_list() {
        let mut buf = header(&password_hash("secret"));
        buf.extend_from_slice(b"PING");

        let hs = parse(&Auth::default(), &buf).unwrap().unwrap();
        assert_eq!(hs.target.to_string(), "a.b.com:443");
        assert_eq!(hs.reply, Reply::StatusByte);
        assert_eq!(&hs.leftover[..], b"PING");
    }

    #[test]
    fn hash_syntax_boundaries() {
        // 56 non-hex chars: rejected.
        let buf = header(&"z".repeat(56));
        assert!(matches!(
            parse(&Auth::default(), &buf),
            Err(Error::BadHandshake(_))
        ));

        // Length 55: the CRLF lands where the 56th hex char should be.
        let mut short = Vec::new();
        short.extend_from_slice("a".repeat(55).as_bytes());
        short.extend_from_slice(b"\r\nrest-of-header-padding");
        assert!(parse(&Auth::default(), &short).is_err());

        // Length 57: the 57th hex char sits where CRLF must be.
        let mut long = Vec::new();
        long.extend_from_slice("a".repeat(57).as_bytes());
        long.extend_from_slice(b"\r\npadding");
        assert!(parse(&Auth::default(), &long).is_err());

        // Non-hex at an interior position.
        let mut mixed = password_hash("secret");
        mixed.replace_range(20..21, "g");
        assert!(parse(&Auth::default(), &header(&mixed)).is_err());

        // Mixed case is fine.
        let upper = password_hash("secret").to_ascii_uppercase();
        assert!(parse(&Auth::default(), &header(&upper)).unwrap().is_some());
    }

    #[test]
    fn allow_list_enforced_case_insensitively() {
        let auth = Auth {
            allowed_trojan_hashes: Some([password_hash("secret")].into()),
            ..Default::default()
        };
        let ok = header(&password_hash("secret").to_ascii_uppercase());
        assert!(parse(&auth, &ok).unwrap().is_some());

        let bad = header(&password_hash("other"));
        assert!(matches!(parse(&auth, &bad), Err(Error::Unauthorized)));
    }

    #[test]
    fn non_connect_command_unsupported() {
        let mut buf = header(&password_hash("secret"));
        buf[58] = 0x03; // UDP associate
        assert!(matches!(
            parse(&Auth::default(), &buf),
            Err(Error::UnsupportedCommand(0x03))
        ));
    }

    #[test]
    fn missing_trailing_crlf_fails() {
        let mut buf = header(&password_hash("secret"));
        let n = buf.len();
        buf[n - 2] = b'X';
        assert!(parse(&Auth::default(), &buf).is_err());
    }

    #[test]
    fn fragmentation_stable() {
        let mut buf = header(&password_hash("secret"));
        buf.extend_from_slice(b"payload");
        assert_fragmentation_stable(ProtocolKind::TrojanWs, &Auth::default(), &buf);

        let reject = header(&"z".repeat(56));
        assert_fragmentation_stable(ProtocolKind::TrojanWs, &Auth::default(), &reject);
    }
}
