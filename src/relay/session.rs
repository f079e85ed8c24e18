//! Per-connection session state machine
//!
//! AwaitHandshake → Dialing → Relaying → Closing → Closed. The session
//! owns both sockets; nothing it does is visible to other sessions, and
//! no error leaves it except through the log.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::common::{Error, Result, Stream};
use crate::config::Settings;
use crate::protocol::{parse_handshake, Handshake, ProtocolKind, Reply};
use crate::transport::{tcp, CloseMode, Framing};

use super::splice::{splice, Ended};

const STATUS_OK: u8 = 0x00;
const STATUS_FAIL: u8 = 0x01;

const RESPONSE_200: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Headroom reserved ahead of each handshake read
const READ_CHUNK: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitHandshake,
    Dialing,
    Relaying,
    Closing,
    Closed,
}

pub struct Session {
    id: u64,
    settings: Arc<Settings>,
    framing: Arc<dyn Framing>,
    /// Close-code verdict for message-framed inbounds: error until the
    /// handshake completes, normal closure afterwards.
    close: CloseMode,
    state: State,
}

impl Session {
    pub fn new(id: u64, settings: Arc<Settings>, framing: Arc<dyn Framing>) -> Self {
        Self {
            id,
            settings,
            framing,
            close: CloseMode::default(),
            state: State::AwaitHandshake,
        }
    }

    /// Drive the connection to completion. Consumes the session; every
    /// path ends in exactly one `finish`.
    pub async fn run(mut self, inbound: Stream, mut shutdown: broadcast::Receiver<()>) {
        let started = Instant::now();

        let outcome = tokio::select! {
            outcome = self.drive(inbound) => outcome,
            // Dropping the drive future closes both sockets and cancels
            // the session's timers with it.
            _ = shutdown.recv() => Err(Error::Shutdown),
        };

        self.finish(outcome, started);
    }

    async fn drive(&mut self, inbound: Stream) -> Result<Ended> {
        let deadline = self.settings.handshake_timeout;
        let (inbound, handshake, upstream) = timeout(deadline, self.establish(inbound))
            .await
            .map_err(|_| Error::HandshakeTimeout)??;

        self.close.mark_established();
        self.state = State::Relaying;
        debug!(session = self.id, target = %handshake.target, "relaying");

        let leftover_len = handshake.leftover.len() as u64;
        let mut ended = splice(inbound, upstream, self.settings.idle_timeout).await;
        ended.up += leftover_len;
        Ok(ended)
    }

    /// Everything under the handshake deadline: framing negotiation,
    /// header accumulation, the dial, the success/failure reply, and the
    /// leftover flush.
    async fn establish(&mut self, inbound: Stream) -> Result<(Stream, Handshake, TcpStream)> {
        let mut inbound = self.framing.accept(inbound, self.close.clone()).await?;

        let handshake = match self.read_handshake(&mut inbound).await {
            Ok(handshake) => handshake,
            Err(e) => {
                self.reject(&mut inbound, None).await;
                return Err(e);
            }
        };

        self.state = State::Dialing;
        debug!(session = self.id, target = %handshake.target, "dialing");

        let mut upstream = match tcp::dial(&handshake.target, self.settings.connect_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                self.reject(&mut inbound, Some(handshake.reply)).await;
                return Err(e);
            }
        };

        // The dial verdict goes out before any payload moves in either
        // direction.
        match handshake.reply {
            Reply::StatusByte if self.settings.status_byte => {
                inbound.write_all(&[STATUS_OK]).await?;
                inbound.flush().await?;
            }
            Reply::HttpEstablished => {
                inbound.write_all(RESPONSE_200).await?;
                inbound.flush().await?;
            }
            Reply::StatusByte | Reply::None => {}
        }

        if !handshake.leftover.is_empty() {
            upstream.write_all(&handshake.leftover).await?;
            upstream.flush().await?;
        }

        Ok((inbound, handshake, upstream))
    }

    /// Accumulate inbound chunks until the parser decides, within the
    /// configured buffer cap.
    async fn read_handshake(&mut self, inbound: &mut Stream) -> Result<Handshake> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        loop {
            if let Some(handshake) =
                parse_handshake(self.settings.kind, &self.settings.auth, &buf)?
            {
                return Ok(handshake);
            }
            if buf.len() > self.settings.max_handshake_buffer {
                return Err(Error::BadHandshake(format!(
                    "header exceeds {} bytes",
                    self.settings.max_handshake_buffer
                )));
            }

            buf.reserve(READ_CHUNK);
            let n = inbound.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(Error::ClientClosed);
            }
        }
    }

    /// Best-effort failure reply. `reply: None` means the handshake never
    /// parsed, so the mode is inferred from the listener protocol.
    async fn reject(&mut self, inbound: &mut Stream, reply: Option<Reply>) {
        let body: &[u8] = match (self.settings.kind, reply) {
            (ProtocolKind::HttpProxy, Some(Reply::HttpEstablished)) => RESPONSE_502,
            (ProtocolKind::HttpProxy, Some(Reply::None)) => RESPONSE_502,
            (ProtocolKind::HttpProxy, None) => RESPONSE_400,
            (_, _) if self.settings.status_byte => &[STATUS_FAIL],
            (_, _) => &[],
        };
        if !body.is_empty() {
            let _ = inbound.write_all(body).await;
            let _ = inbound.flush().await;
        }
        let _ = inbound.shutdown().await;
    }

    /// The one Closing→Closed transition. Sockets and timers were
    /// released with the drive future; this logs the terminal reason.
    fn finish(&mut self, outcome: Result<Ended>, started: Instant) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closing;

        match outcome {
            Ok(ended) => {
                let benign = ended.reason.is_benign();
                if benign {
                    info!(
                        session = self.id,
                        up = ended.up,
                        down = ended.down,
                        elapsed = ?started.elapsed(),
                        reason = %ended.reason,
                        "session closed",
                    );
                } else {
                    warn!(
                        session = self.id,
                        up = ended.up,
                        down = ended.down,
                        reason = %ended.reason,
                        "session closed",
                    );
                }
            }
            Err(e) if e.is_benign() => {
                debug!(session = self.id, reason = %e, "session closed");
            }
            Err(e) => {
                warn!(session = self.id, reason = %e, "session rejected");
            }
        }

        self.state = State::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Target;
    use crate::config::DEFAULT_MAX_HANDSHAKE_BUFFER;
    use crate::protocol::Auth;
    use crate::transport::PlainFraming;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    fn raw_handshake(target: &Target, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        crate::protocol::addr::encode(crate::protocol::addr::RAW, target, &mut buf);
        buf.extend_from_slice(payload);
        buf
    }

    const UUID: &str = "2e6c3a67-1f4e-4f2a-9c5d-8b1a2d3c4e5f";

    fn settings(kind: ProtocolKind) -> Arc<Settings> {
        Arc::new(Settings {
            listen_port: 0,
            kind,
            auth: Auth {
                allowed_uuids: [UUID.parse().unwrap()].into(),
                allowed_trojan_hashes: None,
            },
            status_byte: true,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
            max_handshake_buffer: DEFAULT_MAX_HANDSHAKE_BUFFER,
            udp: None,
        })
    }

    /// Spawn a session over an in-memory inbound; returns the test side
    /// plus the shutdown sender that keeps the session alive.
    fn start_session(kind: ProtocolKind) -> (tokio::io::DuplexStream, broadcast::Sender<()>) {
        let (client, inbound) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = broadcast::channel(1);
        let session = Session::new(1, settings(kind), Arc::new(PlainFraming));
        tokio::spawn(session.run(Box::new(inbound), rx));
        (client, tx)
    }

    async fn upstream_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn rawtcp_roundtrip_with_leftover_first() {
        let (listener, addr) = upstream_listener().await;
        let (mut client, _shutdown) = start_session(ProtocolKind::Rawtcp);

        client
            .write_all(&raw_handshake(&Target::Socket(addr), b"PING"))
            .await
            .unwrap();

        let (mut upstream, _) = listener.accept().await.unwrap();

        // Success byte precedes anything relayed back.
        let mut status = [0u8; 1];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status[0], STATUS_OK);

        // Leftover is the first upstream write.
        let mut got = [0u8; 4];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"PING");

        upstream.write_all(b"PONG").await.unwrap();
        let mut got = [0u8; 4];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"PONG");
    }

    #[tokio::test]
    async fn vless_happy_path_scenario() {
        let (listener, addr) = upstream_listener().await;
        let (mut client, _shutdown) = start_session(ProtocolKind::VlessWs);

        let mut handshake = vec![0x00];
        handshake.extend_from_slice(UUID.parse::<Uuid>().unwrap().as_bytes());
        handshake.push(0x00);
        handshake.push(0x01);
        handshake.extend_from_slice(&addr.port().to_be_bytes());
        handshake.push(0x01);
        match addr {
            SocketAddr::V4(v4) => handshake.extend_from_slice(&v4.ip().octets()),
            SocketAddr::V6(_) => unreachable!(),
        }
        handshake.extend_from_slice(b"GET / HTTP/1.0\r\n\r\n");
        client.write_all(&handshake).await.unwrap();

        let (mut upstream, _) = listener.accept().await.unwrap();

        let mut status = [0u8; 1];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status[0], STATUS_OK);

        let mut got = [0u8; 18];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"GET / HTTP/1.0\r\n\r\n");
    }

    #[tokio::test]
    async fn trojan_reject_sends_failure_byte_without_dialing() {
        let (listener, _addr) = upstream_listener().await;
        let (mut client, _shutdown) = start_session(ProtocolKind::TrojanWs);

        let mut bad = Vec::new();
        bad.extend_from_slice("z".repeat(56).as_bytes());
        bad.extend_from_slice(b"\r\n");
        client.write_all(&bad).await.unwrap();

        let mut status = [0u8; 1];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status[0], STATUS_FAIL);

        // Connection ends; nothing ever dialed the listener.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        let nothing = timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn vless_unauthorized_never_dials() {
        let (listener, addr) = upstream_listener().await;
        let (mut client, _shutdown) = start_session(ProtocolKind::VlessWs);

        let mut handshake = vec![0x00];
        handshake.extend_from_slice(Uuid::nil().as_bytes());
        handshake.push(0x00);
        handshake.push(0x01);
        handshake.extend_from_slice(&addr.port().to_be_bytes());
        handshake.extend_from_slice(&[0x01, 127, 0, 0, 1]);
        client.write_all(&handshake).await.unwrap();

        let mut status = [0u8; 1];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status[0], STATUS_FAIL);

        let nothing = timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn http_connect_scenario() {
        let (listener, addr) = upstream_listener().await;
        let (mut client, _shutdown) = start_session(ProtocolKind::HttpProxy);

        let request = format!("CONNECT {} HTTP/1.1\r\nHost: x\r\n\r\n", addr);
        client.write_all(request.as_bytes()).await.unwrap();

        let (mut upstream, _) = listener.accept().await.unwrap();

        let mut got = vec![0u8; RESPONSE_200.len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, RESPONSE_200);

        // Nothing of the CONNECT request reaches the upstream; the first
        // thing it sees is the tunneled payload.
        client.write_all(b"tunneled").await.unwrap();
        let mut got = [0u8; 8];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"tunneled");
    }

    #[tokio::test]
    async fn http_forward_replays_request_verbatim() {
        let (listener, addr) = upstream_listener().await;
        let (mut client, _shutdown) = start_session(ProtocolKind::HttpProxy);

        let request = format!(
            "GET http://{}/p HTTP/1.1\r\nHost: {}\r\n\r\n",
            addr, addr
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let (mut upstream, _) = listener.accept().await.unwrap();

        let mut got = vec![0u8; request.len()];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(got, request.as_bytes());

        // Response streams straight back, no proxy-added status.
        upstream
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
        let mut got = vec![0u8; 27];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got[..], b"HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[tokio::test]
    async fn https_absolute_uri_rejected_with_400() {
        let (listener, _addr) = upstream_listener().await;
        let (mut client, _shutdown) = start_session(ProtocolKind::HttpProxy);

        client
            .write_all(b"GET https://x/ HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(&got, RESPONSE_400);

        let nothing = timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn connect_to_dead_port_gets_502() {
        let (listener, addr) = upstream_listener().await;
        drop(listener);
        let (mut client, _shutdown) = start_session(ProtocolKind::HttpProxy);

        let request = format!("CONNECT {} HTTP/1.1\r\n\r\n", addr);
        client.write_all(request.as_bytes()).await.unwrap();

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(&got, RESPONSE_502);
    }

    #[tokio::test]
    async fn rawtcp_dial_failure_gets_failure_byte() {
        let (listener, addr) = upstream_listener().await;
        drop(listener);
        let (mut client, _shutdown) = start_session(ProtocolKind::Rawtcp);

        client
            .write_all(&raw_handshake(&Target::Socket(addr), b""))
            .await
            .unwrap();

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, vec![STATUS_FAIL]);
    }

    #[tokio::test]
    async fn oversized_handshake_is_rejected() {
        let (mut client, _shutdown) = start_session(ProtocolKind::HttpProxy);

        // No CRLF anywhere: the parser keeps asking for more until the
        // buffer cap trips.
        let blob = vec![b'A'; DEFAULT_MAX_HANDSHAKE_BUFFER + READ_CHUNK];
        client.write_all(&blob).await.unwrap();

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(&got, RESPONSE_400);
    }

    #[tokio::test]
    async fn shutdown_signal_closes_session() {
        let (client, inbound) = tokio::io::duplex(1024);
        let (tx, rx) = broadcast::channel(1);
        let session = Session::new(7, settings(ProtocolKind::Rawtcp), Arc::new(PlainFraming));
        let handle = tokio::spawn(session.run(Box::new(inbound), rx));

        tx.send(()).unwrap();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("session did not stop on shutdown")
            .unwrap();
        drop(client);
    }
}
