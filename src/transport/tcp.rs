//! TCP listener and upstream dialer

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::common::{Result, Target};
use crate::error::{DialError, Error};

/// Keepalive idle time on upstream sockets
const KEEPALIVE: Duration = Duration::from_secs(60);

/// Bind the relay listener on all interfaces.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::Config(format!("cannot bind 0.0.0.0:{}: {}", port, e)))?;
    Ok(listener)
}

/// Dial the handshake target with a connect deadline.
///
/// Domains resolve through the runtime's resolver; each resolved address is
/// tried in order within the single deadline. The returned socket has
/// Nagle disabled and a 60 s keepalive.
pub async fn dial(target: &Target, connect_timeout: Duration) -> Result<TcpStream> {
    let addrs = resolve(target).await?;

    let stream = timeout(connect_timeout, connect_first(&addrs, target))
        .await
        .map_err(|_| DialError::Timeout(connect_timeout))??;

    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE);
    SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

    Ok(stream)
}

async fn resolve(target: &Target) -> Result<Vec<SocketAddr>> {
    match target {
        Target::Socket(addr) => Ok(vec![*addr]),
        Target::Domain(name, port) => {
            let addrs: Vec<SocketAddr> = lookup_host((name.as_str(), *port))
                .await
                .map_err(|e| {
                    debug!("DNS failure for {}: {}", name, e);
                    DialError::Dns(name.clone())
                })?
                .collect();
            if addrs.is_empty() {
                return Err(DialError::Dns(name.clone()).into());
            }
            Ok(addrs)
        }
    }
}

async fn connect_first(addrs: &[SocketAddr], target: &Target) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    let err = last_err
        .ok_or_else(|| Error::Internal("connect_first called with no addresses".into()))?;
    Err(match err.kind() {
        std::io::ErrorKind::ConnectionRefused => DialError::Refused(target.to_string()).into(),
        _ => DialError::Unreachable(target.to_string()).into(),
    })
}
