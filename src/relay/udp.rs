//! UDP forwarder
//!
//! Datagrams from any source go verbatim to the configured upstream; the
//! source is recorded so datagrams coming back from the upstream can be
//! delivered to the most recent live client. One socket serves both
//! directions. Entries expire after the idle window, swept once a minute.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::common::{Error, Result};
use crate::config::UdpSettings;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const MAX_DATAGRAM: usize = 65_535;

/// Return-path routing state, one lock for everything.
#[derive(Default)]
struct RouteMap {
    entries: HashMap<SocketAddr, Instant>,
    recent: Option<SocketAddr>,
}

impl RouteMap {
    fn touch(&mut self, source: SocketAddr) {
        self.entries.insert(source, Instant::now());
        self.recent = Some(source);
    }

    /// Most recent source still inside the idle window.
    fn return_path(&self, idle: Duration) -> Option<SocketAddr> {
        let source = self.recent?;
        let seen = self.entries.get(&source)?;
        (seen.elapsed() < idle).then_some(source)
    }

    fn sweep(&mut self, idle: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, seen| seen.elapsed() < idle);
        if let Some(recent) = self.recent {
            if !self.entries.contains_key(&recent) {
                self.recent = None;
            }
        }
        before - self.entries.len()
    }
}

pub struct UdpForwarder {
    socket: UdpSocket,
    upstream: SocketAddr,
    idle: Duration,
    routes: Mutex<RouteMap>,
}

impl UdpForwarder {
    /// Bind the forwarder socket and resolve the upstream once.
    pub async fn bind(settings: &UdpSettings) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", settings.listen_port))
            .await
            .map_err(|e| {
                Error::Config(format!(
                    "cannot bind UDP 0.0.0.0:{}: {}",
                    settings.listen_port, e
                ))
            })?;

        let upstream = lookup_host((settings.target_host.as_str(), settings.target_port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                Error::Config(format!(
                    "cannot resolve UDP upstream {}:{}",
                    settings.target_host, settings.target_port
                ))
            })?;

        Ok(Self {
            socket,
            upstream,
            idle: settings.idle,
            routes: Mutex::new(RouteMap::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(
            upstream = %self.upstream,
            "UDP forwarder on {}",
            self.local_addr()?
        );

        let mut sweep = interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, source)) => self.forward(&buf[..len], source).await,
                        Err(e) => warn!("UDP recv error: {}", e),
                    }
                }
                _ = sweep.tick() => {
                    let reaped = self.routes.lock().sweep(self.idle);
                    if reaped > 0 {
                        debug!("reaped {} idle UDP clients", reaped);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        info!("UDP forwarder stopped");
        Ok(())
    }

    async fn forward(&self, datagram: &[u8], source: SocketAddr) {
        if source == self.upstream {
            // Return path: hand the reply to the client seen last.
            let Some(client) = self.routes.lock().return_path(self.idle) else {
                debug!("dropping upstream datagram, no live client");
                return;
            };
            if let Err(e) = self.socket.send_to(datagram, client).await {
                warn!("UDP send to {} failed: {}", client, e);
            }
        } else {
            self.routes.lock().touch(source);
            if let Err(e) = self.socket.send_to(datagram, self.upstream).await {
                warn!("UDP send to upstream failed: {}", e);
            }
        }
    }
}
