//! Listener supervisor
//!
//! Binds the TCP listener (and the UDP forwarder when configured),
//! spawns one session per accepted connection, and on SIGINT stops
//! accepting, broadcasts shutdown, and gives live sessions a grace
//! period before forcing exit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::common::Result;
use crate::config::{Config, Settings};
use crate::relay::{Session, UdpForwarder};
use crate::transport::{tcp, websocket::WebSocketFraming, Framing, PlainFraming};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FORCED: i32 = 1;

/// How long live sessions get to wind down after SIGINT
const GRACE: Duration = Duration::from_secs(5);

/// Run the relay until SIGINT. Returns the process exit code; bind and
/// setup failures come back as errors instead.
pub async fn run(config: Config) -> Result<i32> {
    let settings = Arc::new(config.settings()?);

    let listener = tcp::bind(settings.listen_port).await?;
    info!(
        "listening on 0.0.0.0:{} ({})",
        settings.listen_port, settings.kind
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    let udp_task = match &settings.udp {
        Some(udp_settings) => {
            let forwarder = UdpForwarder::bind(udp_settings).await?;
            Some(tokio::spawn(forwarder.run(shutdown_tx.subscribe())))
        }
        None => None,
    };

    let active = Arc::new(AtomicUsize::new(0));
    let drained = Arc::new(Notify::new());

    let accept_task = tokio::spawn(accept_loop(
        listener,
        settings,
        shutdown_tx.clone(),
        active.clone(),
        drained.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!(
        "shutting down, {} sessions live",
        active.load(Ordering::Acquire)
    );

    // Stops the accept loop and every live session.
    let _ = shutdown_tx.send(());
    let session_count = accept_task.await.unwrap_or(0);

    let wind_down = async {
        loop {
            let notified = drained.notified();
            if active.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
    };
    let graceful = timeout(GRACE, wind_down).await.is_ok();

    if let Some(task) = udp_task {
        match timeout(GRACE, task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("UDP forwarder failed: {}", e),
            Ok(Err(e)) => warn!("UDP forwarder panicked: {}", e),
            Err(_) => warn!("UDP forwarder did not stop in time"),
        }
    }

    if graceful {
        info!("goodbye (served {} sessions)", session_count);
        Ok(EXIT_OK)
    } else {
        warn!(
            "forcing exit with {} sessions still live",
            active.load(Ordering::Acquire)
        );
        Ok(EXIT_FORCED)
    }
}

/// Accept until shutdown; one spawned session per connection. Returns the
/// number of sessions served.
async fn accept_loop(
    listener: TcpListener,
    settings: Arc<Settings>,
    shutdown_tx: broadcast::Sender<()>,
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
) -> u64 {
    let framing: Arc<dyn Framing> = if settings.kind.message_framed() {
        Arc::new(WebSocketFraming)
    } else {
        Arc::new(PlainFraming)
    };

    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut session_count: u64 = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("accept error: {}", e);
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {}: {}", peer, e);
                }

                session_count += 1;
                debug!(session = session_count, "accepted {}", peer);

                let session = Session::new(session_count, settings.clone(), framing.clone());
                let shutdown_rx = shutdown_tx.subscribe();
                let active = active.clone();
                let drained = drained.clone();

                active.fetch_add(1, Ordering::AcqRel);
                tokio::spawn(async move {
                    session.run(Box::new(stream), shutdown_rx).await;
                    if active.fetch_sub(1, Ordering::AcqRel) == 1 {
                        drained.notify_waiters();
                    }
                });
            }
            _ = shutdown_rx.recv() => {
                debug!("accept loop stopping");
                break;
            }
        }
    }

    // Listener drops here; nothing new is accepted past this point.
    session_count
}
