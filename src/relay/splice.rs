//! Bidirectional splice with a shared idle window
//!
//! Two half-duplex copies run concurrently. EOF on a source half-closes
//! its destination and lets the opposite half drain; a hard error or the
//! idle timeout on either half ends the whole splice at once. The idle
//! clock is shared, so the session stays up as long as either direction
//! still moves bytes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, Instant};

use crate::error::Error;

/// Per-read chunk cap
const CHUNK_SIZE: usize = 64 * 1024;

/// How one copy half ended
enum HalfEnd {
    Eof,
    Idle,
    Err(std::io::Error),
}

/// Byte counters and terminal reason of a finished splice
pub struct Ended {
    pub up: u64,
    pub down: u64,
    pub reason: Error,
}

/// Copy inbound⇄upstream until the session is over.
///
/// `up` counts inbound→upstream bytes, `down` the reverse. The reason is
/// the session-terminal error kind: a hard IO error wins over the idle
/// timeout, which wins over plain EOFs.
pub async fn splice<A, B>(inbound: A, upstream: B, idle: Duration) -> Ended
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (in_read, in_write) = tokio::io::split(inbound);
    let (up_read, up_write) = tokio::io::split(upstream);

    let activity = Mutex::new(Instant::now());
    let up_total = AtomicU64::new(0);
    let down_total = AtomicU64::new(0);

    let upload = copy_half(in_read, up_write, &activity, idle, &up_total);
    let download = copy_half(up_read, in_write, &activity, idle, &down_total);
    tokio::pin!(upload);
    tokio::pin!(download);

    // Only a clean EOF lets the opposite half keep draining; an error or
    // the idle timeout drops the unfinished half, and its sockets with it.
    let reason = tokio::select! {
        end = &mut upload => match end {
            HalfEnd::Eof => match download.await {
                HalfEnd::Eof => Error::ClientClosed,
                HalfEnd::Idle => Error::IdleTimeout,
                HalfEnd::Err(e) => Error::Io(e),
            },
            HalfEnd::Idle => Error::IdleTimeout,
            HalfEnd::Err(e) => Error::Io(e),
        },
        end = &mut download => match end {
            HalfEnd::Eof => match upload.await {
                HalfEnd::Eof => Error::UpstreamClosed,
                HalfEnd::Idle => Error::IdleTimeout,
                HalfEnd::Err(e) => Error::Io(e),
            },
            HalfEnd::Idle => Error::IdleTimeout,
            HalfEnd::Err(e) => Error::Io(e),
        },
    };

    Ended {
        up: up_total.load(Ordering::Acquire),
        down: down_total.load(Ordering::Acquire),
        reason,
    }
}

async fn copy_half<R, W>(
    mut src: R,
    mut dst: W,
    activity: &Mutex<Instant>,
    idle: Duration,
    total: &AtomicU64,
) -> HalfEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let deadline = *activity.lock() + idle;
        let n = tokio::select! {
            result = src.read(&mut buf) => match result {
                Ok(0) => {
                    // Half-close: the peer may still have bytes to send
                    // the other way.
                    let _ = dst.shutdown().await;
                    return HalfEnd::Eof;
                }
                Ok(n) => n,
                Err(e) => return HalfEnd::Err(e),
            },
            _ = sleep_until(deadline) => {
                // The other half may have refreshed the clock meanwhile.
                if Instant::now() >= *activity.lock() + idle {
                    return HalfEnd::Idle;
                }
                continue;
            }
        };

        *activity.lock() = Instant::now();

        if let Err(e) = dst.write_all(&buf[..n]).await {
            return HalfEnd::Err(e);
        }
        if let Err(e) = dst.flush().await {
            return HalfEnd::Err(e);
        }
        total.fetch_add(n as u64, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    #[tokio::test]
    async fn counts_bytes_both_ways() {
        let (client, inbound) = tokio::io::duplex(1024);
        let (server, upstream) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(inbound, upstream, Duration::from_secs(5)));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        client_write.write_all(b"hello upstream").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut got = vec![0u8; 14];
        server_read.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello upstream");

        server_write.write_all(b"hi back").await.unwrap();
        server_write.shutdown().await.unwrap();

        let mut got = vec![0u8; 7];
        client_read.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hi back");

        let ended = task.await.unwrap();
        assert_eq!(ended.up, 14);
        assert_eq!(ended.down, 7);
        assert!(matches!(
            ended.reason,
            Error::ClientClosed | Error::UpstreamClosed
        ));
    }

    #[tokio::test]
    async fn half_close_lets_other_side_drain() {
        let (client, inbound) = tokio::io::duplex(1024);
        let (server, upstream) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(inbound, upstream, Duration::from_secs(5)));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        // Client is done sending immediately.
        client_write.shutdown().await.unwrap();

        // Upstream sees EOF, then still delivers its response.
        let mut probe = [0u8; 1];
        assert_eq!(server_read.read(&mut probe).await.unwrap(), 0);
        server_write.write_all(b"late response").await.unwrap();
        server_write.shutdown().await.unwrap();

        let mut got = Vec::new();
        client_read.read_to_end(&mut got).await.unwrap();
        assert_eq!(&got, b"late response");

        let ended = task.await.unwrap();
        assert_eq!(ended.down, 13);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fires() {
        let (_client, inbound) = tokio::io::duplex(1024);
        let (_server, upstream) = tokio::io::duplex(1024);

        let ended = splice(inbound, upstream, Duration::from_millis(200)).await;
        assert!(matches!(ended.reason, Error::IdleTimeout));
        assert_eq!(ended.up + ended.down, 0);
    }

    /// Upstream whose writes always fail and whose reads never resolve.
    struct DeadUpstream;

    impl AsyncRead for DeadUpstream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for DeadUpstream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer gone",
            )))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn hard_error_tears_down_both_halves() {
        let (mut client, inbound) = tokio::io::duplex(1024);

        // The download half is parked on a read that never resolves; only
        // the upload half's write error can end this splice before the
        // 60 s idle window.
        let task = tokio::spawn(splice(inbound, DeadUpstream, Duration::from_secs(60)));

        client.write_all(b"x").await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("error on one half must end the splice promptly")
            .unwrap();
        assert!(matches!(ended.reason, Error::Io(_)));
        assert_eq!(ended.up + ended.down, 0);
    }
}
