//! WebSocket framing
//!
//! Adapts the message-oriented transport to the byte-stream interface the
//! session runs on: each binary (or text) message is one read chunk,
//! each write becomes one binary message, and writes are gated on sink
//! readiness, which is the message-side equivalent of pause/resume.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, Stream as FuturesStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::protocol::{
        frame::{coding::CloseCode, CloseFrame},
        Message, WebSocketConfig,
    },
    WebSocketStream,
};
use tracing::{debug, trace};

use crate::common::{Error, IntoStream, Result, Stream};

use super::{CloseMode, Framing};

/// Keepalive ping cadence; pongs are not required.
const PING_INTERVAL: Duration = Duration::from_secs(30);

const MAX_MESSAGE_SIZE: usize = 64 << 20;
const MAX_FRAME_SIZE: usize = 16 << 20;

/// WebSocket framing for inbound listeners
pub struct WebSocketFraming;

#[async_trait]
impl Framing for WebSocketFraming {
    async fn accept(&self, stream: Stream, close: CloseMode) -> Result<Stream> {
        let config = WebSocketConfig {
            max_message_size: Some(MAX_MESSAGE_SIZE),
            max_frame_size: Some(MAX_FRAME_SIZE),
            ..Default::default()
        };

        let ws = accept_async_with_config(StreamWrapper(stream), Some(config))
            .await
            .map_err(|e| Error::BadHandshake(format!("WebSocket upgrade failed: {}", e)))?;

        trace!("WebSocket upgrade completed");
        Ok(MessageStream::new(ws, close).into_stream())
    }
}

/// Makes the type-erased Stream usable as tungstenite's underlying socket
struct StreamWrapper(Stream);

impl AsyncRead for StreamWrapper {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for StreamWrapper {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.0).poll_shutdown(cx)
    }
}

/// Byte-stream view of a WebSocket connection.
///
/// Messages accrete into reads the same way bytes accrete on a TCP stream;
/// a message larger than the caller's buffer is handed out across several
/// reads.
pub struct MessageStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
    closed: bool,
    close_sent: bool,
    close_mode: CloseMode,
    ping_timer: Interval,
}

impl<S> MessageStream<S> {
    fn new(inner: WebSocketStream<S>, close_mode: CloseMode) -> Self {
        let mut ping_timer = interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
            closed: false,
            close_sent: false,
            close_mode,
            ping_timer,
        }
    }
}

impl<S> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Best-effort keepalive ping; skipped entirely when the sink is busy.
    fn maybe_ping(&mut self, cx: &mut Context<'_>) {
        if self.ping_timer.poll_tick(cx).is_pending() {
            return;
        }
        if Pin::new(&mut self.inner).poll_ready(cx).is_ready()
            && Pin::new(&mut self.inner).start_send(Message::Ping(Vec::new())).is_ok()
        {
            let _ = Pin::new(&mut self.inner).poll_flush(cx);
            trace!("sent keepalive ping");
        }
    }
}

impl<S> AsyncRead for MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        // Drain a partially-consumed message first.
        if self.read_pos < self.read_buf.len() {
            let remaining = self.read_buf.len() - self.read_pos;
            let to_copy = remaining.min(buf.remaining());
            let start = self.read_pos;
            buf.put_slice(&self.read_buf[start..start + to_copy]);
            self.read_pos += to_copy;

            if self.read_pos >= self.read_buf.len() {
                self.read_buf.clear();
                self.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        if self.closed {
            return Poll::Ready(Ok(()));
        }

        self.maybe_ping(cx);

        loop {
            return match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => {
                    let data = match msg {
                        Message::Binary(data) => data,
                        Message::Text(text) => text.into_bytes(),
                        // tungstenite answers pings internally; both
                        // control frames are invisible to the session.
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(frame) => {
                            debug!("peer sent close frame: {:?}", frame);
                            self.closed = true;
                            return Poll::Ready(Ok(()));
                        }
                        Message::Frame(_) => {
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                "unexpected raw frame",
                            )));
                        }
                    };

                    let to_copy = data.len().min(buf.remaining());
                    buf.put_slice(&data[..to_copy]);
                    if to_copy < data.len() {
                        self.read_buf = data;
                        self.read_pos = to_copy;
                    }
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(Some(Err(e))) => {
                    self.closed = true;
                    Poll::Ready(Err(std::io::Error::other(e.to_string())))
                }
                Poll::Ready(None) => {
                    self.closed = true;
                    Poll::Ready(Ok(()))
                }
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

impl<S> AsyncWrite for MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "websocket closed",
            )));
        }

        // Sink readiness is the pause signal: a full peer parks this write
        // (and through it the reading half feeding it) until drained.
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => {
                self.closed = true;
                return Poll::Ready(Err(std::io::Error::other(e.to_string())));
            }
            Poll::Pending => return Poll::Pending,
        }

        match Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => {
                self.closed = true;
                Poll::Ready(Err(std::io::Error::other(e.to_string())))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // WebSocket has no half-close; shutting down the write side closes
        // the whole connection, with 1000 once the session reached
        // relaying and 1011 when the handshake never completed.
        if self.closed {
            return Poll::Ready(Ok(()));
        }

        if !self.close_sent {
            match Pin::new(&mut self.inner).poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(_)) => {
                    self.closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }

            let code = if self.close_mode.is_established() {
                CloseCode::Normal
            } else {
                CloseCode::Error
            };
            let frame = CloseFrame {
                code,
                reason: "".into(),
            };
            if Pin::new(&mut self.inner)
                .start_send(Message::Close(Some(frame)))
                .is_err()
            {
                self.closed = true;
                return Poll::Ready(Ok(()));
            }
            self.close_sent = true;
        }

        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}
