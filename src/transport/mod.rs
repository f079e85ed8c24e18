//! Inbound framing and outbound dialing
//!
//! Two inbound framings exist: plain TCP (stream-oriented, native
//! backpressure) and WebSocket (message-oriented, explicit sink-readiness
//! backpressure). Both erase to [`Stream`], so the session state machine
//! never knows which one it is running on.

pub mod tcp;
pub mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::{Result, Stream};

/// Which close code a message-framed transport owes its peer: an internal
/// error code until the handshake completes, normal closure afterwards.
/// The session marks the handle when it enters the relaying state; plain
/// TCP has no close codes and ignores it.
#[derive(Clone, Default)]
pub struct CloseMode(Arc<AtomicBool>);

impl CloseMode {
    pub fn mark_established(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_established(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Server-side framing negotiation for an accepted connection.
#[async_trait]
pub trait Framing: Send + Sync {
    async fn accept(&self, stream: Stream, close: CloseMode) -> Result<Stream>;
}

/// Raw TCP passthrough
pub struct PlainFraming;

#[async_trait]
impl Framing for PlainFraming {
    async fn accept(&self, stream: Stream, _close: CloseMode) -> Result<Stream> {
        Ok(stream)
    }
}
