//! Downstream side of a relay session: where SSE frames are written
//!
//! The session only ever talks to a [`FrameSink`]. In the server the sink is
//! a bounded channel feeding the HTTP response body, so a slow client fills
//! the channel and `send` stops returning, which stops upstream reads.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::event::DONE_LINE;

/// The downstream client is gone
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Downstream client disconnected")]
pub struct SinkClosed;

/// Writable end of the client-facing SSE stream
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Deliver one frame, waiting while the client is not accepting data
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed>;

    /// Resolves once the client has disconnected
    async fn closed(&self);

    /// Write end-of-stream and release the client. Sessions call this once.
    fn finish(&mut self);
}

/// Channel-backed sink whose receiver becomes the HTTP response body
#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl ChannelSink {
    /// Create a sink buffering at most `capacity` frames
    pub fn new(capacity: usize) -> (Self, ReceiverStream<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, ReceiverStream::new(rx))
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed> {
        match &self.tx {
            Some(tx) => tx.send(frame).await.map_err(|_| SinkClosed),
            None => Err(SinkClosed),
        }
    }

    async fn closed(&self) {
        if let Some(tx) = &self.tx {
            tx.closed().await;
        }
    }

    fn finish(&mut self) {
        // Dropping the last sender ends the receiver stream, which ends the body.
        self.tx = None;
    }
}

/// `data: <json>\n\n`
pub fn data_frame(json: &str) -> Bytes {
    Bytes::from(format!("data: {json}\n\n"))
}

/// `data: [DONE]\n\n`
pub fn done_frame() -> Bytes {
    Bytes::from(format!("{DONE_LINE}\n\n"))
}

/// `data: [ERROR] <message>\n\n`, the visible in-band error marker
pub fn error_frame(message: &str) -> Bytes {
    Bytes::from(format!("data: [ERROR] {message}\n\n"))
}

/// A non-data line forwarded verbatim as its own frame
pub fn passthrough_frame(text: &str) -> Bytes {
    Bytes::from(format!("{text}\n\n"))
}
