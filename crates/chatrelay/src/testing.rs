//! Test utilities for chatrelay - scripted upstreams and recording sinks
//!
//! Shared by unit tests and the integration tests under `tests/`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::relay::{FrameSink, SinkClosed, StreamFault};

/// Upstream that yields each string as one chunk, then ends
pub fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, StreamFault>> + Send + use<> {
    let items: Vec<Result<Bytes, StreamFault>> = parts
        .iter()
        .map(|part| Ok(Bytes::copy_from_slice(part.as_bytes())))
        .collect();
    stream::iter(items)
}

/// Upstream built from raw byte chunks and faults, in order
pub fn scripted(
    items: Vec<Result<&'static [u8], StreamFault>>,
) -> impl Stream<Item = Result<Bytes, StreamFault>> + Send + 'static {
    stream::iter(
        items
            .into_iter()
            .map(|item| item.map(Bytes::from_static))
            .collect::<Vec<_>>(),
    )
}

/// Raw HTTP upstream whose responses are cut short.
///
/// Every connection gets a `200` declaring `declared_len` body bytes, then
/// `body`, then the socket closes. Returns the base URL to point a client at.
pub async fn truncated_upstream(
    body: &'static str,
    declared_len: usize,
) -> std::io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(respond_truncated(socket, body, declared_len));
        }
    });

    Ok(format!("http://{addr}"))
}

async fn respond_truncated(
    mut socket: TcpStream,
    body: &'static str,
    declared_len: usize,
) -> std::io::Result<()> {
    read_request(&mut socket).await?;

    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         content-type: text/event-stream\r\n\
         content-length: {declared_len}\r\n\r\n"
    );
    socket.write_all(head.as_bytes()).await?;
    socket.write_all(body.as_bytes()).await?;
    socket.flush().await?;
    socket.shutdown().await
}

/// Consume one request, headers and `content-length` body, so closing the
/// socket afterwards is a clean FIN rather than a reset.
async fn read_request(socket: &mut TcpStream) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);

        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);

        if buf.len() >= end + 4 + body_len {
            return Ok(());
        }
    }
}

#[derive(Debug, Default)]
struct Recorded {
    frames: Vec<String>,
    finish_count: usize,
}

/// Sink that records every frame and counts `finish` calls
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    inner: Arc<Mutex<Recorded>>,
    disconnect_after: Option<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `frames` frames, then behave like a disconnected client
    pub fn disconnect_after(frames: usize) -> Self {
        Self {
            inner: Arc::default(),
            disconnect_after: Some(frames),
        }
    }

    /// Frames written so far, as text
    pub fn frames(&self) -> Vec<String> {
        self.lock().frames.clone()
    }

    /// All frames concatenated, as the client would read the body
    pub fn body(&self) -> String {
        self.lock().frames.concat()
    }

    pub fn finish_count(&self) -> usize {
        self.lock().finish_count
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_disconnected(&self) -> bool {
        self.disconnect_after
            .is_some_and(|limit| self.lock().frames.len() >= limit)
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed> {
        if self.is_disconnected() {
            return Err(SinkClosed);
        }
        self.lock()
            .frames
            .push(String::from_utf8_lossy(&frame).into_owned());
        Ok(())
    }

    async fn closed(&self) {
        if !self.is_disconnected() {
            std::future::pending::<()>().await;
        }
    }

    fn finish(&mut self) {
        self.lock().finish_count += 1;
    }
}
