//! Relay session: drives one streaming chat completion from upstream bytes to
//! downstream SSE frames
//!
//! A session owns the line residue, the retry counter, and the downstream
//! sink for exactly one client request. The sink is held by a guard that
//! finishes it on every exit path, including the session future being
//! dropped mid-await.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use super::error::StreamFault;
use super::event::SseEvent;
use super::lines::{DecodeError, LineReassembler};
use super::normalize::{Normalized, normalize};
use super::sink::{
    FrameSink, SinkClosed, data_frame, done_frame, error_frame, passthrough_frame,
};
use crate::config::{LoggingConfig, RelayConfig};

/// Marker written when a `data:` payload is not valid JSON
pub const INVALID_JSON_MESSAGE: &str = "Invalid JSON format.";
/// Marker written when the retry budget runs out
pub const RETRIES_EXHAUSTED_MESSAGE: &str = "Stream closed unexpectedly after retries.";
/// Marker written when the request deadline passes
pub const TIMEOUT_MESSAGE: &str = "Upstream request timed out.";

/// How long a terminal error marker may wait on a stalled client
const FINAL_WRITE_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first upstream byte
    Idle,
    /// At least one byte received
    Streaming,
    Completed,
    Failed,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Upstream finished. `terminated` is true when `[DONE]` was seen,
    /// false when the body simply ended.
    Completed { terminated: bool },
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    RetriesExhausted,
    Timeout,
    Decode(DecodeError),
    ClientDisconnected,
    Upstream(String),
}

/// Summary returned when a session ends
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: Uuid,
    pub state: SessionState,
    pub outcome: Outcome,
    /// Frames accepted by the sink
    pub frames_written: usize,
    /// Transient upstream failures survived or exhausted
    pub retries: u32,
}

enum Flow {
    Continue,
    Terminated,
}

/// One client streaming request
pub struct RelaySession {
    id: Uuid,
    max_retries: u32,
    deadline: Option<Instant>,
    logging: LoggingConfig,
    reassembler: LineReassembler,
    retries: u32,
    state: SessionState,
}

impl RelaySession {
    pub fn new(relay: &RelayConfig, logging: LoggingConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            max_retries: relay.max_retries,
            deadline: None,
            logging,
            reassembler: LineReassembler::new(),
            retries: 0,
            state: SessionState::Idle,
        }
    }

    /// Abort with a timeout once `deadline` passes
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Relay `upstream` into `sink` until the stream terminates, fails, or
    /// the client leaves. `sink` is finished exactly once before returning.
    pub async fn run<U, S>(self, upstream: U, sink: S) -> SessionReport
    where
        U: Stream<Item = Result<Bytes, StreamFault>> + Send,
        S: FrameSink,
    {
        let span = tracing::info_span!("relay_session", id = %self.id);
        self.run_inner(upstream, sink).instrument(span).await
    }

    async fn run_inner<U, S>(mut self, upstream: U, sink: S) -> SessionReport
    where
        U: Stream<Item = Result<Bytes, StreamFault>> + Send,
        S: FrameSink,
    {
        let mut upstream = Box::pin(upstream);
        let mut downstream = Downstream::new(sink);

        let outcome = match self.deadline {
            Some(deadline) => {
                let pumped =
                    tokio::time::timeout_at(deadline, self.pump(&mut upstream, &mut downstream))
                        .await;
                match pumped {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::error!("Request deadline passed mid-stream");
                        downstream.write_final(error_frame(TIMEOUT_MESSAGE)).await;
                        Outcome::Failed(FailureReason::Timeout)
                    }
                }
            }
            None => self.pump(&mut upstream, &mut downstream).await,
        };

        // Close the upstream connection before releasing the client.
        drop(upstream);

        self.state = match outcome {
            Outcome::Completed { .. } => SessionState::Completed,
            Outcome::Failed(_) => SessionState::Failed,
        };
        downstream.finalize();

        match &outcome {
            Outcome::Completed { terminated } => tracing::info!(
                frames = downstream.frames,
                retries = self.retries,
                terminated,
                "Relay session completed"
            ),
            Outcome::Failed(reason) => tracing::warn!(
                frames = downstream.frames,
                retries = self.retries,
                ?reason,
                "Relay session failed"
            ),
        }

        SessionReport {
            id: self.id,
            state: self.state,
            outcome,
            frames_written: downstream.frames,
            retries: self.retries,
        }
    }

    async fn pump<U, S>(&mut self, upstream: &mut U, downstream: &mut Downstream<S>) -> Outcome
    where
        U: Stream<Item = Result<Bytes, StreamFault>> + Unpin,
        S: FrameSink,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = downstream.closed() => {
                    tracing::info!("Client disconnected, cancelling upstream read");
                    return Outcome::Failed(FailureReason::ClientDisconnected);
                }
                next = upstream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    if self.state == SessionState::Idle && !chunk.is_empty() {
                        tracing::debug!("First upstream bytes received");
                        self.state = SessionState::Streaming;
                    }

                    let lines = match self.reassembler.feed(&chunk) {
                        Ok(lines) => lines,
                        Err(e) => return self.fail_decode(downstream, e).await,
                    };

                    for line in lines {
                        match self.process_line(&line, downstream).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Terminated) => {
                                return Outcome::Completed { terminated: true };
                            }
                            Err(SinkClosed) => {
                                return Outcome::Failed(FailureReason::ClientDisconnected);
                            }
                        }
                    }
                }
                Some(Err(StreamFault::Transient(message))) => {
                    self.retries += 1;
                    if self.retries < self.max_retries {
                        tracing::warn!(
                            attempt = self.retries,
                            max_retries = self.max_retries,
                            error = %message,
                            "Upstream stream interrupted, resuming"
                        );
                        continue;
                    }

                    tracing::error!(
                        retries = self.retries,
                        error = %message,
                        "Upstream stream interrupted, retry budget exhausted"
                    );
                    downstream
                        .write_final(error_frame(RETRIES_EXHAUSTED_MESSAGE))
                        .await;
                    return Outcome::Failed(FailureReason::RetriesExhausted);
                }
                Some(Err(StreamFault::Timeout(message))) => {
                    tracing::error!(error = %message, "Upstream stream timed out");
                    downstream.write_final(error_frame(TIMEOUT_MESSAGE)).await;
                    return Outcome::Failed(FailureReason::Timeout);
                }
                Some(Err(StreamFault::Other(message))) => {
                    tracing::error!(error = %message, "Unexpected upstream stream error");
                    downstream.write_final(error_frame(&message)).await;
                    return Outcome::Failed(FailureReason::Upstream(message));
                }
                None => return self.finish_upstream(downstream).await,
            }
        }
    }

    /// Upstream ended without `[DONE]`.
    ///
    /// A clean end flushes any unterminated residue as a final line and
    /// completes. An end that follows a transient fault means the body was cut
    /// short: the residue is a fragment and the client must see that frames
    /// were lost.
    async fn finish_upstream<S: FrameSink>(&mut self, downstream: &mut Downstream<S>) -> Outcome {
        if self.retries > 0 {
            tracing::error!(
                retries = self.retries,
                discarded = self.reassembler.pending(),
                "Upstream stream ended after interruption without [DONE]"
            );
            downstream
                .write_final(error_frame(RETRIES_EXHAUSTED_MESSAGE))
                .await;
            return Outcome::Failed(FailureReason::RetriesExhausted);
        }

        let residue = match self.reassembler.finish() {
            Ok(residue) => residue,
            Err(e) => return self.fail_decode(downstream, e).await,
        };

        if let Some(line) = residue {
            tracing::debug!(bytes = line.len(), "Flushing unterminated final line");
            match self.process_line(&line, downstream).await {
                Ok(Flow::Terminated) => return Outcome::Completed { terminated: true },
                Ok(Flow::Continue) => {}
                Err(SinkClosed) => return Outcome::Failed(FailureReason::ClientDisconnected),
            }
        }

        tracing::debug!("Upstream stream ended without [DONE]");
        Outcome::Completed { terminated: false }
    }

    async fn process_line<S: FrameSink>(
        &mut self,
        line: &str,
        downstream: &mut Downstream<S>,
    ) -> Result<Flow, SinkClosed> {
        if self.logging.log_bodies {
            tracing::debug!("Upstream stream line: {}", line.trim());
        }

        let event = SseEvent::classify(line);
        if event.is_blank() {
            // Every frame already ends in a blank line; upstream separators
            // would double it.
            return Ok(Flow::Continue);
        }

        match event {
            SseEvent::Terminator => {
                tracing::debug!("Upstream stream completed");
                downstream.send(done_frame()).await?;
                return Ok(Flow::Terminated);
            }
            SseEvent::Data(payload) => match normalize(&payload) {
                Normalized::Frame(json) => downstream.send(data_frame(&json)).await?,
                Normalized::Skip => tracing::trace!("Skipping empty-choices chunk"),
                Normalized::ParseError { raw, reason } => {
                    tracing::error!(line = %raw, %reason, "Stream decode error");
                    downstream.send(error_frame(INVALID_JSON_MESSAGE)).await?;
                }
            },
            SseEvent::PassThrough(text) => downstream.send(passthrough_frame(&text)).await?,
        }

        Ok(Flow::Continue)
    }

    async fn fail_decode<S: FrameSink>(
        &mut self,
        downstream: &mut Downstream<S>,
        error: DecodeError,
    ) -> Outcome {
        tracing::error!(%error, "Aborting session on undecodable upstream bytes");
        downstream.write_final(error_frame(&error.to_string())).await;
        Outcome::Failed(FailureReason::Decode(error))
    }
}

/// Owns the sink for a session's lifetime and finishes it exactly once
struct Downstream<S: FrameSink> {
    sink: S,
    frames: usize,
    finalized: bool,
}

impl<S: FrameSink> Downstream<S> {
    fn new(sink: S) -> Self {
        Self {
            sink,
            frames: 0,
            finalized: false,
        }
    }

    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed> {
        self.sink.send(frame).await?;
        self.frames += 1;
        Ok(())
    }

    async fn closed(&self) {
        self.sink.closed().await
    }

    /// Best-effort terminal marker; the client may already be gone or stalled.
    async fn write_final(&mut self, frame: Bytes) {
        match tokio::time::timeout(FINAL_WRITE_GRACE, self.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(SinkClosed)) => tracing::debug!("Client gone before error marker"),
            Err(_) => tracing::warn!("Client stalled, dropping error marker"),
        }
    }

    fn finalize(&mut self) {
        if !self.finalized {
            self.finalized = true;
            self.sink.finish();
        }
    }
}

impl<S: FrameSink> Drop for Downstream<S> {
    fn drop(&mut self) {
        self.finalize();
    }
}
