//! Integration tests for relay sessions
//!
//! Drives `RelaySession` with scripted upstream byte streams and checks the
//! exact frames a client would receive.

use bytes::Bytes;
use futures::{StreamExt, stream};
use std::time::Duration;
use tokio::time::Instant;

use chatrelay::config::{LoggingConfig, RelayConfig};
use chatrelay::relay::{
    ChannelSink, FailureReason, INVALID_JSON_MESSAGE, Outcome, RETRIES_EXHAUSTED_MESSAGE,
    RelaySession, SessionState, StreamFault, TIMEOUT_MESSAGE,
};
use chatrelay::testing::{RecordingSink, chunks, scripted};

// =============================================================================
// Test Fixtures
// =============================================================================

const HI_CHUNK: &str = r#"{"choices":[{"delta":{"content":"Hi"}}]}"#;
const THERE_CHUNK: &str = r#"{"choices":[{"delta":{"content":" there"}}]}"#;

fn session() -> RelaySession {
    RelaySession::new(&RelayConfig::default(), LoggingConfig::default())
}

fn session_with_retries(max_retries: u32) -> RelaySession {
    let relay = RelayConfig {
        max_retries,
        ..RelayConfig::default()
    };
    RelaySession::new(&relay, LoggingConfig::default())
}

fn data(json: &str) -> String {
    format!("data: {json}\n\n")
}

fn marker(message: &str) -> String {
    format!("data: [ERROR] {message}\n\n")
}

const DONE: &str = "data: [DONE]\n\n";

// =============================================================================
// Normal Streams
// =============================================================================

mod normal_stream_tests {
    use super::*;

    #[tokio::test]
    async fn test_content_then_done() {
        let sink = RecordingSink::new();
        let hi = format!("data: {HI_CHUNK}\n\n");
        let upstream = chunks(&[hi.as_str(), "data: [DONE]\n\n"]);

        let report = session().run(upstream, sink.clone()).await;

        assert_eq!(sink.frames(), vec![data(HI_CHUNK), DONE.to_string()]);
        assert_eq!(report.outcome, Outcome::Completed { terminated: true });
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.frames_written, 2);
        assert_eq!(report.retries, 0);
        assert_eq!(sink.finish_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_choices_and_blank_lines_produce_only_done() {
        let sink = RecordingSink::new();
        let upstream = chunks(&[
            "data: {\"choices\":[],\"prompt_filter_results\":[]}\n\n",
            "\n",
            "data: [DONE]\n\n",
        ]);

        let report = session().run(upstream, sink.clone()).await;

        assert_eq!(sink.frames(), vec![DONE.to_string()]);
        assert_eq!(report.outcome, Outcome::Completed { terminated: true });
        assert_eq!(sink.finish_count(), 1);
    }

    #[tokio::test]
    async fn test_crlf_framing() {
        let sink = RecordingSink::new();
        let body = format!("data: {HI_CHUNK}\r\n\r\ndata: [DONE]\r\n\r\n");
        let upstream = chunks(&[body.as_str()]);

        session().run(upstream, sink.clone()).await;

        assert_eq!(sink.frames(), vec![data(HI_CHUNK), DONE.to_string()]);
    }

    #[tokio::test]
    async fn test_comment_lines_pass_through() {
        let sink = RecordingSink::new();
        let hi = format!("data: {HI_CHUNK}\n\n");
        let upstream = chunks(&[": keep-alive\n\n", hi.as_str(), "data: [DONE]\n"]);

        session().run(upstream, sink.clone()).await;

        assert_eq!(
            sink.frames(),
            vec![
                ": keep-alive\n\n".to_string(),
                data(HI_CHUNK),
                DONE.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_bare_data_heartbeat_is_forwarded() {
        let sink = RecordingSink::new();
        let upstream = chunks(&["data:\n", "data: [DONE]\n"]);

        session().run(upstream, sink.clone()).await;

        assert_eq!(
            sink.frames(),
            vec!["data:\n\n".to_string(), DONE.to_string()]
        );
    }

    #[tokio::test]
    async fn test_nothing_after_done_is_forwarded() {
        let sink = RecordingSink::new();
        let upstream = chunks(&[
            "data: [DONE]\n\n",
            format!("data: {HI_CHUNK}\n\n").as_str(),
            "data: [DONE]\n\n",
        ]);

        session().run(upstream, sink.clone()).await;

        assert_eq!(sink.frames(), vec![DONE.to_string()]);
    }

    #[tokio::test]
    async fn test_frames_do_not_depend_on_chunk_boundaries() {
        let body = format!(
            "data: {HI_CHUNK}\n\n: ping\n\n\
             data: {{\"choices\":[]}}\n\n\
             data: {THERE_CHUNK}\n\ndata: [DONE]\n\n"
        );
        let bytes = body.as_bytes();

        let reference = RecordingSink::new();
        session().run(chunks(&[body.as_str()]), reference.clone()).await;

        for cut in 0..=bytes.len() {
            let parts = [&bytes[..cut], &bytes[cut..]];
            let upstream = stream::iter(
                parts
                    .iter()
                    .map(|part| Ok::<_, StreamFault>(Bytes::copy_from_slice(part)))
                    .collect::<Vec<_>>(),
            );

            let sink = RecordingSink::new();
            session().run(upstream, sink.clone()).await;
            assert_eq!(sink.frames(), reference.frames(), "split at byte {cut}");
        }
    }
}

// =============================================================================
// Stream Exhaustion and Residue
// =============================================================================

mod residue_tests {
    use super::*;

    #[tokio::test]
    async fn test_unterminated_final_line_is_flushed() {
        let sink = RecordingSink::new();
        let hi = format!("data: {HI_CHUNK}\n\n");
        let there = format!("data: {THERE_CHUNK}");
        let upstream = chunks(&[hi.as_str(), there.as_str()]);

        let report = session().run(upstream, sink.clone()).await;

        assert_eq!(sink.frames(), vec![data(HI_CHUNK), data(THERE_CHUNK)]);
        assert_eq!(report.outcome, Outcome::Completed { terminated: false });
        assert_eq!(sink.finish_count(), 1);
    }

    #[tokio::test]
    async fn test_unterminated_done_still_terminates() {
        let sink = RecordingSink::new();
        let upstream = chunks(&["data: [DO", "NE]"]);

        let report = session().run(upstream, sink.clone()).await;

        assert_eq!(sink.frames(), vec![DONE.to_string()]);
        assert_eq!(report.outcome, Outcome::Completed { terminated: true });
    }

    #[tokio::test]
    async fn test_exhaustion_without_done_writes_no_terminator() {
        let sink = RecordingSink::new();
        let upstream = chunks(&[format!("data: {HI_CHUNK}\n\n").as_str()]);

        let report = session().run(upstream, sink.clone()).await;

        assert_eq!(sink.frames(), vec![data(HI_CHUNK)]);
        assert_eq!(report.outcome, Outcome::Completed { terminated: false });
        assert_eq!(sink.finish_count(), 1);
    }
}

// =============================================================================
// Malformed Payloads
// =============================================================================

mod malformed_payload_tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_json_emits_marker_and_continues() {
        let sink = RecordingSink::new();
        let upstream = chunks(&[
            "data: {\"choices\": [\n\n",
            format!("data: {HI_CHUNK}\n\n").as_str(),
            "data: [DONE]\n\n",
        ]);

        let report = session().run(upstream, sink.clone()).await;

        assert_eq!(
            sink.frames(),
            vec![marker(INVALID_JSON_MESSAGE), data(HI_CHUNK), DONE.to_string()]
        );
        assert_eq!(report.outcome, Outcome::Completed { terminated: true });
    }

    #[tokio::test]
    async fn test_invalid_utf8_fails_session() {
        let sink = RecordingSink::new();
        let upstream = scripted(vec![
            Ok(b"data: {\"choices\":[{\"index\":0}]}\n".as_slice()),
            Ok(b"data: \xff\xfe\n".as_slice()),
            Ok(b"data: [DONE]\n".as_slice()),
        ]);

        let report = session().run(upstream, sink.clone()).await;

        assert!(matches!(
            report.outcome,
            Outcome::Failed(FailureReason::Decode(_))
        ));
        assert_eq!(report.state, SessionState::Failed);

        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].starts_with("data: [ERROR] "));
        assert!(frames[1].contains("Upstream sent invalid UTF-8"));
        assert!(!sink.body().contains("[DONE]"));
        assert_eq!(sink.finish_count(), 1);
    }
}

// =============================================================================
// Transient Faults and Retry Budget
// =============================================================================

mod retry_tests {
    use super::*;

    fn reset() -> StreamFault {
        StreamFault::Transient("connection reset by peer".to_string())
    }

    #[tokio::test]
    async fn test_transient_faults_within_budget_resume_without_duplicates() {
        let sink = RecordingSink::new();
        let first = format!("data: {HI_CHUNK}\n\n");
        let second = format!("data: {THERE_CHUNK}\n\n");
        let upstream = stream::iter(vec![
            Ok(Bytes::from(first)),
            Err(reset()),
            Ok(Bytes::from(second)),
            Err(reset()),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ]);

        let report = session().run(upstream, sink.clone()).await;

        assert_eq!(
            sink.frames(),
            vec![data(HI_CHUNK), data(THERE_CHUNK), DONE.to_string()]
        );
        assert_eq!(report.retries, 2);
        assert_eq!(report.outcome, Outcome::Completed { terminated: true });
        assert_eq!(sink.finish_count(), 1);
    }

    #[tokio::test]
    async fn test_fault_mid_line_keeps_residue() {
        let sink = RecordingSink::new();
        let upstream = scripted(vec![
            Ok(b"data: {\"choices\":[{\"ind".as_slice()),
            Err(reset()),
            Ok(b"ex\":0}]}\n\ndata: [DONE]\n\n".as_slice()),
        ]);

        let report = session().run(upstream, sink.clone()).await;

        assert_eq!(
            sink.frames(),
            vec![data(r#"{"choices":[{"index":0}]}"#), DONE.to_string()]
        );
        assert_eq!(report.retries, 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_writes_marker() {
        let sink = RecordingSink::new();
        let upstream = stream::iter(vec![
            Ok(Bytes::from(format!("data: {HI_CHUNK}\n\n"))),
            Err(reset()),
            Err(reset()),
            Err(reset()),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ]);

        let report = session().run(upstream, sink.clone()).await;

        assert_eq!(
            sink.frames(),
            vec![data(HI_CHUNK), marker(RETRIES_EXHAUSTED_MESSAGE)]
        );
        assert_eq!(report.retries, 3);
        assert_eq!(
            report.outcome,
            Outcome::Failed(FailureReason::RetriesExhausted)
        );
        assert_eq!(sink.finish_count(), 1);
    }

    #[tokio::test]
    async fn test_end_of_stream_after_fault_is_not_a_clean_finish() {
        let sink = RecordingSink::new();
        // The HTTP body stream ends for good after a body error.
        let upstream = scripted(vec![
            Ok(b"data: {\"choices\":[{\"index\":0}]}\n\n".as_slice()),
            Err(reset()),
        ]);

        let report = session().run(upstream, sink.clone()).await;

        assert_eq!(
            sink.frames(),
            vec![
                data(r#"{"choices":[{"index":0}]}"#),
                marker(RETRIES_EXHAUSTED_MESSAGE),
            ]
        );
        assert_eq!(report.retries, 1);
        assert_eq!(
            report.outcome,
            Outcome::Failed(FailureReason::RetriesExhausted)
        );
        assert_eq!(report.state, SessionState::Failed);
        assert_eq!(sink.finish_count(), 1);
    }

    #[tokio::test]
    async fn test_fragment_before_fault_is_not_flushed() {
        let sink = RecordingSink::new();
        let upstream = scripted(vec![Ok(b"data: {\"choi".as_slice()), Err(reset())]);

        let report = session().run(upstream, sink.clone()).await;

        assert_eq!(sink.frames(), vec![marker(RETRIES_EXHAUSTED_MESSAGE)]);
        assert_eq!(
            report.outcome,
            Outcome::Failed(FailureReason::RetriesExhausted)
        );
    }

    #[tokio::test]
    async fn test_custom_budget() {
        let sink = RecordingSink::new();
        let upstream = stream::iter(vec![Err::<Bytes, _>(reset())]);

        let report = session_with_retries(1).run(upstream, sink.clone()).await;

        assert_eq!(sink.frames(), vec![marker(RETRIES_EXHAUSTED_MESSAGE)]);
        assert_eq!(report.retries, 1);
    }

    #[tokio::test]
    async fn test_stream_timeout_fault_is_not_retried() {
        let sink = RecordingSink::new();
        let upstream = stream::iter(vec![
            Err(StreamFault::Timeout("operation timed out".to_string())),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ]);

        let report = session().run(upstream, sink.clone()).await;

        assert_eq!(sink.frames(), vec![marker(TIMEOUT_MESSAGE)]);
        assert_eq!(report.retries, 0);
        assert_eq!(report.outcome, Outcome::Failed(FailureReason::Timeout));
    }
}

// =============================================================================
// Deadline and Cancellation
// =============================================================================

mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_mid_stream_writes_timeout_marker() {
        let sink = RecordingSink::new();
        let hi = format!("data: {HI_CHUNK}\n\n");
        let upstream = chunks(&[hi.as_str()]).chain(stream::pending());

        let report = session()
            .with_deadline(Some(Instant::now() + Duration::from_millis(50)))
            .run(upstream, sink.clone())
            .await;

        assert_eq!(sink.frames(), vec![data(HI_CHUNK), marker(TIMEOUT_MESSAGE)]);
        assert_eq!(report.outcome, Outcome::Failed(FailureReason::Timeout));
        assert_eq!(report.state, SessionState::Failed);
        assert_eq!(sink.finish_count(), 1);
    }

    #[tokio::test]
    async fn test_no_deadline_lets_stream_finish() {
        let sink = RecordingSink::new();
        let upstream = chunks(&["data: [DONE]\n\n"]);

        let report = session()
            .with_deadline(None)
            .run(upstream, sink.clone())
            .await;

        assert_eq!(report.outcome, Outcome::Completed { terminated: true });
    }

    #[tokio::test]
    async fn test_channel_sink_ends_body_after_done() {
        let (sink, rx) = ChannelSink::new(4);
        let hi = format!("data: {HI_CHUNK}\n\n");
        let upstream = chunks(&[hi.as_str(), "data: [DONE]\n\n"]);

        let handle = tokio::spawn(session().run(upstream, sink));
        let frames: Vec<Bytes> = rx.collect().await;
        let report = handle.await.unwrap();

        assert_eq!(
            frames,
            vec![Bytes::from(data(HI_CHUNK)), Bytes::from_static(DONE.as_bytes())]
        );
        assert_eq!(report.frames_written, 2);
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_session() {
        let (sink, mut rx) = ChannelSink::new(1);
        let hi = format!("data: {HI_CHUNK}\n\n");
        let upstream = chunks(&[hi.as_str()]).chain(stream::pending());

        let handle = tokio::spawn(session().run(upstream, sink));

        assert_eq!(rx.next().await, Some(Bytes::from(data(HI_CHUNK))));
        drop(rx);

        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("session should stop once the client leaves")
            .unwrap();

        assert_eq!(
            report.outcome,
            Outcome::Failed(FailureReason::ClientDisconnected)
        );
        assert_eq!(report.frames_written, 1);
    }

    #[tokio::test]
    async fn test_client_gone_before_first_byte() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);

        let report = session()
            .run(stream::pending::<Result<Bytes, StreamFault>>(), sink)
            .await;

        assert_eq!(
            report.outcome,
            Outcome::Failed(FailureReason::ClientDisconnected)
        );
        assert_eq!(report.frames_written, 0);
    }
}
