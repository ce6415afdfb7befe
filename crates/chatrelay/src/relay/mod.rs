mod error;
mod event;
mod lines;
mod normalize;
mod server;
mod session;
mod sink;
mod upstream;

pub use error::{ProxyError, StreamFault, create_error_response};
pub use event::{DONE_LINE, SseEvent};
pub use lines::{DecodeError, LineReassembler};
pub use normalize::{Normalized, normalize};
pub use server::{AppState, RelayServer, create_router};
pub use session::{
    FailureReason, INVALID_JSON_MESSAGE, Outcome, RETRIES_EXHAUSTED_MESSAGE, RelaySession,
    SessionReport, SessionState, TIMEOUT_MESSAGE,
};
pub use sink::{
    ChannelSink, FrameSink, SinkClosed, data_frame, done_frame, error_frame, passthrough_frame,
};
pub use upstream::{API_KEY_HEADER, UpstreamClient, byte_stream, chat_completions_url};
