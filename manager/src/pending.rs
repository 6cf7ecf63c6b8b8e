//! An in-flight request or WebSocket proxy session waiting on frames from
//! an agent, keyed by correlation id inside an [`crate::tunnel::AgentTunnel`].

use tokio::sync::{mpsc, oneshot};
use tunnel_protocol::{TunnelError, TunnelMessage};

/// What an HTTP request resolves to once the agent starts answering it.
/// A `request` is registered not knowing in advance which shape its
/// answer will take (§4.5, §9 "streamed responses"): a single `response`
/// frame resolves it as [`ResponseOutcome::Buffered`], while a
/// `stream_data`/`stream_end` sequence — with or without a preceding
/// `response` — resolves it as [`ResponseOutcome::Streamed`].
pub enum ResponseOutcome {
    Buffered(TunnelMessage),
    Streamed(mpsc::UnboundedReceiver<StreamChunk>),
}

/// One event in a streamed HTTP response body. There is no explicit `End`
/// variant: `stream_end` (or tunnel close with nothing more to say) is
/// represented by dropping the sending half, which the receiving stream
/// observes as a clean end-of-body.
pub enum StreamChunk {
    Data(Vec<u8>),
    Error(TunnelError),
}

/// What to do with the next frame that arrives carrying a given
/// correlation id.
pub enum PendingRequest {
    /// A request awaiting its first reply frame — resolved exactly once,
    /// with either shape of [`ResponseOutcome`].
    Http(oneshot::Sender<Result<ResponseOutcome, TunnelError>>),
    /// A request whose reply has already been determined to be streamed;
    /// every subsequent `stream_data`/`stream_end` frame is forwarded here.
    Stream(mpsc::UnboundedSender<StreamChunk>),
    /// A live WebSocket proxy session — every `websocket_data`/
    /// `websocket_close` frame for this id is forwarded until the
    /// channel closes.
    WebSocket(mpsc::UnboundedSender<TunnelMessage>),
}
