use multistream_select::NegotiationError;
use pyxis_core::StreamProtocol;
use std::io;

/// 升级失败对整条连接是致命的，底层连接随错误一起被关闭。
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("Connection denied")]
    ConnectionDenied,
    #[error("Connection intercepted by `{method}`")]
    Intercepted { method: &'static str },
    #[error("Remote multiaddr does not contain a peer id")]
    InvalidMultiaddr,
    #[error("No remote peer id supplied for an unencrypted connection")]
    InvalidPeerId,
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Failed to negotiate a stream multiplexer")]
    MuxerUnavailable(#[source] NegotiationError),
    #[error("Upgrade timed out")]
    Timeout,
    #[error("Upgrade aborted")]
    Aborted,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// 打开或路由单条流的失败，只影响这条流。
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Connection has no stream multiplexer")]
    MuxerUnavailable,
    #[error("Connection is closed")]
    ConnectionClosed,
    #[error("Protocol negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("No registered handler for `{0}`")]
    UnhandledProtocol(StreamProtocol),
    #[error("Too many inbound streams for `{protocol}`, limit {limit}")]
    TooManyInboundStreams {
        protocol: StreamProtocol,
        limit: usize,
    },
    #[error("Too many outbound streams for `{protocol}`, {count} open with limit {limit}")]
    TooManyOutboundStreams {
        protocol: StreamProtocol,
        count: usize,
        limit: usize,
    },
    #[error("Handler for `{0}` does not run on limited connections")]
    LimitedConnection(StreamProtocol),
    #[error("Protocol selection timed out")]
    Timeout,
    #[error("Stream opening aborted")]
    Aborted,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
