use futures::future::BoxFuture;
use libp2p_identity::PeerId;
use std::io;

use crate::{BoxedStream, MultiaddrConnection, StreamProtocol};

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Remote peer mismatch, expected {expected}, obtained {obtained}")]
    PeerMismatch { expected: PeerId, obtained: PeerId },
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// 加密握手升级。
///
/// 握手消耗协商后的流并返回认证过的远端身份和加密流。出站侧若带有
/// 期望的 `PeerId`，身份不符时握手必须以 [`SecurityError::PeerMismatch`]
/// 失败。
pub trait SecurityUpgrade: Send + Sync + 'static {
    fn protocol(&self) -> StreamProtocol;

    fn secure_inbound(
        &self,
        stream: BoxedStream,
    ) -> BoxFuture<'static, Result<(PeerId, BoxedStream), SecurityError>>;

    fn secure_outbound(
        &self,
        stream: BoxedStream,
        remote: Option<PeerId>,
    ) -> BoxFuture<'static, Result<(PeerId, BoxedStream), SecurityError>>;
}

/// 预共享密钥隧道，在任何握手之前套在原始连接外面。
pub trait Protector: Send + Sync + 'static {
    fn protect(
        &self,
        conn: MultiaddrConnection,
    ) -> BoxFuture<'static, io::Result<MultiaddrConnection>>;
}
