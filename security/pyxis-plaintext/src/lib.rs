use futures::{AsyncReadExt, AsyncWriteExt, FutureExt, future::BoxFuture};
use libp2p_identity::{DecodingError, PeerId, PublicKey, ed25519};
use pyxis_core::{BoxedStream, SecurityError, SecurityUpgrade, StreamProtocol};
use std::io;

const PROTOCOL_NAME: StreamProtocol = StreamProtocol::new("/plaintext/1.0.0");

/// 明文"握手"：双方交换 ed25519 公钥，不做任何加密。
///
/// 仅用于测试和可信网络。
#[derive(Clone)]
pub struct Config {
    local: PublicKey,
}

impl Config {
    pub fn new(local: PublicKey) -> Self {
        Config { local }
    }

    async fn handshake(
        self,
        mut socket: BoxedStream,
        expected: Option<PeerId>,
    ) -> Result<(PeerId, BoxedStream), Error> {
        let local = self
            .local
            .clone()
            .try_into_ed25519()
            .map_err(|_| Error::UnsupportedKeyType)?;

        socket.write_all(&local.to_bytes()).await?;
        socket.flush().await?;

        let mut key_buf = [0u8; 32];
        socket.read_exact(&mut key_buf).await?;
        let remote = PublicKey::from(ed25519::PublicKey::try_from_bytes(&key_buf)?);
        let peer = remote.to_peer_id();
        tracing::trace!(%peer, "exchanged identity");

        if let Some(expected) = expected {
            if expected != peer {
                return Err(Error::PeerMismatch {
                    expected,
                    obtained: peer,
                });
            }
        }

        Ok((peer, socket))
    }
}

impl SecurityUpgrade for Config {
    fn protocol(&self) -> StreamProtocol {
        PROTOCOL_NAME
    }

    fn secure_inbound(
        &self,
        stream: BoxedStream,
    ) -> BoxFuture<'static, Result<(PeerId, BoxedStream), SecurityError>> {
        let config = self.clone();
        async move { config.handshake(stream, None).await.map_err(Into::into) }.boxed()
    }

    fn secure_outbound(
        &self,
        stream: BoxedStream,
        remote: Option<PeerId>,
    ) -> BoxFuture<'static, Result<(PeerId, BoxedStream), SecurityError>> {
        let config = self.clone();
        async move { config.handshake(stream, remote).await.map_err(Into::into) }.boxed()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid remote key: {0}")]
    InvalidKey(#[from] DecodingError),
    #[error("Local key is not an ed25519 key")]
    UnsupportedKeyType,
    #[error("Remote peer mismatch, expected {expected}, obtained {obtained}")]
    PeerMismatch { expected: PeerId, obtained: PeerId },
}

impl From<Error> for SecurityError {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(error) => SecurityError::Io(error),
            Error::PeerMismatch { expected, obtained } => {
                SecurityError::PeerMismatch { expected, obtained }
            }
            other => SecurityError::Handshake(other.to_string()),
        }
    }
}
