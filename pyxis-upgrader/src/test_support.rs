use futures::{
    FutureExt, StreamExt,
    channel::{mpsc, oneshot},
    future::{self, BoxFuture},
};
use libp2p_identity::Keypair;
use multistream_select::Version;
use pyxis_core::{
    BoxedStream, Direction, Multiaddr, MultiaddrConnection, PeerId, SecurityUpgrade,
    StreamMuxerFactory, StreamProtocol,
    muxing::{StreamMuxerBox, StreamMuxerExt},
};
use std::{
    collections::VecDeque,
    io,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::Poll,
};

use crate::{ConnectionGater, ConnectionManager};

pub(crate) const PLAINTEXT: StreamProtocol = StreamProtocol::new("/plaintext/1.0.0");
pub(crate) const YAMUX: StreamProtocol = StreamProtocol::new("/yamux/1.0.0");

pub(crate) fn memory_conn(addr: &str) -> (MultiaddrConnection, futures_ringbuf::Endpoint) {
    let (local, remote) = futures_ringbuf::Endpoint::pair(64 * 1024, 64 * 1024);
    let addr: Multiaddr = addr.parse().unwrap();
    (MultiaddrConnection::new(local, addr), remote)
}

pub(crate) fn maconn_pair() -> (MultiaddrConnection, MultiaddrConnection) {
    let (a, b) = futures_ringbuf::Endpoint::pair(64 * 1024, 64 * 1024);
    (
        MultiaddrConnection::new(a, "/ip4/127.0.0.1/tcp/4001".parse().unwrap()),
        MultiaddrConnection::new(b, "/ip4/127.0.0.1/tcp/4002".parse().unwrap()),
    )
}

/// Gater test double: records every checkpoint and optionally denies one.
#[derive(Default)]
pub(crate) struct RecordingGater {
    deny: Option<&'static str>,
    calls: Mutex<Vec<&'static str>>,
    last_peer: Mutex<Option<PeerId>>,
}

impl RecordingGater {
    pub(crate) fn denying(method: &'static str) -> Self {
        RecordingGater {
            deny: Some(method),
            ..RecordingGater::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn last_peer(&self) -> Option<PeerId> {
        *self.last_peer.lock().unwrap()
    }

    fn record(&self, method: &'static str, peer: Option<&PeerId>) -> BoxFuture<'static, bool> {
        self.calls.lock().unwrap().push(method);
        if let Some(peer) = peer {
            *self.last_peer.lock().unwrap() = Some(*peer);
        }
        future::ready(self.deny == Some(method)).boxed()
    }
}

impl ConnectionGater for RecordingGater {
    fn deny_inbound_connection(&self, _remote_addr: &Multiaddr) -> BoxFuture<'static, bool> {
        self.record("deny_inbound_connection", None)
    }

    fn deny_inbound_encrypted_connection(
        &self,
        peer: &PeerId,
        _remote_addr: &Multiaddr,
    ) -> BoxFuture<'static, bool> {
        self.record("deny_inbound_encrypted_connection", Some(peer))
    }

    fn deny_inbound_upgraded_connection(
        &self,
        peer: &PeerId,
        _remote_addr: &Multiaddr,
    ) -> BoxFuture<'static, bool> {
        self.record("deny_inbound_upgraded_connection", Some(peer))
    }

    fn deny_outbound_connection(
        &self,
        peer: &PeerId,
        _remote_addr: &Multiaddr,
    ) -> BoxFuture<'static, bool> {
        self.record("deny_outbound_connection", Some(peer))
    }

    fn deny_outbound_encrypted_connection(
        &self,
        peer: &PeerId,
        _remote_addr: &Multiaddr,
    ) -> BoxFuture<'static, bool> {
        self.record("deny_outbound_encrypted_connection", Some(peer))
    }

    fn deny_outbound_upgraded_connection(
        &self,
        peer: &PeerId,
        _remote_addr: &Multiaddr,
    ) -> BoxFuture<'static, bool> {
        self.record("deny_outbound_upgraded_connection", Some(peer))
    }
}

/// Connection manager test double counting slot releases.
pub(crate) struct RecordingManager {
    accept: AtomicBool,
    accepted: AtomicUsize,
    released: AtomicUsize,
}

impl Default for RecordingManager {
    fn default() -> Self {
        RecordingManager {
            accept: AtomicBool::new(true),
            accepted: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }
}

impl RecordingManager {
    pub(crate) fn rejecting() -> Self {
        let manager = RecordingManager::default();
        manager.accept.store(false, Ordering::SeqCst);
        manager
    }

    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl ConnectionManager for RecordingManager {
    fn accept_incoming_connection(&self, _remote_addr: &Multiaddr) -> BoxFuture<'static, bool> {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        future::ready(self.accept.load(Ordering::SeqCst)).boxed()
    }

    fn after_upgrade_inbound(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// 对端脚本：作为发起方完成明文握手，返回加密后的流。
pub(crate) async fn remote_secure_outbound(
    io: futures_ringbuf::Endpoint,
    keypair: &Keypair,
    expected: Option<PeerId>,
) -> BoxedStream {
    let (_, negotiated) = multistream_select::dialer_select_proto(io, vec![PLAINTEXT], Version::V1)
        .await
        .unwrap();
    let config = pyxis_plaintext::Config::new(keypair.public());
    let (_, stream) = config
        .secure_outbound(BoxedStream::new(negotiated), expected)
        .await
        .unwrap();
    stream
}

/// 对端脚本：完整的出站客户端，握手后装上 yamux 并持续驱动。
pub(crate) async fn connect_remote(
    io: futures_ringbuf::Endpoint,
    keypair: &Keypair,
) -> RemoteMuxer {
    let stream = remote_secure_outbound(io, keypair, None).await;
    let (_, negotiated) = multistream_select::dialer_select_proto(stream, vec![YAMUX], Version::V1)
        .await
        .unwrap();
    let muxer = pyxis_yamux::Factory::default()
        .create_muxer(BoxedStream::new(negotiated), Direction::Outbound);
    RemoteMuxer::spawn(muxer)
}

/// Drives a remote-side muxer on a background task and hands out substreams.
pub(crate) struct RemoteMuxer {
    commands: mpsc::UnboundedSender<oneshot::Sender<io::Result<BoxedStream>>>,
}

impl RemoteMuxer {
    pub(crate) fn spawn(mut muxer: StreamMuxerBox) -> Self {
        let (commands, mut requests) = mpsc::unbounded();
        tokio::spawn(async move {
            let mut pending: VecDeque<oneshot::Sender<io::Result<BoxedStream>>> = VecDeque::new();
            future::poll_fn(move |cx| {
                loop {
                    match requests.poll_next_unpin(cx) {
                        Poll::Ready(Some(reply)) => {
                            pending.push_back(reply);
                            continue;
                        }
                        Poll::Ready(None) | Poll::Pending => {}
                    }

                    match muxer.poll_unpin(cx) {
                        Poll::Pending | Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(_)) => return Poll::Ready(()),
                    }

                    if !pending.is_empty() {
                        match muxer.poll_outbound_unpin(cx) {
                            Poll::Pending => {}
                            Poll::Ready(result) => {
                                if let Some(reply) = pending.pop_front() {
                                    let _ = reply.send(result);
                                }
                                continue;
                            }
                        }
                    }

                    return Poll::Pending;
                }
            })
            .await
        });

        RemoteMuxer { commands }
    }

    pub(crate) async fn open_substream(&self) -> io::Result<BoxedStream> {
        let (reply, result) = oneshot::channel();
        self.commands.unbounded_send(reply).unwrap();
        result.await.unwrap()
    }

    /// 打开子流并以发起方身份协商协议。
    pub(crate) async fn open_protocol_stream(&self, protocol: StreamProtocol) -> BoxedStream {
        let substream = self.open_substream().await.unwrap();
        let (_, negotiated) =
            multistream_select::dialer_select_proto(substream, vec![protocol], Version::V1)
                .await
                .unwrap();
        BoxedStream::new(negotiated)
    }
}
