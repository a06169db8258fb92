use futures::{
    FutureExt,
    channel::mpsc,
    future::{self, AbortRegistration, Abortable, Either},
};
use futures_timer::Delay;
use multiaddr::Protocol;
use multistream_select::{NegotiationError, Version};
use pyxis_core::{
    BoxedStream, ConnectionTimeline, Direction, Multiaddr, MultiaddrConnection, PeerId, Protector,
    SecurityUpgrade, StreamMuxerFactory, StreamProtocol,
};
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tracing::Instrument;

use crate::{
    AcceptAll, AllowAll, Connection, ConnectionGater, ConnectionManager, MemoryPeerStore, Metrics,
    PeerStore, Registrar, UpgradeError,
    connection::{ConnectionId, ConnectionIo, ConnectionLimits, ConnectionShared, Driver,
        StreamRegistry},
    events::{ConnectionEvent, EventSender, EventStream, ProgressCallback, UpgradeProgress,
        event_channel},
    executor::Executor,
    gating::InboundUpgradeGuard,
};

/// 进站升级的整体时限默认值。
pub const INBOUND_UPGRADE_TIMEOUT: Duration = Duration::from_secs(30);

/// 跳过加密时记录的协议名。
const NATIVE: &str = "native";

const DEFAULT_MAX_NEGOTIATING_INBOUND_STREAMS: usize = 128;

/// 单次升级的选项。
#[derive(Default)]
pub struct UpgradeOpts {
    pub skip_encryption: bool,
    pub skip_protection: bool,
    /// 显式指定复用器工厂，跳过复用协商。
    pub muxer_factory: Option<Arc<dyn StreamMuxerFactory>>,
    pub limits: Option<ConnectionLimits>,
    /// 出站升级的期望对端；地址中嵌入的 `/p2p/` 组件优先。
    pub remote_peer: Option<PeerId>,
    pub signal: Option<AbortRegistration>,
    pub on_progress: Option<ProgressCallback>,
}

pub struct UpgraderBuilder {
    encrypters: Vec<Arc<dyn SecurityUpgrade>>,
    muxers: Vec<Arc<dyn StreamMuxerFactory>>,
    protector: Option<Arc<dyn Protector>>,
    gater: Arc<dyn ConnectionGater>,
    manager: Arc<dyn ConnectionManager>,
    peer_store: Arc<dyn PeerStore>,
    metrics: Option<Arc<dyn Metrics>>,
    executor: Box<dyn Executor>,
    inbound_upgrade_timeout: Duration,
    max_negotiating_inbound_streams: usize,
}

impl UpgraderBuilder {
    /// 加密协议按注册顺序参与协商。
    pub fn with_encrypter(mut self, encrypter: Arc<dyn SecurityUpgrade>) -> Self {
        self.encrypters.push(encrypter);
        self
    }

    pub fn with_muxer(mut self, muxer: Arc<dyn StreamMuxerFactory>) -> Self {
        self.muxers.push(muxer);
        self
    }

    pub fn with_protector(mut self, protector: Arc<dyn Protector>) -> Self {
        self.protector = Some(protector);
        self
    }

    pub fn with_gater(mut self, gater: Arc<dyn ConnectionGater>) -> Self {
        self.gater = gater;
        self
    }

    pub fn with_connection_manager(mut self, manager: Arc<dyn ConnectionManager>) -> Self {
        self.manager = manager;
        self
    }

    pub fn with_peer_store(mut self, peer_store: Arc<dyn PeerStore>) -> Self {
        self.peer_store = peer_store;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_inbound_upgrade_timeout(mut self, timeout: Duration) -> Self {
        self.inbound_upgrade_timeout = timeout;
        self
    }

    pub fn with_max_negotiating_inbound_streams(mut self, count: usize) -> Self {
        self.max_negotiating_inbound_streams = count;
        self
    }

    pub fn build(self) -> (Upgrader, EventStream) {
        let (events, stream) = event_channel();
        (
            Upgrader {
                encrypters: self.encrypters,
                muxers: self.muxers,
                protector: self.protector,
                gater: self.gater,
                manager: self.manager,
                registrar: Arc::new(Registrar::new()),
                peer_store: self.peer_store,
                metrics: self.metrics,
                events,
                executor: self.executor,
                inbound_upgrade_timeout: self.inbound_upgrade_timeout,
                max_negotiating_inbound_streams: self.max_negotiating_inbound_streams,
            },
            stream,
        )
    }
}

/// 连接升级器。
///
/// 把原始传输连接升级为经过认证、加密和多路复用的对端连接：
/// 准入与拦截检查、可选的 PSK 保护、加密握手、复用器协商，最后装配
/// 连接对象并把进站流路由到注册的处理器。升级中的任何失败都会关闭
/// 底层连接。
pub struct Upgrader {
    encrypters: Vec<Arc<dyn SecurityUpgrade>>,
    muxers: Vec<Arc<dyn StreamMuxerFactory>>,
    protector: Option<Arc<dyn Protector>>,
    gater: Arc<dyn ConnectionGater>,
    manager: Arc<dyn ConnectionManager>,
    registrar: Arc<Registrar>,
    peer_store: Arc<dyn PeerStore>,
    metrics: Option<Arc<dyn Metrics>>,
    events: EventSender,
    executor: Box<dyn Executor>,
    inbound_upgrade_timeout: Duration,
    max_negotiating_inbound_streams: usize,
}

impl Upgrader {
    pub fn builder(executor: impl Executor + 'static) -> UpgraderBuilder {
        UpgraderBuilder {
            encrypters: Vec::new(),
            muxers: Vec::new(),
            protector: None,
            gater: Arc::new(AllowAll),
            manager: Arc::new(AcceptAll),
            peer_store: Arc::new(MemoryPeerStore::new()),
            metrics: None,
            executor: Box::new(executor),
            inbound_upgrade_timeout: INBOUND_UPGRADE_TIMEOUT,
            max_negotiating_inbound_streams: DEFAULT_MAX_NEGOTIATING_INBOUND_STREAMS,
        }
    }

    pub fn registrar(&self) -> &Arc<Registrar> {
        &self.registrar
    }

    pub fn peer_store(&self) -> &Arc<dyn PeerStore> {
        &self.peer_store
    }

    /// 升级一条进站连接。
    ///
    /// 整个升级受单个时限约束，超时后底层连接被中止。无论结果如何，
    /// 连接管理器的名额在返回前恰好释放一次。
    pub async fn upgrade_inbound(
        &self,
        conn: MultiaddrConnection,
        mut opts: UpgradeOpts,
    ) -> Result<Connection, UpgradeError> {
        let _guard = InboundUpgradeGuard::new(self.manager.clone());
        let remote_addr = conn.remote_addr().clone();
        let signal = opts.signal.take();

        let timeout = Delay::new(self.inbound_upgrade_timeout);
        let upgrade = Box::pin(self.perform_inbound(conn, opts));

        let result = match signal {
            Some(registration) => {
                match Abortable::new(future::select(upgrade, timeout), registration).await {
                    Ok(Either::Left((result, _))) => result,
                    Ok(Either::Right(((), upgrade))) => {
                        drop(upgrade);
                        Err(UpgradeError::Timeout)
                    }
                    Err(future::Aborted) => Err(UpgradeError::Aborted),
                }
            }
            None => match future::select(upgrade, timeout).await {
                Either::Left((result, _)) => result,
                Either::Right(((), upgrade)) => {
                    drop(upgrade);
                    Err(UpgradeError::Timeout)
                }
            },
        };

        if let Err(error) = &result {
            tracing::debug!(addr = %remote_addr, %error, "inbound upgrade failed");
        }
        result
    }

    /// 升级一条出站连接。时限由调用方通过 `signal` 提供。
    pub async fn upgrade_outbound(
        &self,
        conn: MultiaddrConnection,
        mut opts: UpgradeOpts,
    ) -> Result<Connection, UpgradeError> {
        let remote_addr = conn.remote_addr().clone();
        let signal = opts.signal.take();

        let upgrade = Box::pin(self.perform_outbound(conn, opts));
        let result = match signal {
            Some(registration) => match Abortable::new(upgrade, registration).await {
                Ok(result) => result,
                Err(future::Aborted) => Err(UpgradeError::Aborted),
            },
            None => upgrade.await,
        };

        if let Err(error) = &result {
            tracing::debug!(addr = %remote_addr, %error, "outbound upgrade failed");
        }
        result
    }

    async fn perform_inbound(
        &self,
        conn: MultiaddrConnection,
        opts: UpgradeOpts,
    ) -> Result<Connection, UpgradeError> {
        let remote_addr = conn.remote_addr().clone();

        if !self.manager.accept_incoming_connection(&remote_addr).await {
            return Err(UpgradeError::ConnectionDenied);
        }
        if self.gater.deny_inbound_connection(&remote_addr).await {
            return Err(UpgradeError::Intercepted {
                method: "deny_inbound_connection",
            });
        }

        if let Some(metrics) = &self.metrics {
            metrics.track_multiaddr_connection(Direction::Inbound, &remote_addr);
        }

        let timeline = conn.timeline().clone();
        let conn = self.protect(conn, &opts).await?;

        let (peer, encryption, stream) = if opts.skip_encryption {
            let peer = peer_from_multiaddr(&remote_addr).ok_or(UpgradeError::InvalidMultiaddr)?;
            (peer, SmolStr::new_static(NATIVE), BoxedStream::new(conn))
        } else {
            emit(&opts, UpgradeProgress::EncryptInboundConnection);
            self.encrypt_inbound(conn).await?
        };

        if self
            .gater
            .deny_inbound_encrypted_connection(&peer, &remote_addr)
            .await
        {
            return Err(UpgradeError::Intercepted {
                method: "deny_inbound_encrypted_connection",
            });
        }

        let (factory, stream) = self
            .select_muxer(stream, Direction::Inbound, &opts)
            .await?;

        if self
            .gater
            .deny_inbound_upgraded_connection(&peer, &remote_addr)
            .await
        {
            return Err(UpgradeError::Intercepted {
                method: "deny_inbound_upgraded_connection",
            });
        }

        Ok(self.assemble(
            peer,
            remote_addr,
            Direction::Inbound,
            encryption,
            factory,
            stream,
            timeline,
            opts,
        ))
    }

    async fn perform_outbound(
        &self,
        conn: MultiaddrConnection,
        opts: UpgradeOpts,
    ) -> Result<Connection, UpgradeError> {
        let remote_addr = conn.remote_addr().clone();
        let expected_peer = peer_from_multiaddr(&remote_addr).or(opts.remote_peer);

        // 不加密的连接必须事先知道对端身份，先于任何拦截检查
        if opts.skip_encryption && expected_peer.is_none() {
            let error = UpgradeError::InvalidPeerId;
            tracing::debug!(addr = %remote_addr, %error, "closing connection");
            let _ = conn.close().await;
            return Err(error);
        }

        if let Some(peer) = &expected_peer {
            if self.gater.deny_outbound_connection(peer, &remote_addr).await {
                let error = UpgradeError::Intercepted {
                    method: "deny_outbound_connection",
                };
                tracing::debug!(addr = %remote_addr, %error, "closing connection");
                let _ = conn.close().await;
                return Err(error);
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.track_multiaddr_connection(Direction::Outbound, &remote_addr);
        }

        let timeline = conn.timeline().clone();
        let conn = self.protect(conn, &opts).await?;

        let (peer, encryption, stream) = if opts.skip_encryption {
            let peer = expected_peer.expect("Peer id presence was checked above.");
            (peer, SmolStr::new_static(NATIVE), BoxedStream::new(conn))
        } else {
            emit(&opts, UpgradeProgress::EncryptOutboundConnection);
            self.encrypt_outbound(conn, expected_peer).await?
        };

        if self
            .gater
            .deny_outbound_encrypted_connection(&peer, &remote_addr)
            .await
        {
            return Err(UpgradeError::Intercepted {
                method: "deny_outbound_encrypted_connection",
            });
        }

        let (factory, stream) = self
            .select_muxer(stream, Direction::Outbound, &opts)
            .await?;

        if self
            .gater
            .deny_outbound_upgraded_connection(&peer, &remote_addr)
            .await
        {
            return Err(UpgradeError::Intercepted {
                method: "deny_outbound_upgraded_connection",
            });
        }

        Ok(self.assemble(
            peer,
            remote_addr,
            Direction::Outbound,
            encryption,
            factory,
            stream,
            timeline,
            opts,
        ))
    }

    async fn protect(
        &self,
        conn: MultiaddrConnection,
        opts: &UpgradeOpts,
    ) -> Result<MultiaddrConnection, UpgradeError> {
        match &self.protector {
            Some(protector) if !opts.skip_protection => Ok(protector.protect(conn).await?),
            _ => Ok(conn),
        }
    }

    async fn encrypt_inbound(
        &self,
        conn: MultiaddrConnection,
    ) -> Result<(PeerId, SmolStr, BoxedStream), UpgradeError> {
        let protocols: Vec<StreamProtocol> = self.encrypters.iter().map(|e| e.protocol()).collect();
        let (protocol, negotiated) = multistream_select::listener_select_proto(conn, protocols)
            .await
            .map_err(|error| UpgradeError::Encryption(error.to_string()))?;

        let encrypter = self.encrypter(&protocol)?;
        let (peer, stream) = encrypter
            .secure_inbound(BoxedStream::new(negotiated))
            .await
            .map_err(|error| UpgradeError::Encryption(error.to_string()))?;

        Ok((peer, SmolStr::new(protocol.as_ref()), stream))
    }

    async fn encrypt_outbound(
        &self,
        conn: MultiaddrConnection,
        remote: Option<PeerId>,
    ) -> Result<(PeerId, SmolStr, BoxedStream), UpgradeError> {
        let protocols: Vec<StreamProtocol> = self.encrypters.iter().map(|e| e.protocol()).collect();
        let (protocol, negotiated) =
            multistream_select::dialer_select_proto(conn, protocols, Version::V1)
                .await
                .map_err(|error| UpgradeError::Encryption(error.to_string()))?;

        let encrypter = self.encrypter(&protocol)?;
        let (peer, stream) = encrypter
            .secure_outbound(BoxedStream::new(negotiated), remote)
            .await
            .map_err(|error| UpgradeError::Encryption(error.to_string()))?;

        Ok((peer, SmolStr::new(protocol.as_ref()), stream))
    }

    fn encrypter(&self, protocol: &StreamProtocol) -> Result<&Arc<dyn SecurityUpgrade>, UpgradeError> {
        self.encrypters
            .iter()
            .find(|e| e.protocol() == *protocol)
            .ok_or_else(|| {
                UpgradeError::Encryption(format!("unknown security protocol `{protocol}`"))
            })
    }

    async fn select_muxer(
        &self,
        stream: BoxedStream,
        direction: Direction,
        opts: &UpgradeOpts,
    ) -> Result<(Option<Arc<dyn StreamMuxerFactory>>, BoxedStream), UpgradeError> {
        if let Some(factory) = &opts.muxer_factory {
            return Ok((Some(factory.clone()), stream));
        }
        // 没有配置复用器时连接保持未复用，无法打开流
        if self.muxers.is_empty() {
            return Ok((None, stream));
        }

        emit(
            opts,
            match direction {
                Direction::Inbound => UpgradeProgress::MultiplexInboundConnection,
                Direction::Outbound => UpgradeProgress::MultiplexOutboundConnection,
            },
        );

        let protocols: Vec<StreamProtocol> = self.muxers.iter().map(|m| m.protocol()).collect();
        let (protocol, negotiated) = match direction {
            Direction::Inbound => multistream_select::listener_select_proto(stream, protocols)
                .await
                .map_err(UpgradeError::MuxerUnavailable)?,
            Direction::Outbound => {
                multistream_select::dialer_select_proto(stream, protocols, Version::V1)
                    .await
                    .map_err(UpgradeError::MuxerUnavailable)?
            }
        };

        let factory = self
            .muxers
            .iter()
            .find(|m| m.protocol() == protocol)
            .cloned()
            .ok_or(UpgradeError::MuxerUnavailable(NegotiationError::Failed))?;

        Ok((Some(factory), BoxedStream::new(negotiated)))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        peer: PeerId,
        remote_addr: Multiaddr,
        direction: Direction,
        encryption: SmolStr,
        factory: Option<Arc<dyn StreamMuxerFactory>>,
        stream: BoxedStream,
        timeline: Arc<ConnectionTimeline>,
        opts: UpgradeOpts,
    ) -> Connection {
        timeline.record_upgraded();

        let id = ConnectionId::next();
        let (io, multiplexer) = match factory {
            Some(factory) => {
                let multiplexer = SmolStr::new(factory.protocol().as_ref());
                (
                    ConnectionIo::Muxed(factory.create_muxer(stream, direction)),
                    Some(multiplexer),
                )
            }
            None => (ConnectionIo::Raw(stream), None),
        };

        let shared = Arc::new(ConnectionShared::new(
            id,
            remote_addr,
            peer,
            direction,
            encryption,
            multiplexer,
            opts.limits,
            timeline,
        ));

        let (command_tx, command_rx) = mpsc::unbounded();
        let streams = StreamRegistry::new();
        let connection = Connection::new(shared.clone(), command_tx, streams.clone());

        // 打开事件先于任何流交付派发
        self.events
            .dispatch(ConnectionEvent::Opened(connection.clone()));

        let driver = Driver::new(
            connection.clone(),
            shared,
            io,
            command_rx,
            self.registrar.clone(),
            self.peer_store.clone(),
            self.metrics.clone(),
            self.events.clone(),
            streams,
            self.max_negotiating_inbound_streams,
        );

        let span = tracing::debug_span!(parent: tracing::Span::none(), "connection", %id, %peer, %direction);
        span.follows_from(tracing::Span::current());
        self.executor.exec(driver.run().instrument(span).boxed());

        connection
    }
}

fn emit(opts: &UpgradeOpts, progress: UpgradeProgress) {
    if let Some(on_progress) = &opts.on_progress {
        on_progress(progress);
    }
}

fn peer_from_multiaddr(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().last().and_then(|protocol| match protocol {
        Protocol::P2p(peer) => Some(peer),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ConnectionEvent, Status, StreamError, TokioExecutor,
        test_support::{
            RecordingGater, RecordingManager, connect_remote, maconn_pair, memory_conn,
            remote_secure_outbound,
        },
    };
    use futures::{AsyncReadExt, StreamExt};
    use libp2p_identity::Keypair;
    use std::sync::Mutex;

    fn upgrader_with(
        key: &Keypair,
        gater: Arc<RecordingGater>,
        manager: Arc<RecordingManager>,
    ) -> (Upgrader, EventStream) {
        Upgrader::builder(TokioExecutor)
            .with_encrypter(Arc::new(pyxis_plaintext::Config::new(key.public())))
            .with_muxer(Arc::new(pyxis_yamux::Factory::default()))
            .with_gater(gater)
            .with_connection_manager(manager)
            .build()
    }

    #[tokio::test]
    async fn inbound_upgrade_negotiates_security_and_muxer() {
        let gater = Arc::new(RecordingGater::default());
        let manager = Arc::new(RecordingManager::default());
        let server_key = Keypair::generate_ed25519();
        let (upgrader, mut events) = upgrader_with(&server_key, gater.clone(), manager.clone());

        let (conn, remote) = memory_conn("/ip4/127.0.0.1/tcp/4001");
        let client_key = Keypair::generate_ed25519();
        let client_peer = client_key.public().to_peer_id();
        let remote_task = tokio::spawn(async move { connect_remote(remote, &client_key).await });

        let connection = upgrader
            .upgrade_inbound(conn, UpgradeOpts::default())
            .await
            .unwrap();
        let _remote = remote_task.await.unwrap();

        assert_eq!(connection.direction(), Direction::Inbound);
        assert_eq!(connection.encryption(), "/plaintext/1.0.0");
        assert_eq!(connection.multiplexer(), Some("/yamux/1.0.0"));
        assert_eq!(connection.remote_peer(), client_peer);
        assert_eq!(connection.status(), Status::Open);
        assert!(connection.timeline().upgraded().is_some());

        assert_eq!(manager.accepted(), 1);
        assert_eq!(manager.released(), 1);
        assert_eq!(
            gater.calls(),
            vec![
                "deny_inbound_connection",
                "deny_inbound_encrypted_connection",
                "deny_inbound_upgraded_connection",
            ]
        );
        assert_eq!(gater.last_peer(), Some(client_peer));

        match events.next().await {
            Some(ConnectionEvent::Opened(opened)) => assert_eq!(opened.id(), connection.id()),
            other => panic!("expected open event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn outbound_upgrade_intercepted_before_any_bytes() {
        let gater = Arc::new(RecordingGater::denying("deny_outbound_connection"));
        let manager = Arc::new(RecordingManager::default());
        let server_key = Keypair::generate_ed25519();
        let (upgrader, _events) = upgrader_with(&server_key, gater.clone(), manager.clone());

        let remote_peer = Keypair::generate_ed25519().public().to_peer_id();
        let (conn, mut remote) = memory_conn(&format!("/ip4/127.0.0.1/tcp/4001/p2p/{remote_peer}"));

        let error = upgrader
            .upgrade_outbound(conn, UpgradeOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            UpgradeError::Intercepted {
                method: "deny_outbound_connection"
            }
        ));
        assert_eq!(gater.calls(), vec!["deny_outbound_connection"]);
        assert_eq!(gater.last_peer(), Some(remote_peer));

        // 原始传输已关闭
        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn inbound_upgrade_times_out() {
        let manager = Arc::new(RecordingManager::default());
        let server_key = Keypair::generate_ed25519();
        let (upgrader, _events) = Upgrader::builder(TokioExecutor)
            .with_encrypter(Arc::new(pyxis_plaintext::Config::new(server_key.public())))
            .with_connection_manager(manager.clone())
            .with_inbound_upgrade_timeout(Duration::from_millis(50))
            .build();

        // 对端保持沉默
        let (conn, _remote) = memory_conn("/ip4/127.0.0.1/tcp/4001");
        let error = upgrader
            .upgrade_inbound(conn, UpgradeOpts::default())
            .await
            .unwrap_err();

        assert!(matches!(error, UpgradeError::Timeout));
        assert_eq!(manager.released(), 1);
    }

    #[tokio::test]
    async fn inbound_upgrade_denied_by_connection_manager() {
        let gater = Arc::new(RecordingGater::default());
        let manager = Arc::new(RecordingManager::rejecting());
        let server_key = Keypair::generate_ed25519();
        let (upgrader, _events) = upgrader_with(&server_key, gater.clone(), manager.clone());

        let (conn, _remote) = memory_conn("/ip4/127.0.0.1/tcp/4001");
        let error = upgrader
            .upgrade_inbound(conn, UpgradeOpts::default())
            .await
            .unwrap_err();

        assert!(matches!(error, UpgradeError::ConnectionDenied));
        assert!(gater.calls().is_empty());
        assert_eq!(manager.released(), 1);
    }

    #[tokio::test]
    async fn inbound_gate_failure_stops_the_pipeline() {
        let gater = Arc::new(RecordingGater::denying("deny_inbound_encrypted_connection"));
        let manager = Arc::new(RecordingManager::default());
        let server_key = Keypair::generate_ed25519();
        let (upgrader, _events) = upgrader_with(&server_key, gater.clone(), manager.clone());

        let (conn, remote) = memory_conn("/ip4/127.0.0.1/tcp/4001");
        let client_key = Keypair::generate_ed25519();
        tokio::spawn(async move {
            let mut stream = remote_secure_outbound(remote, &client_key, None).await;
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf).await;
        });

        let error = upgrader
            .upgrade_inbound(conn, UpgradeOpts::default())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            UpgradeError::Intercepted {
                method: "deny_inbound_encrypted_connection"
            }
        ));
        assert_eq!(
            gater.calls(),
            vec![
                "deny_inbound_connection",
                "deny_inbound_encrypted_connection",
            ]
        );
        assert_eq!(manager.released(), 1);
    }

    #[tokio::test]
    async fn outbound_skip_encryption_requires_peer_id() {
        let gater = Arc::new(RecordingGater::default());
        let manager = Arc::new(RecordingManager::default());
        let server_key = Keypair::generate_ed25519();
        let (upgrader, _events) = upgrader_with(&server_key, gater.clone(), manager);

        let (conn, mut remote) = memory_conn("/ip4/127.0.0.1/tcp/4001");
        let error = upgrader
            .upgrade_outbound(
                conn,
                UpgradeOpts {
                    skip_encryption: true,
                    ..UpgradeOpts::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(error, UpgradeError::InvalidPeerId));
        // 没有任何拦截检查被调用
        assert!(gater.calls().is_empty());

        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn inbound_skip_encryption_requires_peer_in_addr() {
        let server_key = Keypair::generate_ed25519();
        let (upgrader, _events) = Upgrader::builder(TokioExecutor)
            .with_encrypter(Arc::new(pyxis_plaintext::Config::new(server_key.public())))
            .build();

        let (conn, _remote) = memory_conn("/ip4/127.0.0.1/tcp/4001");
        let error = upgrader
            .upgrade_inbound(
                conn,
                UpgradeOpts {
                    skip_encryption: true,
                    ..UpgradeOpts::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(error, UpgradeError::InvalidMultiaddr));
    }

    #[tokio::test]
    async fn unmultiplexed_connection_cannot_open_streams() {
        let (upgrader, mut events) = Upgrader::builder(TokioExecutor).build();

        let peer = Keypair::generate_ed25519().public().to_peer_id();
        let (conn, _remote) = memory_conn(&format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer}"));
        let connection = upgrader
            .upgrade_inbound(
                conn,
                UpgradeOpts {
                    skip_encryption: true,
                    ..UpgradeOpts::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(connection.encryption(), "native");
        assert_eq!(connection.multiplexer(), None);
        assert_eq!(connection.remote_peer(), peer);
        assert!(connection.get_streams().is_empty());

        let error = connection
            .new_stream(
                vec![StreamProtocol::new("/echo/1.0.0")],
                Default::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, StreamError::MuxerUnavailable));

        match events.next().await {
            Some(ConnectionEvent::Opened(_)) => {}
            other => panic!("expected open event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fires_one_event() {
        let (upgrader, mut events) = Upgrader::builder(TokioExecutor).build();

        let peer = Keypair::generate_ed25519().public().to_peer_id();
        let (conn, _remote) = memory_conn(&format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer}"));
        let connection = upgrader
            .upgrade_inbound(
                conn,
                UpgradeOpts {
                    skip_encryption: true,
                    ..UpgradeOpts::default()
                },
            )
            .await
            .unwrap();

        let (first, second, third) =
            tokio::join!(connection.close(), connection.close(), connection.close());
        first.unwrap();
        second.unwrap();
        third.unwrap();

        assert_eq!(connection.status(), Status::Closed);
        assert!(connection.timeline().close().is_some());

        // 再关闭和中止都是空操作
        connection.close().await.unwrap();
        connection.abort();

        match events.next().await {
            Some(ConnectionEvent::Opened(_)) => {}
            other => panic!("expected open event, got {other:?}"),
        }
        match events.next().await {
            Some(ConnectionEvent::Closed(closed)) => assert_eq!(closed.id(), connection.id()),
            other => panic!("expected close event, got {other:?}"),
        }
        assert!(events.try_next().is_err());
    }

    #[tokio::test]
    async fn protector_runs_before_encryption_unless_skipped() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingProtector(AtomicUsize);

        impl Protector for CountingProtector {
            fn protect(
                &self,
                conn: MultiaddrConnection,
            ) -> futures::future::BoxFuture<'static, std::io::Result<MultiaddrConnection>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                futures::future::ready(Ok(conn.map_io(|io| io))).boxed()
            }
        }

        let protector = Arc::new(CountingProtector(AtomicUsize::new(0)));
        let (upgrader, _events) = Upgrader::builder(TokioExecutor)
            .with_protector(protector.clone())
            .build();

        let peer = Keypair::generate_ed25519().public().to_peer_id();
        let (conn, _remote) = memory_conn(&format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer}"));
        upgrader
            .upgrade_inbound(
                conn,
                UpgradeOpts {
                    skip_encryption: true,
                    ..UpgradeOpts::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(protector.0.load(Ordering::SeqCst), 1);

        let (conn, _remote) = memory_conn(&format!("/ip4/127.0.0.1/tcp/4002/p2p/{peer}"));
        upgrader
            .upgrade_inbound(
                conn,
                UpgradeOpts {
                    skip_encryption: true,
                    skip_protection: true,
                    ..UpgradeOpts::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(protector.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn explicit_muxer_factory_skips_negotiation() {
        let server_key = Keypair::generate_ed25519();
        let (upgrader, _events) = Upgrader::builder(TokioExecutor)
            .with_encrypter(Arc::new(pyxis_plaintext::Config::new(server_key.public())))
            .build();

        let (conn, remote) = memory_conn("/ip4/127.0.0.1/tcp/4001");
        tokio::spawn(async move {
            let client_key = Keypair::generate_ed25519();
            let stream = remote_secure_outbound(remote, &client_key, None).await;
            let muxer =
                pyxis_yamux::Factory::default().create_muxer(stream, Direction::Outbound);
            crate::test_support::RemoteMuxer::spawn(muxer)
        });

        let connection = upgrader
            .upgrade_inbound(
                conn,
                UpgradeOpts {
                    muxer_factory: Some(Arc::new(pyxis_yamux::Factory::default())),
                    ..UpgradeOpts::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(connection.multiplexer(), Some("/yamux/1.0.0"));
    }

    #[tokio::test]
    async fn progress_events_are_emitted_in_stage_order() {
        let gater = Arc::new(RecordingGater::default());
        let manager = Arc::new(RecordingManager::default());
        let server_key = Keypair::generate_ed25519();
        let (upgrader, _events) = upgrader_with(&server_key, gater, manager);

        let (conn, remote) = memory_conn("/ip4/127.0.0.1/tcp/4001");
        let client_key = Keypair::generate_ed25519();
        let remote_task = tokio::spawn(async move { connect_remote(remote, &client_key).await });

        let progress: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = progress.clone();
        upgrader
            .upgrade_inbound(
                conn,
                UpgradeOpts {
                    on_progress: Some(Arc::new(move |event| {
                        sink.lock().unwrap().push(event.as_str());
                    })),
                    ..UpgradeOpts::default()
                },
            )
            .await
            .unwrap();
        let _remote = remote_task.await.unwrap();

        assert_eq!(
            *progress.lock().unwrap(),
            vec![
                "upgrader:encrypt-inbound-connection",
                "upgrader:multiplex-inbound-connection",
            ]
        );
    }

    #[tokio::test]
    async fn outbound_and_inbound_upgrades_interoperate() {
        let server_key = Keypair::generate_ed25519();
        let client_key = Keypair::generate_ed25519();
        let (server, _server_events) = Upgrader::builder(TokioExecutor)
            .with_encrypter(Arc::new(pyxis_plaintext::Config::new(server_key.public())))
            .with_muxer(Arc::new(pyxis_yamux::Factory::default()))
            .build();
        let (client, _client_events) = Upgrader::builder(TokioExecutor)
            .with_encrypter(Arc::new(pyxis_plaintext::Config::new(client_key.public())))
            .with_muxer(Arc::new(pyxis_yamux::Factory::default()))
            .build();

        let (server_conn, client_conn) = maconn_pair();
        let (inbound, outbound) = tokio::join!(
            server.upgrade_inbound(server_conn, UpgradeOpts::default()),
            client.upgrade_outbound(client_conn, UpgradeOpts::default()),
        );
        let inbound = inbound.unwrap();
        let outbound = outbound.unwrap();

        assert_eq!(inbound.remote_peer(), client_key.public().to_peer_id());
        assert_eq!(outbound.remote_peer(), server_key.public().to_peer_id());
        assert_eq!(outbound.direction(), Direction::Outbound);
        assert_eq!(outbound.multiplexer(), Some("/yamux/1.0.0"));
    }
}
