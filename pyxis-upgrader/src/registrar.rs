use fnv::FnvHashMap;
use pyxis_core::StreamProtocol;
use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use crate::{Connection, connection::ProtocolStream};

/// 未显式配置时单条连接上每个协议的进站流上限。
pub const DEFAULT_MAX_INBOUND_STREAMS: usize = 32;
/// 未显式配置时单条连接上每个协议的出站流上限。
pub const DEFAULT_MAX_OUTBOUND_STREAMS: usize = 32;

/// 协商完成的进站流的处理器。
///
/// 处理器内部的错误由处理器自己负责，路由器不会因此拆掉连接。
pub trait StreamHandler: Send + Sync + 'static {
    fn on_stream(&self, stream: ProtocolStream, connection: Connection);
}

impl<F> StreamHandler for F
where
    F: Fn(ProtocolStream, Connection) + Send + Sync + 'static,
{
    fn on_stream(&self, stream: ProtocolStream, connection: Connection) {
        (self)(stream, connection)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerConfig {
    pub max_inbound_streams: Option<usize>,
    pub max_outbound_streams: Option<usize>,
    /// 限速连接只路由选择加入的处理器。
    pub run_on_limited_connection: bool,
}

#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<dyn StreamHandler>,
    pub config: HandlerConfig,
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("No handler registered for `{0}`")]
    UnhandledProtocol(StreamProtocol),
    #[error("Handler already registered for `{0}`")]
    DuplicateProtocol(StreamProtocol),
}

/// 协议到处理器的注册表。
///
/// 路由器在每条进站流到达时读取当前快照，注册与注销随时生效。
#[derive(Default)]
pub struct Registrar {
    handlers: RwLock<FnvHashMap<StreamProtocol, HandlerEntry>>,
}

impl Registrar {
    pub fn new() -> Self {
        Registrar::default()
    }

    pub fn register<H>(
        &self,
        protocol: StreamProtocol,
        handler: H,
        config: HandlerConfig,
    ) -> Result<(), RegistrarError>
    where
        H: StreamHandler,
    {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&protocol) {
            return Err(RegistrarError::DuplicateProtocol(protocol));
        }
        handlers.insert(
            protocol,
            HandlerEntry {
                handler: Arc::new(handler),
                config,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, protocol: &StreamProtocol) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(protocol)
            .is_some()
    }

    pub fn protocols(&self) -> Vec<StreamProtocol> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn get_handler(&self, protocol: &StreamProtocol) -> Result<HandlerEntry, RegistrarError> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(protocol)
            .cloned()
            .ok_or_else(|| RegistrarError::UnhandledProtocol(protocol.clone()))
    }

    /// 进站流上限；协议未注册时退回默认值。
    pub(crate) fn incoming_stream_limit(&self, protocol: &StreamProtocol) -> usize {
        match self.get_handler(protocol) {
            Ok(entry) => entry
                .config
                .max_inbound_streams
                .unwrap_or(DEFAULT_MAX_INBOUND_STREAMS),
            Err(RegistrarError::UnhandledProtocol(_)) => DEFAULT_MAX_INBOUND_STREAMS,
            Err(_) => DEFAULT_MAX_INBOUND_STREAMS,
        }
    }

    /// 出站流上限；注册表配置优先于调用方请求的上限。
    pub(crate) fn outgoing_stream_limit(
        &self,
        protocol: &StreamProtocol,
        requested: Option<usize>,
    ) -> usize {
        match self.get_handler(protocol) {
            Ok(entry) => entry
                .config
                .max_outbound_streams
                .or(requested)
                .unwrap_or(DEFAULT_MAX_OUTBOUND_STREAMS),
            Err(_) => requested.unwrap_or(DEFAULT_MAX_OUTBOUND_STREAMS),
        }
    }
}

impl fmt::Debug for Registrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrar")
            .field("protocols", &self.protocols())
            .finish()
    }
}
