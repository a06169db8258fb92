use pyxis_core::{Direction, Multiaddr, PeerId, StreamProtocol};

/// 拨号事件计数标签。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialEvent {
    Connect,
    Error,
    Timeout,
    Abort,
}

impl DialEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialEvent::Connect => "connect",
            DialEvent::Error => "error",
            DialEvent::Timeout => "timeout",
            DialEvent::Abort => "abort",
        }
    }
}

/// 可选的指标采集钩子。所有方法默认空实现。
pub trait Metrics: Send + Sync + 'static {
    fn track_multiaddr_connection(&self, _direction: Direction, _remote_addr: &Multiaddr) {}

    fn track_protocol_stream(
        &self,
        _protocol: &StreamProtocol,
        _direction: Direction,
        _remote_peer: &PeerId,
    ) {
    }

    /// 供传输实现在拨号路径上打点。
    fn record_dial_event(&self, _event: DialEvent) {}
}
