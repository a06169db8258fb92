mod driver;
mod stream;

pub use stream::{ProtocolStream, StreamId, StreamInfo, StreamTimeline};

pub(crate) use driver::Driver;
pub(crate) use stream::StreamRegistry;

use futures::{
    channel::{mpsc, oneshot},
    future::AbortRegistration,
};
use pyxis_core::{
    BoxedStream, ConnectionTimeline, Direction, Multiaddr, PeerId, StreamProtocol,
    muxing::StreamMuxerBox,
};
use smol_str::SmolStr;
use std::{
    fmt, io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::StreamError;

static NEXT_CONNECTION_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionId(usize);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 未提供取消信号时协议选择的默认时限。
pub const DEFAULT_PROTOCOL_SELECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Open,
    Closing,
    Closed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Open => f.write_str("open"),
            Status::Closing => f.write_str("closing"),
            Status::Closed => f.write_str("closed"),
        }
    }
}

/// 上游施加的限速连接配额。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub bytes: Option<u64>,
    pub seconds: Option<u64>,
}

/// `Connection::new_stream` 的选项。
#[derive(Debug, Default)]
pub struct NewStreamOpts {
    /// 调用方请求的出站上限；注册表配置优先。
    pub max_outbound_streams: Option<usize>,
    /// 协议选择的取消信号；缺省时套用
    /// [`DEFAULT_PROTOCOL_SELECT_TIMEOUT`]。
    pub signal: Option<AbortRegistration>,
}

pub(crate) enum Command {
    NewStream {
        protocols: Vec<StreamProtocol>,
        opts: NewStreamOpts,
        reply: oneshot::Sender<Result<ProtocolStream, StreamError>>,
    },
    Close {
        reply: oneshot::Sender<io::Result<()>>,
    },
    Abort,
}

/// 装配好的连接交给驱动任务的 I/O 半边。
pub(crate) enum ConnectionIo {
    Muxed(StreamMuxerBox),
    Raw(BoxedStream),
}

pub(crate) struct ConnectionShared {
    pub(crate) id: ConnectionId,
    pub(crate) remote_addr: Multiaddr,
    pub(crate) remote_peer: PeerId,
    pub(crate) direction: Direction,
    pub(crate) encryption: SmolStr,
    pub(crate) multiplexer: Option<SmolStr>,
    pub(crate) limits: Option<ConnectionLimits>,
    pub(crate) timeline: Arc<ConnectionTimeline>,
    status: Mutex<Status>,
}

impl ConnectionShared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ConnectionId,
        remote_addr: Multiaddr,
        remote_peer: PeerId,
        direction: Direction,
        encryption: SmolStr,
        multiplexer: Option<SmolStr>,
        limits: Option<ConnectionLimits>,
        timeline: Arc<ConnectionTimeline>,
    ) -> Self {
        ConnectionShared {
            id,
            remote_addr,
            remote_peer,
            direction,
            encryption,
            multiplexer,
            limits,
            timeline,
            status: Mutex::new(Status::Open),
        }
    }

    pub(crate) fn status(&self) -> Status {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_status(&self, status: Status) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

/// 升级完成后的连接句柄。
///
/// 句柄可廉价克隆，操作通过命令通道交给驱动任务串行执行。
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
    commands: mpsc::UnboundedSender<Command>,
    streams: StreamRegistry,
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<ConnectionShared>,
        commands: mpsc::UnboundedSender<Command>,
        streams: StreamRegistry,
    ) -> Self {
        Connection {
            shared,
            commands,
            streams,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.shared.remote_addr
    }

    pub fn remote_peer(&self) -> PeerId {
        self.shared.remote_peer
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    /// 协商出的加密协议名称；跳过加密时为 `native`。
    pub fn encryption(&self) -> &str {
        self.shared.encryption.as_str()
    }

    /// 协商出的多路复用协议名称；未安装复用器时为 `None`。
    pub fn multiplexer(&self) -> Option<&str> {
        self.shared.multiplexer.as_deref()
    }

    pub fn limits(&self) -> Option<ConnectionLimits> {
        self.shared.limits
    }

    pub fn timeline(&self) -> &Arc<ConnectionTimeline> {
        &self.shared.timeline
    }

    /// 当前存活流的快照。
    pub fn get_streams(&self) -> Vec<StreamInfo> {
        self.streams.snapshot()
    }

    /// 打开一条新的出站流并按偏好顺序协商协议。
    pub async fn new_stream(
        &self,
        protocols: Vec<StreamProtocol>,
        opts: NewStreamOpts,
    ) -> Result<ProtocolStream, StreamError> {
        if self.shared.multiplexer.is_none() {
            return Err(StreamError::MuxerUnavailable);
        }
        if self.status() != Status::Open {
            return Err(StreamError::ConnectionClosed);
        }

        let (reply, result) = oneshot::channel();
        self.commands
            .unbounded_send(Command::NewStream {
                protocols,
                opts,
                reply,
            })
            .map_err(|_| StreamError::ConnectionClosed)?;
        result.await.map_err(|_| StreamError::ConnectionClosed)?
    }

    /// 优雅关闭：先关闭复用器，再关闭底层传输。幂等。
    pub async fn close(&self) -> io::Result<()> {
        if self.status() == Status::Closed {
            return Ok(());
        }

        let (reply, result) = oneshot::channel();
        if self
            .commands
            .unbounded_send(Command::Close { reply })
            .is_err()
        {
            // 驱动任务已退出，连接已关闭
            return Ok(());
        }
        match result.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }

    /// 立刻拆掉连接，不等待在途数据。
    pub fn abort(&self) {
        let _ = self.commands.unbounded_send(Command::Abort);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("remote_peer", &self.shared.remote_peer)
            .field("direction", &self.shared.direction)
            .field("status", &self.status())
            .finish()
    }
}
