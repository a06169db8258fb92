use futures::{AsyncRead, AsyncWrite, AsyncWriteExt};
use multistream_select::Negotiated;
use pyxis_core::{BoxedStream, Direction, StreamProtocol};
use std::{
    fmt, io,
    pin::Pin,
    sync::{Arc, Mutex, OnceLock, PoisonError, Weak},
    task::{Context, Poll},
    time::Instant,
};

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    pub(crate) fn new(id: u64) -> Self {
        StreamId(id)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 流生命周期时间轴。
#[derive(Debug)]
pub struct StreamTimeline {
    open: Instant,
    close: OnceLock<Instant>,
}

impl StreamTimeline {
    fn new() -> Self {
        StreamTimeline {
            open: Instant::now(),
            close: OnceLock::new(),
        }
    }

    pub fn open(&self) -> Instant {
        self.open
    }

    pub fn close(&self) -> Option<Instant> {
        self.close.get().copied()
    }

    fn record_close(&self) -> bool {
        self.close.set(Instant::now()).is_ok()
    }
}

/// 存活性令牌：每条流持有一个 `Arc`，注册表只持有 `Weak`。
/// 流被丢弃时计数自动消失。
#[derive(Debug)]
pub(crate) struct StreamToken {
    id: StreamId,
    protocol: StreamProtocol,
    direction: Direction,
}

/// 存活流的描述。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: StreamId,
    pub protocol: StreamProtocol,
    pub direction: Direction,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StreamRegistry {
    entries: Arc<Mutex<Vec<Weak<StreamToken>>>>,
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        StreamRegistry::default()
    }

    fn insert(&self, token: &Arc<StreamToken>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|entry| entry.strong_count() > 0);
        entries.push(Arc::downgrade(token));
    }

    pub(crate) fn count(&self, protocol: &StreamProtocol, direction: Direction) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|token| token.direction == direction && token.protocol == *protocol)
            .count()
    }

    pub(crate) fn snapshot(&self) -> Vec<StreamInfo> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .map(|token| StreamInfo {
                id: token.id,
                protocol: token.protocol.clone(),
                direction: token.direction,
            })
            .collect()
    }
}

/// 协商完协议的多路复用子流。
///
/// 包装的 `Negotiated` 流携带协商期间缓冲的早期数据，是这条流的
/// 规范读写端。
pub struct ProtocolStream {
    token: Arc<StreamToken>,
    timeline: StreamTimeline,
    io: Negotiated<BoxedStream>,
}

impl ProtocolStream {
    pub(crate) fn new(
        registry: &StreamRegistry,
        id: StreamId,
        protocol: StreamProtocol,
        direction: Direction,
        io: Negotiated<BoxedStream>,
    ) -> Self {
        let token = Arc::new(StreamToken {
            id,
            protocol,
            direction,
        });
        registry.insert(&token);

        ProtocolStream {
            token,
            timeline: StreamTimeline::new(),
            io,
        }
    }

    pub fn id(&self) -> StreamId {
        self.token.id
    }

    pub fn protocol(&self) -> &StreamProtocol {
        &self.token.protocol
    }

    pub fn direction(&self) -> Direction {
        self.token.direction
    }

    pub fn timeline(&self) -> &StreamTimeline {
        &self.timeline
    }

    /// 关闭写半边并刷出缓冲数据，记录关闭时间。
    pub async fn close(&mut self) -> io::Result<()> {
        AsyncWriteExt::close(self).await
    }

    /// 立刻重置流。
    pub fn abort(self) {
        tracing::debug!(stream = %self.token.id, protocol = %self.token.protocol, "aborting stream");
        drop(self);
    }
}

impl Drop for ProtocolStream {
    fn drop(&mut self) {
        self.timeline.record_close();
    }
}

impl fmt::Debug for ProtocolStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolStream")
            .field("id", &self.token.id)
            .field("protocol", &self.token.protocol)
            .field("direction", &self.token.direction)
            .finish()
    }
}

impl AsyncRead for ProtocolStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }

    fn poll_read_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &mut [io::IoSliceMut<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_read_vectored(cx, bufs)
    }
}

impl AsyncWrite for ProtocolStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write_vectored(cx, bufs)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        futures::ready!(Pin::new(&mut this.io).poll_close(cx))?;
        this.timeline.record_close();
        Poll::Ready(Ok(()))
    }
}
