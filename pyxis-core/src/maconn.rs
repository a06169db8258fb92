use futures::{AsyncRead, AsyncWrite, AsyncWriteExt};
use multiaddr::Multiaddr;
use std::{
    fmt, io,
    pin::Pin,
    sync::{Arc, OnceLock},
    task::{Context, Poll},
    time::Instant,
};

use crate::BoxedStream;

/// 连接生命周期时间轴。
///
/// `close` 是一次性单元：第一次记录生效，之后的记录是空操作。
#[derive(Debug)]
pub struct ConnectionTimeline {
    open: Instant,
    upgraded: OnceLock<Instant>,
    close: OnceLock<Instant>,
}

impl ConnectionTimeline {
    pub(crate) fn new() -> Self {
        ConnectionTimeline {
            open: Instant::now(),
            upgraded: OnceLock::new(),
            close: OnceLock::new(),
        }
    }

    pub fn open(&self) -> Instant {
        self.open
    }

    pub fn upgraded(&self) -> Option<Instant> {
        self.upgraded.get().copied()
    }

    pub fn close(&self) -> Option<Instant> {
        self.close.get().copied()
    }

    /// Returns `true` on the first call only.
    pub fn record_upgraded(&self) -> bool {
        self.upgraded.set(Instant::now()).is_ok()
    }

    /// Returns `true` on the first call only.
    pub fn record_close(&self) -> bool {
        self.close.set(Instant::now()).is_ok()
    }
}

/// Records the close instant when the connection is torn down without a
/// graceful close having run.
struct CloseStamp(Arc<ConnectionTimeline>);

impl Drop for CloseStamp {
    fn drop(&mut self) {
        self.0.record_close();
    }
}

/// 传输层交给升级器的原始连接：带远端地址与时间轴的双向字节流。
///
/// 升级的每个阶段都包裹前一阶段的流，地址与时间轴保持不变。
pub struct MultiaddrConnection {
    io: BoxedStream,
    remote_addr: Multiaddr,
    timeline: Arc<ConnectionTimeline>,
    stamp: CloseStamp,
}

impl MultiaddrConnection {
    pub fn new<S>(io: S, remote_addr: Multiaddr) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let timeline = Arc::new(ConnectionTimeline::new());

        MultiaddrConnection {
            io: BoxedStream::new(io),
            remote_addr,
            stamp: CloseStamp(timeline.clone()),
            timeline,
        }
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    pub fn timeline(&self) -> &Arc<ConnectionTimeline> {
        &self.timeline
    }

    /// 在保留地址和时间轴的情况下替换底层流，例如套上一层 PSK 隧道。
    pub fn map_io<F, S>(self, f: F) -> Self
    where
        F: FnOnce(BoxedStream) -> S,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let MultiaddrConnection {
            io,
            remote_addr,
            timeline,
            stamp,
        } = self;

        MultiaddrConnection {
            io: BoxedStream::new(f(io)),
            remote_addr,
            timeline,
            stamp,
        }
    }

    /// Gracefully closes the connection, recording the close instant.
    pub async fn close(mut self) -> io::Result<()> {
        self.io.close().await
    }

    /// Tears the connection down without flushing.
    pub fn abort(self, error: &(dyn std::error::Error + 'static)) {
        tracing::debug!(addr = %self.remote_addr, %error, "aborting connection");
        drop(self);
    }
}

impl fmt::Debug for MultiaddrConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiaddrConnection")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for MultiaddrConnection {
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

impl AsyncWrite for MultiaddrConnection {
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
