use futures::{AsyncRead, AsyncWrite};
use pin_project::pin_project;
use std::{
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{BoxedStream, Direction, StreamProtocol};

/// 升级完成的连接之下的多路复用器。
///
/// 连接驱动任务独占复用器并在一个轮询循环里使用它：[`StreamMuxer::poll`]
/// 在加密连接上搬运字节，[`StreamMuxer::poll_inbound`] 把对端打开的子流
/// 交给流路由器，[`StreamMuxer::poll_outbound`] 服务本端的开流请求。
/// 任何方法返回错误都意味着整条连接失效，驱动任务随即拆线。
pub trait StreamMuxer {
    type Substream: AsyncRead + AsyncWrite;
    type Error: std::error::Error;

    /// 驱动底层连接上的 I/O。实现应在取得进展后安排唤醒；
    /// 没有事件时返回 `Pending`。
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;

    /// 下一条由对端打开的子流。子流交出后即归路由器处置。
    fn poll_inbound(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>>;

    /// 打开一条新的本端子流。
    fn poll_outbound(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>>;

    /// 优雅关闭：通知对端并排空尚未写出的帧。
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;
}

/// 按协议名称在运行时选择的多路复用器工厂。
///
/// 每条连接调用一次 `create_muxer`，消耗加密后的流。
pub trait StreamMuxerFactory: Send + Sync + 'static {
    fn protocol(&self) -> StreamProtocol;

    fn create_muxer(&self, stream: BoxedStream, direction: Direction) -> StreamMuxerBox;
}

/// 按值持有复用器的驱动循环所用的便捷方法。
///
/// 驱动任务把复用器存成普通字段，这里统一加 [`Unpin`] 约束，
/// 省掉每个调用点的手动 `Pin::new`。
pub trait StreamMuxerExt: StreamMuxer + Unpin + Sized {
    fn poll_unpin(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(self).poll(cx)
    }

    fn poll_inbound_unpin(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>> {
        Pin::new(self).poll_inbound(cx)
    }

    fn poll_outbound_unpin(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>> {
        Pin::new(self).poll_outbound(cx)
    }

    /// 消费复用器，返回驱动优雅关闭的 future。
    fn close(self) -> Closing<Self> {
        Closing(self)
    }
}

impl<S> StreamMuxerExt for S where S: StreamMuxer + Unpin {}

/// 正在关闭的复用器。
///
/// 完成（无论成败）后丢弃它，底层传输随之关闭。
pub struct Closing<S>(S);

impl<S> Future for Closing<S>
where
    S: StreamMuxer + Unpin,
{
    type Output = Result<(), S::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().0).poll_close(cx)
    }
}

pub struct StreamMuxerBox {
    inner: Pin<Box<dyn StreamMuxer<Substream = BoxedStream, Error = io::Error> + Send>>,
}

impl fmt::Debug for StreamMuxerBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMuxerBox").finish_non_exhaustive()
    }
}

impl StreamMuxerBox {
    pub fn new<T>(muxer: T) -> StreamMuxerBox
    where
        T: StreamMuxer + Send + 'static,
        T::Substream: Send + 'static,
        T::Error: Send + Sync + 'static,
    {
        StreamMuxerBox {
            inner: Box::pin(Wrap { inner: muxer }),
        }
    }
}

impl StreamMuxer for StreamMuxerBox {
    type Substream = BoxedStream;
    type Error = io::Error;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().inner.as_mut().poll(cx)
    }

    fn poll_inbound(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>> {
        self.get_mut().inner.as_mut().poll_inbound(cx)
    }

    fn poll_outbound(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>> {
        self.get_mut().inner.as_mut().poll_outbound(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().inner.as_mut().poll_close(cx)
    }
}

#[pin_project]
struct Wrap<T>
where
    T: StreamMuxer,
{
    #[pin]
    inner: T,
}

impl<T> StreamMuxer for Wrap<T>
where
    T: StreamMuxer + Send + 'static,
    T::Substream: Send + 'static,
    T::Error: Send + Sync + 'static,
{
    type Substream = BoxedStream;
    type Error = io::Error;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll(cx).map_err(io::Error::other)
    }

    fn poll_inbound(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>> {
        self.project()
            .inner
            .poll_inbound(cx)
            .map_ok(BoxedStream::new)
            .map_err(io::Error::other)
    }

    fn poll_outbound(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>> {
        self.project()
            .inner
            .poll_outbound(cx)
            .map_ok(BoxedStream::new)
            .map_err(io::Error::other)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx).map_err(io::Error::other)
    }
}
