use futures::ready;
use pyxis_core::{
    BoxedStream, Direction, StreamProtocol,
    muxing::{StreamMuxer, StreamMuxerBox, StreamMuxerFactory},
};
use std::{
    collections::VecDeque,
    pin::Pin,
    task::{Context, Poll, Waker},
};

pub use yamux::{Config, Connection, ConnectionError, Mode, Stream};

const PROTOCOL_NAME: StreamProtocol = StreamProtocol::new("/yamux/1.0.0");

const MAX_BUFFERED_INBOUND_STREAMS: usize = 256;

/// 基于 yamux 的多路复用器工厂。
///
/// 进站连接作为 yamux 服务端，出站连接作为客户端。
#[derive(Debug, Clone, Default)]
pub struct Factory {
    config: Config,
}

impl Factory {
    pub fn new(config: Config) -> Self {
        Factory { config }
    }
}

impl StreamMuxerFactory for Factory {
    fn protocol(&self) -> StreamProtocol {
        PROTOCOL_NAME
    }

    fn create_muxer(&self, stream: BoxedStream, direction: Direction) -> StreamMuxerBox {
        let mode = match direction {
            Direction::Inbound => Mode::Server,
            Direction::Outbound => Mode::Client,
        };
        StreamMuxerBox::new(Muxer::new(Connection::new(stream, self.config.clone(), mode)))
    }
}

#[derive(Debug)]
pub struct Muxer {
    connection: Connection<BoxedStream>,
    inbound_stream_buffer: VecDeque<Stream>,
    inbound_stream_waker: Option<Waker>,
}

impl Muxer {
    pub fn new(connection: Connection<BoxedStream>) -> Self {
        Muxer {
            connection,
            inbound_stream_buffer: VecDeque::with_capacity(MAX_BUFFERED_INBOUND_STREAMS),
            inbound_stream_waker: None,
        }
    }
}

impl StreamMuxer for Muxer {
    type Substream = Stream;
    type Error = ConnectionError;

    fn poll_inbound(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>> {
        if let Some(stream) = self.inbound_stream_buffer.pop_front() {
            return Poll::Ready(Ok(stream));
        }
        self.inbound_stream_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn poll_outbound(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Self::Substream, Self::Error>> {
        self.as_mut().connection.poll_new_outbound(cx)
    }

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.as_mut().get_mut();
        let inbound_stream = ready!(this.connection.poll_next_inbound(cx))
            .ok_or(ConnectionError::Closed)??;

        if this.inbound_stream_buffer.len() >= MAX_BUFFERED_INBOUND_STREAMS {
            tracing::warn!(
                stream = %inbound_stream.id(),
                "inbound stream buffer is full, dropping stream"
            );
            drop(inbound_stream);
        } else {
            this.inbound_stream_buffer.push_back(inbound_stream);
            if let Some(waker) = this.inbound_stream_waker.take() {
                waker.wake();
            }
        }
        // 马上唤醒任务继续驱动
        cx.waker().wake_by_ref();
        Poll::Pending
    }

    #[tracing::instrument(level = "trace", name = "StreamMuxer::poll_close", skip(self, cx))]
    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.as_mut().connection.poll_close(cx)
    }
}
