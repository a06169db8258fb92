use futures::{
    AsyncWrite, FutureExt, StreamExt,
    channel::{mpsc, oneshot},
    future::{self, Abortable, BoxFuture, Either},
    stream::FuturesUnordered,
};
use futures_timer::Delay;
use multistream_select::{NegotiationError, Negotiated, Version};
use pyxis_core::{
    BoxedStream, Direction, StreamProtocol,
    muxing::{Closing, StreamMuxerBox, StreamMuxerExt},
};
use smallvec::SmallVec;
use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use crate::{
    Metrics, PeerStore, Registrar, StreamError,
    connection::{
        Command, Connection, ConnectionIo, ConnectionShared, DEFAULT_PROTOCOL_SELECT_TIMEOUT,
        Status,
        stream::{ProtocolStream, StreamId, StreamRegistry},
    },
    events::{ConnectionEvent, EventSender},
};

type InboundNegotiation =
    BoxFuture<'static, Result<(StreamProtocol, Negotiated<BoxedStream>), NegotiationError>>;

struct OutboundRequest {
    protocols: Vec<StreamProtocol>,
    max_outbound_streams: Option<usize>,
    signal: Option<futures::future::AbortRegistration>,
    reply: oneshot::Sender<Result<ProtocolStream, StreamError>>,
}

struct OutboundNegotiation {
    reply: oneshot::Sender<Result<ProtocolStream, StreamError>>,
    max_outbound_streams: Option<usize>,
    result: Result<(StreamProtocol, Negotiated<BoxedStream>), StreamError>,
}

enum DriverIo {
    Muxed(StreamMuxerBox),
    Raw(BoxedStream),
    ClosingMuxer(Closing<StreamMuxerBox>),
    ClosingRaw(BoxedStream),
    Done,
}

/// 连接驱动任务。
///
/// 单个任务拥有复用器并串行处理所有命令、进站路由和出站协商，
/// 因此按协议计数与安装新流之间天然互斥。
pub(crate) struct Driver {
    connection: Connection,
    shared: Arc<ConnectionShared>,
    io: DriverIo,
    commands: mpsc::UnboundedReceiver<Command>,
    registrar: Arc<Registrar>,
    peer_store: Arc<dyn PeerStore>,
    metrics: Option<Arc<dyn Metrics>>,
    events: EventSender,
    streams: StreamRegistry,
    negotiating_in: FuturesUnordered<InboundNegotiation>,
    negotiating_out: FuturesUnordered<BoxFuture<'static, OutboundNegotiation>>,
    pending_outbound: VecDeque<OutboundRequest>,
    close_waiters: SmallVec<[oneshot::Sender<io::Result<()>>; 2]>,
    next_stream_id: u64,
    max_negotiating_inbound_streams: usize,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        connection: Connection,
        shared: Arc<ConnectionShared>,
        io: ConnectionIo,
        commands: mpsc::UnboundedReceiver<Command>,
        registrar: Arc<Registrar>,
        peer_store: Arc<dyn PeerStore>,
        metrics: Option<Arc<dyn Metrics>>,
        events: EventSender,
        streams: StreamRegistry,
        max_negotiating_inbound_streams: usize,
    ) -> Self {
        let io = match io {
            ConnectionIo::Muxed(muxer) => DriverIo::Muxed(muxer),
            ConnectionIo::Raw(stream) => DriverIo::Raw(stream),
        };

        Driver {
            connection,
            shared,
            io,
            commands,
            registrar,
            peer_store,
            metrics,
            events,
            streams,
            negotiating_in: FuturesUnordered::new(),
            negotiating_out: FuturesUnordered::new(),
            pending_outbound: VecDeque::new(),
            close_waiters: SmallVec::new(),
            next_stream_id: 1,
            max_negotiating_inbound_streams,
        }
    }

    pub(crate) async fn run(mut self) {
        future::poll_fn(|cx| self.poll(cx)).await;
        // 底层传输关闭已经完成，关闭事件只在这里派发一次
        self.events
            .dispatch(ConnectionEvent::Closed(self.connection.clone()));
    }

    #[tracing::instrument(level = "debug", name = "Connection::poll", skip(self, cx))]
    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            match self.commands.poll_next_unpin(cx) {
                Poll::Ready(Some(command)) => {
                    self.handle_command(command);
                    continue;
                }
                // 驱动自身持有一个句柄，通道不会关闭
                Poll::Ready(None) | Poll::Pending => {}
            }

            match &mut self.io {
                DriverIo::Done => {
                    self.shared.set_status(Status::Closed);
                    return Poll::Ready(());
                }
                DriverIo::ClosingMuxer(closing) => {
                    match Pin::new(closing).poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(result) => {
                            // 丢弃复用器同时关闭底层传输
                            self.io = DriverIo::Done;
                            self.shared.set_status(Status::Closed);
                            self.resolve_close_waiters(result);
                            return Poll::Ready(());
                        }
                    }
                }
                DriverIo::ClosingRaw(stream) => match Pin::new(stream).poll_close(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(result) => {
                        self.io = DriverIo::Done;
                        self.shared.set_status(Status::Closed);
                        self.resolve_close_waiters(result);
                        return Poll::Ready(());
                    }
                },
                DriverIo::Raw(_) => return Poll::Pending,
                DriverIo::Muxed(_) => {}
            }

            if let Poll::Ready(Some(negotiation)) = self.negotiating_out.poll_next_unpin(cx) {
                self.finish_outbound(negotiation);
                continue;
            }

            if let Poll::Ready(Some(result)) = self.negotiating_in.poll_next_unpin(cx) {
                self.route_inbound(result);
                continue;
            }

            let DriverIo::Muxed(muxer) = &mut self.io else {
                return Poll::Pending;
            };

            // 驱动复用器在底层连接上的 I/O
            match muxer.poll_unpin(cx) {
                Poll::Pending | Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(error)) => {
                    self.teardown(error);
                    return Poll::Ready(());
                }
            }

            if self.negotiating_in.len() < self.max_negotiating_inbound_streams {
                match muxer.poll_inbound_unpin(cx) {
                    Poll::Pending => {}
                    Poll::Ready(Ok(substream)) => {
                        self.spawn_inbound_negotiation(substream);
                        continue;
                    }
                    Poll::Ready(Err(error)) => {
                        self.teardown(error);
                        return Poll::Ready(());
                    }
                }
            }

            if !self.pending_outbound.is_empty() {
                match muxer.poll_outbound_unpin(cx) {
                    Poll::Pending => {}
                    Poll::Ready(Ok(substream)) => {
                        let request = self
                            .pending_outbound
                            .pop_front()
                            .expect("`pending_outbound` is not empty.");
                        self.spawn_outbound_negotiation(request, substream);
                        continue;
                    }
                    Poll::Ready(Err(error)) => {
                        self.teardown(error);
                        return Poll::Ready(());
                    }
                }
            }

            return Poll::Pending;
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::NewStream {
                protocols,
                opts,
                reply,
            } => {
                if self.shared.status() != Status::Open {
                    let _ = reply.send(Err(StreamError::ConnectionClosed));
                } else if !matches!(self.io, DriverIo::Muxed(_)) {
                    let _ = reply.send(Err(StreamError::MuxerUnavailable));
                } else {
                    self.pending_outbound.push_back(OutboundRequest {
                        protocols,
                        max_outbound_streams: opts.max_outbound_streams,
                        signal: opts.signal,
                        reply,
                    });
                }
            }
            Command::Close { reply } => match self.shared.status() {
                Status::Closed => {
                    let _ = reply.send(Ok(()));
                }
                Status::Closing => {
                    self.close_waiters.push(reply);
                }
                Status::Open => {
                    self.close_waiters.push(reply);
                    self.start_close();
                }
            },
            Command::Abort => self.abort_now(),
        }
    }

    fn start_close(&mut self) {
        tracing::debug!(connection = %self.shared.id, "closing connection");
        self.shared.set_status(Status::Closing);
        self.fail_negotiations();

        self.io = match std::mem::replace(&mut self.io, DriverIo::Done) {
            DriverIo::Muxed(muxer) => DriverIo::ClosingMuxer(muxer.close()),
            DriverIo::Raw(stream) => DriverIo::ClosingRaw(stream),
            other => other,
        };
    }

    fn abort_now(&mut self) {
        tracing::debug!(connection = %self.shared.id, "aborting connection");
        self.fail_negotiations();
        // 直接丢弃复用器，重置所有子流并拆掉底层传输
        self.io = DriverIo::Done;
        self.shared.set_status(Status::Closed);
        self.resolve_close_waiters(Ok(()));
    }

    fn teardown(&mut self, error: io::Error) {
        tracing::debug!(connection = %self.shared.id, %error, "connection failed");
        self.fail_negotiations();
        self.io = DriverIo::Done;
        self.shared.set_status(Status::Closed);
        self.resolve_close_waiters(Err(error));
    }

    /// 在途的协商全部丢弃，刚建出的子流随之重置。
    fn fail_negotiations(&mut self) {
        self.negotiating_in.clear();
        self.negotiating_out.clear();
        for request in self.pending_outbound.drain(..) {
            let _ = request.reply.send(Err(StreamError::ConnectionClosed));
        }
    }

    fn resolve_close_waiters(&mut self, result: io::Result<()>) {
        if let Err(error) = &result {
            tracing::debug!(connection = %self.shared.id, %error, "connection close failed");
        }
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(match &result {
                Ok(()) => Ok(()),
                Err(error) => Err(io::Error::new(error.kind(), error.to_string())),
            });
        }
    }

    fn spawn_inbound_negotiation(&mut self, substream: BoxedStream) {
        // 注册表按流到达时刻取快照
        let protocols = self.registrar.protocols();
        tracing::trace!(
            connection = %self.shared.id,
            count = protocols.len(),
            "negotiating inbound stream"
        );
        self.negotiating_in
            .push(multistream_select::listener_select_proto(substream, protocols).boxed());
    }

    fn route_inbound(
        &mut self,
        result: Result<(StreamProtocol, Negotiated<BoxedStream>), NegotiationError>,
    ) {
        let (protocol, io) = match result {
            Ok(negotiated) => negotiated,
            Err(error) => {
                tracing::debug!(connection = %self.shared.id, %error, "inbound stream negotiation failed");
                return;
            }
        };

        if let Err(error) = self.install_inbound(protocol.clone(), io) {
            tracing::debug!(
                connection = %self.shared.id,
                %protocol,
                %error,
                "dropping inbound stream"
            );
        }
    }

    fn install_inbound(
        &mut self,
        protocol: StreamProtocol,
        io: Negotiated<BoxedStream>,
    ) -> Result<(), StreamError> {
        let entry = self
            .registrar
            .get_handler(&protocol)
            .map_err(|_| StreamError::UnhandledProtocol(protocol.clone()))?;

        let limit = self.registrar.incoming_stream_limit(&protocol);
        let count = self.streams.count(&protocol, Direction::Inbound);
        if count >= limit {
            return Err(StreamError::TooManyInboundStreams { protocol, limit });
        }

        let stream = self.install_stream(protocol.clone(), Direction::Inbound, io);
        self.peer_store
            .merge_protocols(&self.shared.remote_peer, std::slice::from_ref(&protocol));

        if self.shared.limits.is_some() && !entry.config.run_on_limited_connection {
            return Err(StreamError::LimitedConnection(protocol));
        }

        entry.handler.on_stream(stream, self.connection.clone());
        Ok(())
    }

    fn finish_outbound(&mut self, negotiation: OutboundNegotiation) {
        let OutboundNegotiation {
            reply,
            max_outbound_streams,
            result,
        } = negotiation;

        let result = result.and_then(|(protocol, io)| {
            let limit = self
                .registrar
                .outgoing_stream_limit(&protocol, max_outbound_streams);
            let count = self.streams.count(&protocol, Direction::Outbound);
            if count >= limit {
                return Err(StreamError::TooManyOutboundStreams {
                    protocol,
                    count,
                    limit,
                });
            }

            self.peer_store
                .merge_protocols(&self.shared.remote_peer, std::slice::from_ref(&protocol));
            Ok(self.install_stream(protocol, Direction::Outbound, io))
        });

        if let Err(error) = &result {
            tracing::debug!(connection = %self.shared.id, %error, "outbound stream failed");
        }
        let _ = reply.send(result);
    }

    fn install_stream(
        &mut self,
        protocol: StreamProtocol,
        direction: Direction,
        io: Negotiated<BoxedStream>,
    ) -> ProtocolStream {
        let id = StreamId::new(self.next_stream_id);
        self.next_stream_id += 1;

        if let Some(metrics) = &self.metrics {
            metrics.track_protocol_stream(&protocol, direction, &self.shared.remote_peer);
        }
        tracing::trace!(
            connection = %self.shared.id,
            stream = %id,
            %protocol,
            %direction,
            "stream installed"
        );

        ProtocolStream::new(&self.streams, id, protocol, direction, io)
    }

    fn spawn_outbound_negotiation(&mut self, request: OutboundRequest, substream: BoxedStream) {
        let OutboundRequest {
            protocols,
            max_outbound_streams,
            signal,
            reply,
        } = request;

        let negotiation = async move {
            let select = Box::pin(multistream_select::dialer_select_proto(
                substream,
                protocols,
                Version::V1Lazy,
            ));

            let result = match signal {
                Some(registration) => match Abortable::new(select, registration).await {
                    Ok(Ok(negotiated)) => Ok(negotiated),
                    Ok(Err(error)) => Err(StreamError::Negotiation(error)),
                    Err(future::Aborted) => Err(StreamError::Aborted),
                },
                None => {
                    match future::select(select, Delay::new(DEFAULT_PROTOCOL_SELECT_TIMEOUT)).await
                    {
                        Either::Left((Ok(negotiated), _)) => Ok(negotiated),
                        Either::Left((Err(error), _)) => Err(StreamError::Negotiation(error)),
                        Either::Right(((), _)) => Err(StreamError::Timeout),
                    }
                }
            };

            OutboundNegotiation {
                reply,
                max_outbound_streams,
                result,
            }
        };

        self.negotiating_out.push(negotiation.boxed());
    }
}
