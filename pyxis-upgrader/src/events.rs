use futures::channel::mpsc;
use std::{fmt, sync::Arc};

use crate::Connection;

/// 连接生命周期事件。
///
/// `Opened` 在连接装配完成后、任何流交付之前派发一次；`Closed` 在底层
/// 传输关闭完成后恰好派发一次。
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Opened(Connection),
    Closed(Connection),
}

pub type EventStream = mpsc::UnboundedReceiver<ConnectionEvent>;

#[derive(Clone)]
pub(crate) struct EventSender(mpsc::UnboundedSender<ConnectionEvent>);

impl EventSender {
    pub(crate) fn dispatch(&self, event: ConnectionEvent) {
        // 没有订阅者时事件被丢弃
        let _ = self.0.unbounded_send(event);
    }
}

pub(crate) fn event_channel() -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::unbounded();
    (EventSender(tx), rx)
}

/// 升级各阶段的进度通知。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeProgress {
    EncryptInboundConnection,
    EncryptOutboundConnection,
    MultiplexInboundConnection,
    MultiplexOutboundConnection,
}

impl UpgradeProgress {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeProgress::EncryptInboundConnection => "upgrader:encrypt-inbound-connection",
            UpgradeProgress::EncryptOutboundConnection => "upgrader:encrypt-outbound-connection",
            UpgradeProgress::MultiplexInboundConnection => "upgrader:multiplex-inbound-connection",
            UpgradeProgress::MultiplexOutboundConnection => {
                "upgrader:multiplex-outbound-connection"
            }
        }
    }
}

impl fmt::Display for UpgradeProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ProgressCallback = Arc<dyn Fn(UpgradeProgress) + Send + Sync>;
