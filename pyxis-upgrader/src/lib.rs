mod error;
mod events;
mod executor;
mod gating;
mod metrics;
mod peer_store;
mod registrar;
mod upgrader;

pub mod connection;

pub use connection::{
    Connection, ConnectionId, ConnectionLimits, DEFAULT_PROTOCOL_SELECT_TIMEOUT, NewStreamOpts,
    ProtocolStream, Status, StreamId, StreamInfo,
};
pub use error::{StreamError, UpgradeError};
pub use events::{ConnectionEvent, EventStream, ProgressCallback, UpgradeProgress};
pub use executor::{Executor, TokioExecutor};
pub use gating::{AcceptAll, AllowAll, ConnectionGater, ConnectionManager};
pub use metrics::{DialEvent, Metrics};
pub use peer_store::{MemoryPeerStore, PeerStore};
pub use registrar::{
    DEFAULT_MAX_INBOUND_STREAMS, DEFAULT_MAX_OUTBOUND_STREAMS, HandlerConfig, HandlerEntry,
    Registrar, RegistrarError, StreamHandler,
};
pub use upgrader::{INBOUND_UPGRADE_TIMEOUT, UpgradeOpts, Upgrader, UpgraderBuilder};

#[cfg(test)]
mod test_support;
