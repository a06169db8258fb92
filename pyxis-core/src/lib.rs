mod connection;
mod io;
mod maconn;
mod protocol;

pub mod muxing;
pub mod security;

pub use connection::Direction;
pub use io::BoxedStream;
pub use maconn::{ConnectionTimeline, MultiaddrConnection};
pub use muxing::{StreamMuxer, StreamMuxerBox, StreamMuxerFactory};
pub use protocol::{InvalidProtocol, StreamProtocol};
pub use security::{Protector, SecurityError, SecurityUpgrade};

pub use libp2p_identity::PeerId;
pub use multiaddr::Multiaddr;
