pub use pyxis_core as core;

#[cfg(feature = "upgrader")]
pub use pyxis_upgrader as upgrader;

#[cfg(feature = "plaintext")]
pub use pyxis_plaintext as plaintext;

#[cfg(feature = "yamux")]
pub use pyxis_yamux as yamux;

pub use pyxis_core::{Multiaddr, MultiaddrConnection, PeerId, StreamProtocol};
