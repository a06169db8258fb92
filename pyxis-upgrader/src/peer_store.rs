use fnv::{FnvHashMap, FnvHashSet};
use pyxis_core::{PeerId, StreamProtocol};
use std::sync::{Mutex, PoisonError};

/// 对端记录存储。
///
/// `merge_protocols` 是叠加且幂等的：重复协商同一协议不会产生重复条目。
/// 实现必须快速返回，不能阻塞调度线程；有持久化需求的存储应在内部转交。
pub trait PeerStore: Send + Sync + 'static {
    fn merge_protocols(&self, peer: &PeerId, protocols: &[StreamProtocol]);
}

#[derive(Debug, Default)]
pub struct MemoryPeerStore {
    records: Mutex<FnvHashMap<PeerId, FnvHashSet<StreamProtocol>>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        MemoryPeerStore::default()
    }

    pub fn protocols(&self, peer: &PeerId) -> Vec<StreamProtocol> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .map(|protocols| protocols.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl PeerStore for MemoryPeerStore {
    fn merge_protocols(&self, peer: &PeerId, protocols: &[StreamProtocol]) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(*peer)
            .or_default()
            .extend(protocols.iter().cloned());
    }
}
