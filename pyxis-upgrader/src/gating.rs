use futures::{FutureExt, future::BoxFuture};
use pyxis_core::{Multiaddr, PeerId};
use std::sync::Arc;

fn allow() -> BoxFuture<'static, bool> {
    futures::future::ready(false).boxed()
}

/// 在升级的固定检查点上否决连接的策略回调。
///
/// 所有方法都有放行的默认实现，未覆盖即允许。返回 `true` 表示拒绝，
/// 升级以命名该方法的拦截错误失败。
pub trait ConnectionGater: Send + Sync + 'static {
    fn deny_inbound_connection(&self, _remote_addr: &Multiaddr) -> BoxFuture<'static, bool> {
        allow()
    }

    fn deny_inbound_encrypted_connection(
        &self,
        _peer: &PeerId,
        _remote_addr: &Multiaddr,
    ) -> BoxFuture<'static, bool> {
        allow()
    }

    fn deny_inbound_upgraded_connection(
        &self,
        _peer: &PeerId,
        _remote_addr: &Multiaddr,
    ) -> BoxFuture<'static, bool> {
        allow()
    }

    fn deny_outbound_connection(
        &self,
        _peer: &PeerId,
        _remote_addr: &Multiaddr,
    ) -> BoxFuture<'static, bool> {
        allow()
    }

    fn deny_outbound_encrypted_connection(
        &self,
        _peer: &PeerId,
        _remote_addr: &Multiaddr,
    ) -> BoxFuture<'static, bool> {
        allow()
    }

    fn deny_outbound_upgraded_connection(
        &self,
        _peer: &PeerId,
        _remote_addr: &Multiaddr,
    ) -> BoxFuture<'static, bool> {
        allow()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ConnectionGater for AllowAll {}

/// 进站准入控制：接纳新连接并在升级结束后释放名额。
pub trait ConnectionManager: Send + Sync + 'static {
    fn accept_incoming_connection(&self, _remote_addr: &Multiaddr) -> BoxFuture<'static, bool> {
        futures::future::ready(true).boxed()
    }

    /// 每次进站升级结束后调用一次，无论成功与否。
    fn after_upgrade_inbound(&self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ConnectionManager for AcceptAll {}

/// Releases the inbound upgrade slot on every exit path.
pub(crate) struct InboundUpgradeGuard(Arc<dyn ConnectionManager>);

impl InboundUpgradeGuard {
    pub(crate) fn new(manager: Arc<dyn ConnectionManager>) -> Self {
        InboundUpgradeGuard(manager)
    }
}

impl Drop for InboundUpgradeGuard {
    fn drop(&mut self) {
        self.0.after_upgrade_inbound();
    }
}
