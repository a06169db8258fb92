use std::pin::Pin;

/// 连接驱动任务的宿主执行器。
///
/// 升级器为每条装配完成的连接派生一个驱动任务，任务一直运行到连接
/// 完全关闭并派发关闭事件为止。同一个升级器被多个并发升级共享，
/// 任务从不可变引用派生，因此实现必须是 `Send + Sync`。
pub trait Executor: Send + Sync {
    #[track_caller]
    fn exec(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>);
}

impl<F> Executor for F
where
    F: Fn(Pin<Box<dyn Future<Output = ()> + Send>>) + Send + Sync,
{
    fn exec(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
        self(future)
    }
}

/// 把连接任务交给外围的 tokio 运行时。
///
/// 只能在运行时上下文内使用，否则 `tokio::spawn` 会 panic。
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioExecutor;

impl Executor for TokioExecutor {
    fn exec(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
        tracing::trace!("spawning connection task");
        tokio::spawn(future);
    }
}
