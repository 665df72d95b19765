//! 有界并发工作池
//!
//! FIFO 队列 + Semaphore：最多 N 个条目同时运行；条目 panic 不影响队列中其余条目；
//! 许可在条目完全结束后才释放，并立即唤醒队首等待者（tokio Semaphore 公平排队）。

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::Semaphore;

/// 单个条目的执行结果：正常返回值或 panic 信息
pub type WorkOutcome<R> = Result<R, WorkerPanic>;

/// 条目执行过程中 panic 的描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPanic(pub String);

impl std::fmt::Display for WorkerPanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker panicked: {}", self.0)
    }
}

/// 工作池：研究编排与批量生成共用
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    /// concurrency <= 0 时按 1 处理
    pub fn new(concurrency: i64) -> Self {
        Self {
            concurrency: concurrency.max(1) as usize,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// 实际生效的并发度：不超过条目数
    pub fn effective_concurrency(&self, item_count: usize) -> usize {
        self.concurrency.min(item_count.max(1))
    }

    /// 按提交顺序排队执行全部条目，结果与输入一一对应（按输入顺序返回）
    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, worker: F) -> Vec<WorkOutcome<R>>
    where
        F: Fn(usize, T) -> Fut,
        Fut: Future<Output = R>,
    {
        let slots = self.effective_concurrency(items.len());
        let semaphore = Semaphore::new(slots);
        let semaphore = &semaphore;
        tracing::debug!(items = items.len(), slots, "worker pool started");

        let jobs = items.into_iter().enumerate().map(|(index, item)| {
            let job = worker(index, item);
            async move {
                // 信号量在本函数内从不 close，acquire 只会成功
                let _permit = semaphore.acquire().await;
                let outcome = AssertUnwindSafe(job).catch_unwind().await;
                outcome.map_err(|payload| {
                    let reason = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::warn!(index, reason = %reason, "worker item panicked");
                    WorkerPanic(reason)
                })
            }
        });

        join_all(jobs).await
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(3)
    }
}
