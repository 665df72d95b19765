//! 核心层：错误分类与恢复策略、有界并发工作池、按配置装配的构建器

pub mod builder;
pub mod error;
pub mod recovery;
pub mod worker_pool;

pub use builder::{AgentBuilder, HiveRuntime};
pub use error::{AgentError, RecoveryAction, StorageError};
pub use recovery::{evidence_retry_addendum, RecoveryEngine, DEFAULT_MAX_ATTEMPTS};
pub use worker_pool::{WorkOutcome, WorkerPanic, WorkerPool};
