//! Hive - 工具调用 Agent 运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、有界并发工作池、运行时构建器
//! - **llm**: 流式模型调用接口、用量探测、Mock 客户端
//! - **memory**: 对话消息、检查点存储、会话变量空间、SQLite 持久化
//! - **observability**: tracing 初始化
//! - **react**: 工具调用状态机（检查点、历史、分叉、事件流）
//! - **research**: 规划 + 并发分析 + 证据校验的研究编排
//! - **tools**: 工具目录、执行器、变量工具

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod research;
pub mod tools;

pub use crate::core::{AgentBuilder, AgentError, HiveRuntime, StorageError, WorkerPool};
pub use crate::memory::VariableSpace;
pub use crate::react::{AgentStateMachine, AgentTurn, EventSink, StreamEvent, TurnOutcome};
pub use crate::research::{ResearchOrchestrator, ResearchRequest};
