//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：工具错误在执行器内编码为结果，证据引用错误重试一次，其余错误终止本次运行。

use thiserror::Error;

/// 存储层错误（检查点 / 变量空间），核心层原样向上传播、不做重试
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 协作式取消（检查点边界处生效）
    #[error("Cancelled by user")]
    Cancelled,

    #[error("LLM error: {0}")]
    LlmError(String),

    /// 仅在 ToolExecutor 内部出现，离开执行器前总会被编码进 ToolResult
    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 规划 JSON / CoA JSON 无法解析
    #[error("Malformed model output: {0}")]
    MalformedOutput(String),

    /// CoA 证据引用在变量空间中找不到
    #[error("Evidence integrity error in task {task_id}: dangling refs {dangling:?}")]
    EvidenceIntegrity {
        task_id: String,
        dangling: Vec<String>,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// 消息序列违反 tool_call_id 引用约束
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 事件流中 error 事件使用的稳定标签
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Cancelled => "user_abort",
            AgentError::LlmError(_) => "provider_error",
            AgentError::ToolExecutionFailed(_) | AgentError::ToolTimeout(_) => {
                "tool_execution_error"
            }
            AgentError::MalformedOutput(_) => "malformed_model_output",
            AgentError::EvidenceIntegrity { .. } => "evidence_integrity",
            AgentError::Storage(_) => "storage_error",
            AgentError::InvalidState(_) => "invalid_state",
            AgentError::ConfigError(_) => "config_error",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 附加提示后重跑同一任务
    RetryWithPrompt(String),
    /// 终止当前运行
    Abort,
}
