//! 错误恢复引擎
//!
//! 根据 AgentError 与当前尝试次数返回 RecoveryAction：只有证据引用悬空会触发一次带引导提示的重试。

use crate::core::{AgentError, RecoveryAction};

/// 默认总尝试次数（首次 + 一次引导重试）
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// attempt 从 1 开始计数
    pub fn handle(&self, err: &AgentError, attempt: u32, max_attempts: u32) -> RecoveryAction {
        match err {
            AgentError::EvidenceIntegrity { dangling, .. } if attempt < max_attempts => {
                RecoveryAction::RetryWithPrompt(evidence_retry_addendum(dangling))
            }
            _ => RecoveryAction::Abort,
        }
    }
}

/// 第二次尝试时拼到 system prompt 末尾的强化约束
pub fn evidence_retry_addendum(dangling: &[String]) -> String {
    format!(
        "IMPORTANT: your previous answer cited evidence refs that do not exist in the variable \
         space: {}. Every evidence item whose source is not \"llm\" must carry a `ref` that is an \
         existing variable key. Copy the ref verbatim from a tool result or the variable \
         directory. If you do not have one yet, keep calling tools (and store results with \
         var_set) until you do.",
        dangling.join(", ")
    )
}
