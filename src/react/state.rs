//! 图状态与节点路由
//!
//! GraphState 只由状态机的节点转移修改；写入检查点后即不可变（新状态 = 新检查点）。
//! 路由是纯函数：只看状态本身决定下一个节点。

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;
use crate::memory::{Message, Role, ToolCall};

/// 状态机节点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// 用户输入已写入、尚未调用模型
    Input,
    LlmCall,
    ToolExec,
    MaxRounds,
    End,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Input => "input",
            NodeKind::LlmCall => "llm_call",
            NodeKind::ToolExec => "tool_exec",
            NodeKind::MaxRounds => "max_rounds",
            NodeKind::End => "end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphState {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub enabled_tools: BTreeSet<String>,
    pub max_tool_rounds: u32,
    pub round_count: u32,
    /// 按首次使用顺序去重
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub token_usage: TokenUsage,
}

impl GraphState {
    pub fn new(max_tool_rounds: u32) -> Self {
        Self {
            messages: Vec::new(),
            system_prompt: None,
            enabled_tools: BTreeSet::new(),
            max_tool_rounds,
            round_count: 0,
            tools_used: Vec::new(),
            token_usage: TokenUsage::default(),
        }
    }

    /// 在已有线程上开始新一轮：保留消息历史，重置本轮计数
    pub fn begin_turn(mut self) -> Self {
        self.round_count = 0;
        self.tools_used.clear();
        self.token_usage = TokenUsage::default();
        self
    }

    pub fn record_tool_used(&mut self, name: &str) {
        if !self.tools_used.iter().any(|t| t == name) {
            self.tools_used.push(name.to_string());
        }
    }

    /// 最后一条消息若是 assistant，返回其中尚未执行的工具调用
    pub fn pending_tool_calls(&self) -> &[ToolCall] {
        match self.messages.last() {
            Some(m) if m.role == Role::Assistant => &m.tool_calls,
            _ => &[],
        }
    }

    /// 最后一条 assistant 消息的文本
    pub fn last_assistant_content(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

/// LLM_CALL 之后的路由
///
/// 有工具调用且未达上限 → TOOL_EXEC；有工具调用但已达上限 → MAX_ROUNDS；否则 END。
pub fn route_after_llm(state: &GraphState) -> NodeKind {
    if state.pending_tool_calls().is_empty() {
        NodeKind::End
    } else if state.round_count < state.max_tool_rounds {
        NodeKind::ToolExec
    } else {
        NodeKind::MaxRounds
    }
}

/// 其余节点的固定转移
pub fn next_node(current: NodeKind, state: &GraphState) -> NodeKind {
    match current {
        NodeKind::Input => NodeKind::LlmCall,
        NodeKind::LlmCall => route_after_llm(state),
        NodeKind::ToolExec => NodeKind::LlmCall,
        NodeKind::MaxRounds | NodeKind::End => NodeKind::End,
    }
}
