//! 对话消息模型
//!
//! 角色标记的消息序列；assistant 消息可携带工具调用，tool 消息通过 tool_call_id 引用对应调用。
//! 追加是普通的 push，外加 call id 引用检查。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// 模型提出的一次工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// 始终是 JSON object
    pub arguments: serde_json::Value,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn plain(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content.into())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content.into())
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content.into())
        }
    }

    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::plain(Role::Tool, content.into())
        }
    }
}

/// 追加消息；tool 消息必须引用此前某条 assistant 消息提出、且尚未被应答的调用
pub fn append_message(messages: &mut Vec<Message>, message: Message) -> Result<(), AgentError> {
    if message.role == Role::Tool {
        let call_id = message
            .tool_call_id
            .as_deref()
            .ok_or_else(|| AgentError::InvalidState("tool message without tool_call_id".into()))?;
        let proposed = messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .flat_map(|m| m.tool_calls.iter())
            .any(|c| c.id == call_id);
        if !proposed {
            return Err(AgentError::InvalidState(format!(
                "tool result references unknown call id {call_id}"
            )));
        }
        let answered = messages
            .iter()
            .any(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(call_id));
        if answered {
            return Err(AgentError::InvalidState(format!(
                "tool call {call_id} already has a result"
            )));
        }
    }
    messages.push(message);
    Ok(())
}

/// 组装发给模型的历史：去掉没有对应结果的工具调用（轮数上限、取消等留下的）
pub fn sanitize_for_model(messages: &[Message]) -> Vec<Message> {
    let answered: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    messages
        .iter()
        .map(|m| {
            if m.role == Role::Assistant && !m.tool_calls.is_empty() {
                let mut kept = m.clone();
                kept.tool_calls.retain(|c| answered.contains(c.id.as_str()));
                kept
            } else {
                m.clone()
            }
        })
        .collect()
}
