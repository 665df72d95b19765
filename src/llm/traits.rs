//! LLM 客户端抽象
//!
//! 后端实现 LlmClient::stream_chat：给定消息与可用工具，返回分块流。
//! 每个分块可带部分文本、零或多个工具调用提议、以及形状不定的 usage 负载。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::memory::Message;

/// 提供给模型的工具描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// 流中的一次工具调用提议；同一调用可能被重复发送
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    /// JSON object，或编码为字符串的 JSON object
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// 流式分块
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelChunk {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDelta>,
    /// 原样透传后端的 usage 负载，由 llm::usage 探测
    #[serde(default)]
    pub usage: Option<serde_json::Value>,
}

impl ModelChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool_call(id: Option<&str>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            tool_calls: vec![ToolCallDelta {
                id: id.map(String::from),
                name: name.into(),
                arguments,
            }],
            ..Self::default()
        }
    }

    pub fn usage(usage: serde_json::Value) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, String>> + Send>>;

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 流式调用；tools 为空表示本轮不提供工具
    async fn stream_chat(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<ChunkStream, String>;

    /// 非流式完成：拼接全部文本分块
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let mut stream = self.stream_chat(messages, &[]).await?;
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            if let Some(text) = chunk?.text {
                out.push_str(&text);
            }
        }
        Ok(out)
    }
}
