//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 由闭包根据消息与工具生成分块序列；`scripted` 按顺序回放预设的回复，用尽后重复最后一条。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{ChunkStream, LlmClient, ModelChunk, ToolSpec};
use crate::memory::Message;

type Responder = Box<dyn Fn(&[Message], &[ToolSpec]) -> Result<Vec<ModelChunk>, String> + Send + Sync>;

/// 单次调用的记录，供测试断言
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
}

pub struct MockLlmClient {
    responder: Responder,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockLlmClient {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&[Message], &[ToolSpec]) -> Result<Vec<ModelChunk>, String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(f),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 按顺序返回预设的分块序列；最后一条会被重复使用
    pub fn scripted(turns: Vec<Vec<ModelChunk>>) -> Self {
        let queue = Mutex::new(VecDeque::from(turns));
        Self::from_fn(move |_, _| {
            let mut q = queue.lock().map_err(|_| "mock script poisoned".to_string())?;
            match q.len() {
                0 => Err("mock script is empty".to_string()),
                1 => Ok(q.front().cloned().unwrap_or_default()),
                _ => Ok(q.pop_front().unwrap_or_default()),
            }
        })
    }

    /// 纯文本回复
    pub fn replying(text: &str) -> Self {
        Self::scripted(vec![vec![ModelChunk::text(text)]])
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn stream_chat(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<ChunkStream, String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                messages: messages.to_vec(),
                tools: tools.iter().map(|t| t.name.clone()).collect(),
            });
        }
        let chunks = (self.responder)(messages, tools)?;
        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }
}
