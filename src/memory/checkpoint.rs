//! 检查点存储
//!
//! 每个线程一条只追加的快照日志：(thread_id, checkpoint_id, parent_checkpoint_id, state, created_at)。
//! 支持点读、分页历史（新到旧）与复制式分叉；任何操作都不会删除或改写已有检查点。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::StorageError;
use crate::react::{GraphState, NodeKind};

/// 写入检查点时附带的元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// 产生该检查点的节点
    pub node: NodeKind,
    /// 之后要执行的节点
    pub next: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    /// 线程内从 0 开始的序号
    pub step: u64,
    pub node: NodeKind,
    pub next: NodeKind,
    pub state: GraphState,
    pub created_at: DateTime<Utc>,
    /// 分叉产生的首个检查点记录来源 (thread_id, checkpoint_id)
    #[serde(default)]
    pub forked_from: Option<(String, String)>,
}

/// 检查点存储接口：并发读安全；同一线程的并发写需由调用方串行化
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 追加一个检查点，父节点为该线程当前最新的检查点
    async fn put(&self, thread_id: &str, state: &GraphState, meta: CheckpointMeta) -> Result<String, StorageError>;

    /// checkpoint_id 为 None 时读最新
    async fn get(&self, thread_id: &str, checkpoint_id: Option<&str>) -> Result<Option<Checkpoint>, StorageError>;

    /// 新到旧；before 为游标，只返回比它更早的检查点
    async fn history(
        &self,
        thread_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<Checkpoint>, StorageError>;

    /// 将 checkpoint_id 处的状态复制为 new_thread_id 的首个检查点；源线程不变
    async fn fork(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        new_thread_id: &str,
    ) -> Result<GraphState, StorageError>;
}

pub(crate) fn new_checkpoint_id() -> String {
    format!("ckpt_{}", uuid::Uuid::new_v4().simple())
}

/// 内存实现（测试与单进程使用）
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    threads: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn thread_len(&self, thread_id: &str) -> usize {
        self.threads
            .read()
            .await
            .get(thread_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(&self, thread_id: &str, state: &GraphState, meta: CheckpointMeta) -> Result<String, StorageError> {
        let mut threads = self.threads.write().await;
        let log = threads.entry(thread_id.to_string()).or_default();
        let parent = log.last().map(|c| c.checkpoint_id.clone());
        let checkpoint_id = new_checkpoint_id();
        log.push(Checkpoint {
            thread_id: thread_id.to_string(),
            checkpoint_id: checkpoint_id.clone(),
            parent_checkpoint_id: parent,
            step: log.len() as u64,
            node: meta.node,
            next: meta.next,
            state: state.clone(),
            created_at: Utc::now(),
            forked_from: None,
        });
        Ok(checkpoint_id)
    }

    async fn get(&self, thread_id: &str, checkpoint_id: Option<&str>) -> Result<Option<Checkpoint>, StorageError> {
        let threads = self.threads.read().await;
        let Some(log) = threads.get(thread_id) else {
            return Ok(None);
        };
        Ok(match checkpoint_id {
            Some(id) => log.iter().find(|c| c.checkpoint_id == id).cloned(),
            None => log.last().cloned(),
        })
    }

    async fn history(
        &self,
        thread_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<Checkpoint>, StorageError> {
        let threads = self.threads.read().await;
        let Some(log) = threads.get(thread_id) else {
            return Ok(Vec::new());
        };
        let end = match before {
            Some(cursor) => log
                .iter()
                .position(|c| c.checkpoint_id == cursor)
                .ok_or_else(|| StorageError::NotFound(format!("checkpoint {cursor} in {thread_id}")))?,
            None => log.len(),
        };
        Ok(log[..end].iter().rev().take(limit).cloned().collect())
    }

    async fn fork(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        new_thread_id: &str,
    ) -> Result<GraphState, StorageError> {
        let mut threads = self.threads.write().await;
        if threads.get(new_thread_id).is_some_and(|log| !log.is_empty()) {
            return Err(StorageError::Backend(format!(
                "fork target thread {new_thread_id} already exists"
            )));
        }
        let source = threads
            .get(thread_id)
            .and_then(|log| log.iter().find(|c| c.checkpoint_id == checkpoint_id))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("checkpoint {checkpoint_id} in {thread_id}")))?;
        let state = source.state.clone();
        threads.insert(
            new_thread_id.to_string(),
            vec![Checkpoint {
                thread_id: new_thread_id.to_string(),
                checkpoint_id: new_checkpoint_id(),
                parent_checkpoint_id: None,
                step: 0,
                node: source.node,
                next: source.next,
                state: state.clone(),
                created_at: Utc::now(),
                forked_from: Some((thread_id.to_string(), checkpoint_id.to_string())),
            }],
        );
        Ok(state)
    }
}
