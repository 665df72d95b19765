//! 变量空间：会话级键值工作区（Agent 工作记忆）
//!
//! 后端只提供按 (session_id, key) 的 get / 原子批量写，没有范围扫描；
//! 因此每个会话另存一份目录索引，与值的写入 / 删除放在同一个原子批次里。
//! 同一 (session, key) 的并发写是后写覆盖。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::core::StorageError;

/// 目录索引在后端中的键
const INDEX_KEY: &str = "__index__";
/// 值条目在后端中的键前缀，与索引键互不冲突
const ENTRY_PREFIX: &str = "var:";
/// 目录摘要中单条 summary 的最大字符数
const SUMMARY_PREVIEW_CHARS: usize = 160;

/// 批量写中的单个操作
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put { key: String, value: Value },
    Delete { key: String },
}

/// 变量后端接口：任意 JSON 的 get / put / delete，无扫描
#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<Value>, StorageError>;

    /// 批次内所有操作要么全部生效，要么全部不生效
    async fn write_batch(&self, session_id: &str, ops: Vec<WriteOp>) -> Result<(), StorageError>;
}

/// 内存后端
#[derive(Default)]
pub struct InMemoryVariableStore {
    data: RwLock<HashMap<(String, String), Value>>,
}

impl InMemoryVariableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VariableStore for InMemoryVariableStore {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .data
            .read()
            .await
            .get(&(session_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn write_batch(&self, session_id: &str, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    data.insert((session_id.to_string(), key), value);
                }
                WriteOp::Delete { key } => {
                    data.remove(&(session_id.to_string(), key));
                }
            }
        }
        Ok(())
    }
}

/// 单个变量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableEntry {
    pub key: String,
    pub value: Value,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 目录中的一项（不含值）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableListing {
    pub key: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    summary: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// 同一时间戳下的写入顺序
    revision: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VariableIndex {
    entries: BTreeMap<String, IndexEntry>,
    next_revision: u64,
}

pub struct VariableSpace {
    store: Arc<dyn VariableStore>,
    /// 串行化本实例内的索引读改写，避免不同键的并发写互相覆盖索引
    index_lock: Mutex<()>,
}

impl VariableSpace {
    pub fn new(store: Arc<dyn VariableStore>) -> Self {
        Self {
            store,
            index_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryVariableStore::new()))
    }

    async fn load_index(&self, session_id: &str) -> Result<VariableIndex, StorageError> {
        match self.store.get(session_id, INDEX_KEY).await? {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(VariableIndex::default()),
        }
    }

    /// 写入或覆盖；保留首次创建时间，updated_at 每次刷新
    pub async fn set(
        &self,
        session_id: &str,
        key: &str,
        value: Value,
        summary: impl Into<String>,
    ) -> Result<VariableEntry, StorageError> {
        if key.trim().is_empty() {
            return Err(StorageError::InvalidKey("variable key must not be empty".into()));
        }
        let summary = summary.into();
        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index(session_id).await?;
        let now = Utc::now();
        let created_at = index.entries.get(key).map(|e| e.created_at).unwrap_or(now);

        let entry = VariableEntry {
            key: key.to_string(),
            value,
            summary: summary.clone(),
            created_at,
            updated_at: now,
        };
        index.next_revision += 1;
        index.entries.insert(
            key.to_string(),
            IndexEntry {
                summary,
                created_at,
                updated_at: now,
                revision: index.next_revision,
            },
        );

        self.store
            .write_batch(
                session_id,
                vec![
                    WriteOp::Put {
                        key: format!("{ENTRY_PREFIX}{key}"),
                        value: serde_json::to_value(&entry)?,
                    },
                    WriteOp::Put {
                        key: INDEX_KEY.to_string(),
                        value: serde_json::to_value(&index)?,
                    },
                ],
            )
            .await?;
        tracing::debug!(session_id, key, "variable set");
        Ok(entry)
    }

    /// 不存在时返回 NotFound
    pub async fn get(&self, session_id: &str, key: &str) -> Result<VariableEntry, StorageError> {
        match self.store.get(session_id, &format!("{ENTRY_PREFIX}{key}")).await? {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Err(StorageError::NotFound(format!("variable {key} in session {session_id}"))),
        }
    }

    /// 按前缀过滤目录，updated_at 降序，截断到 limit
    pub async fn list(
        &self,
        session_id: &str,
        prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<VariableListing>, StorageError> {
        let index = self.load_index(session_id).await?;
        let mut matched: Vec<(&String, &IndexEntry)> = index
            .entries
            .iter()
            .filter(|(k, _)| prefix.map_or(true, |p| k.starts_with(p)))
            .collect();
        matched.sort_by(|a, b| {
            b.1.updated_at
                .cmp(&a.1.updated_at)
                .then(b.1.revision.cmp(&a.1.revision))
        });
        Ok(matched
            .into_iter()
            .take(limit)
            .map(|(k, e)| VariableListing {
                key: k.clone(),
                summary: e.summary.clone(),
                created_at: e.created_at,
                updated_at: e.updated_at,
            })
            .collect())
    }

    /// 不存在时返回 NotFound；值与索引项在同一批次中删除
    pub async fn delete(&self, session_id: &str, key: &str) -> Result<(), StorageError> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index(session_id).await?;
        if index.entries.remove(key).is_none() {
            return Err(StorageError::NotFound(format!("variable {key} in session {session_id}")));
        }
        self.store
            .write_batch(
                session_id,
                vec![
                    WriteOp::Delete {
                        key: format!("{ENTRY_PREFIX}{key}"),
                    },
                    WriteOp::Put {
                        key: INDEX_KEY.to_string(),
                        value: serde_json::to_value(&index)?,
                    },
                ],
            )
            .await?;
        tracing::debug!(session_id, key, "variable deleted");
        Ok(())
    }

    /// 渲染只含 key + summary 的紧凑目录，拼入 prompt，让 Agent 知道自己存过什么而不必重读原值
    pub async fn build_directory_summary(&self, session_id: &str, limit: usize) -> Result<String, StorageError> {
        let index = self.load_index(session_id).await?;
        let total = index.entries.len();
        if total == 0 {
            return Ok("Variable directory is empty.".to_string());
        }
        let listed = self.list(session_id, None, limit).await?;
        let mut s = format!("Variable directory ({total} entries, newest first):\n");
        for item in &listed {
            let summary: String = item.summary.chars().take(SUMMARY_PREVIEW_CHARS).collect();
            let ellipsis = if item.summary.chars().count() > SUMMARY_PREVIEW_CHARS {
                "..."
            } else {
                ""
            };
            s.push_str(&format!("- {}: {}{}\n", item.key, summary, ellipsis));
        }
        if total > listed.len() {
            s.push_str(&format!(
                "(+{} more; use var_list to see them)\n",
                total - listed.len()
            ));
        }
        Ok(s)
    }
}
