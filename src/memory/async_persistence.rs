//! 异步 SQLite 持久化（sqlx）
//!
//! 检查点日志与变量键值表的 SQLite 实现。需要启用 `async-sqlite` feature。

#[cfg(feature = "async-sqlite")]
mod sqlx_impl {
    use std::path::Path;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::Value;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
    use sqlx::Row;

    use crate::core::StorageError;
    use crate::memory::checkpoint::new_checkpoint_id;
    use crate::memory::{Checkpoint, CheckpointMeta, CheckpointStore, VariableStore, WriteOp};
    use crate::react::{GraphState, NodeKind};

    impl From<sqlx::Error> for StorageError {
        fn from(e: sqlx::Error) -> Self {
            StorageError::Backend(e.to_string())
        }
    }

    /// 打开（必要时创建）数据库文件
    pub async fn open_pool(db_path: impl AsRef<Path>) -> Result<SqlitePool, StorageError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        Ok(pool)
    }

    fn parse_node(s: &str) -> Result<NodeKind, StorageError> {
        Ok(serde_json::from_value(Value::String(s.to_string()))?)
    }

    fn parse_time(s: &str) -> Result<DateTime<Utc>, StorageError> {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StorageError::Backend(format!("bad timestamp {s}: {e}")))
    }

    fn row_to_checkpoint(row: &SqliteRow) -> Result<Checkpoint, StorageError> {
        let state: String = row.get("state");
        let node: String = row.get("node");
        let next: String = row.get("next");
        let created_at: String = row.get("created_at");
        let step: i64 = row.get("step");
        let fork_thread: Option<String> = row.get("forked_from_thread");
        let fork_checkpoint: Option<String> = row.get("forked_from_checkpoint");
        Ok(Checkpoint {
            thread_id: row.get("thread_id"),
            checkpoint_id: row.get("checkpoint_id"),
            parent_checkpoint_id: row.get("parent_checkpoint_id"),
            step: step as u64,
            node: parse_node(&node)?,
            next: parse_node(&next)?,
            state: serde_json::from_str::<GraphState>(&state)?,
            created_at: parse_time(&created_at)?,
            forked_from: fork_thread.zip(fork_checkpoint),
        })
    }

    const CHECKPOINT_COLUMNS: &str = "thread_id, checkpoint_id, parent_checkpoint_id, step, node, next, \
         state, created_at, forked_from_thread, forked_from_checkpoint";

    /// SQLite 检查点存储：只追加，seq 自增列决定线程内顺序
    pub struct SqliteCheckpointStore {
        pool: SqlitePool,
    }

    impl SqliteCheckpointStore {
        pub async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
            let store = Self { pool };
            store.init_tables().await?;
            Ok(store)
        }

        async fn init_tables(&self) -> Result<(), StorageError> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS checkpoints (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    thread_id TEXT NOT NULL,
                    checkpoint_id TEXT NOT NULL UNIQUE,
                    parent_checkpoint_id TEXT,
                    step INTEGER NOT NULL,
                    node TEXT NOT NULL,
                    next TEXT NOT NULL,
                    state TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    forked_from_thread TEXT,
                    forked_from_checkpoint TEXT
                )",
            )
            .execute(&self.pool)
            .await?;

            sqlx::query("CREATE INDEX IF NOT EXISTS idx_checkpoints_thread ON checkpoints(thread_id, seq)")
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl CheckpointStore for SqliteCheckpointStore {
        async fn put(&self, thread_id: &str, state: &GraphState, meta: CheckpointMeta) -> Result<String, StorageError> {
            let mut tx = self.pool.begin().await?;
            let latest = sqlx::query(
                "SELECT checkpoint_id, step FROM checkpoints WHERE thread_id = ? ORDER BY seq DESC LIMIT 1",
            )
            .bind(thread_id)
            .fetch_optional(&mut *tx)
            .await?;
            let (parent, step) = match latest {
                Some(row) => {
                    let id: String = row.get("checkpoint_id");
                    let step: i64 = row.get("step");
                    (Some(id), step + 1)
                }
                None => (None, 0),
            };

            let checkpoint_id = new_checkpoint_id();
            sqlx::query(
                "INSERT INTO checkpoints (thread_id, checkpoint_id, parent_checkpoint_id, step, node, next, state, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(thread_id)
            .bind(&checkpoint_id)
            .bind(parent)
            .bind(step)
            .bind(meta.node.as_str())
            .bind(meta.next.as_str())
            .bind(serde_json::to_string(state)?)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(checkpoint_id)
        }

        async fn get(&self, thread_id: &str, checkpoint_id: Option<&str>) -> Result<Option<Checkpoint>, StorageError> {
            let row = match checkpoint_id {
                Some(id) => {
                    let sql = format!(
                        "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE thread_id = ? AND checkpoint_id = ?"
                    );
                    sqlx::query(&sql)
                        .bind(thread_id)
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?
                }
                None => {
                    let sql = format!(
                        "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE thread_id = ? ORDER BY seq DESC LIMIT 1"
                    );
                    sqlx::query(&sql)
                        .bind(thread_id)
                        .fetch_optional(&self.pool)
                        .await?
                }
            };
            row.as_ref().map(row_to_checkpoint).transpose()
        }

        async fn history(
            &self,
            thread_id: &str,
            limit: usize,
            before: Option<&str>,
        ) -> Result<Vec<Checkpoint>, StorageError> {
            let upper: i64 = match before {
                Some(cursor) => {
                    let row = sqlx::query("SELECT seq FROM checkpoints WHERE thread_id = ? AND checkpoint_id = ?")
                        .bind(thread_id)
                        .bind(cursor)
                        .fetch_optional(&self.pool)
                        .await?
                        .ok_or_else(|| StorageError::NotFound(format!("checkpoint {cursor} in {thread_id}")))?;
                    row.get("seq")
                }
                None => i64::MAX,
            };
            let sql = format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE thread_id = ? AND seq < ? ORDER BY seq DESC LIMIT ?"
            );
            let rows = sqlx::query(&sql)
                .bind(thread_id)
                .bind(upper)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(row_to_checkpoint).collect()
        }

        async fn fork(
            &self,
            thread_id: &str,
            checkpoint_id: &str,
            new_thread_id: &str,
        ) -> Result<GraphState, StorageError> {
            let mut tx = self.pool.begin().await?;
            let exists = sqlx::query("SELECT 1 FROM checkpoints WHERE thread_id = ? LIMIT 1")
                .bind(new_thread_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_some() {
                return Err(StorageError::Backend(format!(
                    "fork target thread {new_thread_id} already exists"
                )));
            }
            let sql = format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE thread_id = ? AND checkpoint_id = ?"
            );
            let row = sqlx::query(&sql)
                .bind(thread_id)
                .bind(checkpoint_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("checkpoint {checkpoint_id} in {thread_id}")))?;
            let source = row_to_checkpoint(&row)?;

            sqlx::query(
                "INSERT INTO checkpoints (thread_id, checkpoint_id, parent_checkpoint_id, step, node, next, state, created_at, forked_from_thread, forked_from_checkpoint)
                 VALUES (?, ?, NULL, 0, ?, ?, ?, ?, ?, ?)",
            )
            .bind(new_thread_id)
            .bind(new_checkpoint_id())
            .bind(source.node.as_str())
            .bind(source.next.as_str())
            .bind(serde_json::to_string(&source.state)?)
            .bind(Utc::now().to_rfc3339())
            .bind(thread_id)
            .bind(checkpoint_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(source.state)
        }
    }

    /// SQLite 变量后端：单表键值，批次在一个事务内提交
    pub struct SqliteVariableStore {
        pool: SqlitePool,
    }

    impl SqliteVariableStore {
        pub async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS variables (
                    session_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    PRIMARY KEY (session_id, key)
                )",
            )
            .execute(&pool)
            .await?;
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl VariableStore for SqliteVariableStore {
        async fn get(&self, session_id: &str, key: &str) -> Result<Option<Value>, StorageError> {
            let row = sqlx::query("SELECT value FROM variables WHERE session_id = ? AND key = ?")
                .bind(session_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
            match row {
                Some(row) => {
                    let raw: String = row.get("value");
                    Ok(Some(serde_json::from_str(&raw)?))
                }
                None => Ok(None),
            }
        }

        async fn write_batch(&self, session_id: &str, ops: Vec<WriteOp>) -> Result<(), StorageError> {
            let mut tx = self.pool.begin().await?;
            for op in ops {
                match op {
                    WriteOp::Put { key, value } => {
                        sqlx::query(
                            "INSERT INTO variables (session_id, key, value) VALUES (?, ?, ?)
                             ON CONFLICT(session_id, key) DO UPDATE SET value = excluded.value",
                        )
                        .bind(session_id)
                        .bind(key)
                        .bind(serde_json::to_string(&value)?)
                        .execute(&mut *tx)
                        .await?;
                    }
                    WriteOp::Delete { key } => {
                        sqlx::query("DELETE FROM variables WHERE session_id = ? AND key = ?")
                            .bind(session_id)
                            .bind(key)
                            .execute(&mut *tx)
                            .await?;
                    }
                }
            }
            tx.commit().await?;
            Ok(())
        }
    }
}

#[cfg(feature = "async-sqlite")]
pub use sqlx_impl::{open_pool, SqliteCheckpointStore, SqliteVariableStore};

use std::path::Path;
use std::sync::Arc;

use crate::core::StorageError;
use crate::memory::{CheckpointStore, InMemoryCheckpointStore, InMemoryVariableStore, VariableStore};

/// 按 [storage] 配置构建检查点存储：给了路径且启用 async-sqlite 时用 SQLite，否则用内存
pub async fn checkpoint_store(db_path: Option<&Path>) -> Result<Arc<dyn CheckpointStore>, StorageError> {
    match db_path {
        #[cfg(feature = "async-sqlite")]
        Some(path) => Ok(Arc::new(SqliteCheckpointStore::new(open_pool(path).await?).await?)),
        #[cfg(not(feature = "async-sqlite"))]
        Some(path) => {
            tracing::warn!(path = %path.display(), "async-sqlite feature disabled, using in-memory checkpoints");
            Ok(Arc::new(InMemoryCheckpointStore::new()))
        }
        None => Ok(Arc::new(InMemoryCheckpointStore::new())),
    }
}

/// 同上，变量后端
pub async fn variable_store(db_path: Option<&Path>) -> Result<Arc<dyn VariableStore>, StorageError> {
    match db_path {
        #[cfg(feature = "async-sqlite")]
        Some(path) => Ok(Arc::new(SqliteVariableStore::new(open_pool(path).await?).await?)),
        #[cfg(not(feature = "async-sqlite"))]
        Some(path) => {
            tracing::warn!(path = %path.display(), "async-sqlite feature disabled, using in-memory variables");
            Ok(Arc::new(InMemoryVariableStore::new()))
        }
        None => Ok(Arc::new(InMemoryVariableStore::new())),
    }
}

#[cfg(all(test, not(feature = "async-sqlite")))]
mod fallback_tests {
    use super::*;

    #[tokio::test]
    async fn test_stores_fall_back_to_memory() {
        let cps = checkpoint_store(Some(Path::new("unused.db"))).await.unwrap();
        assert!(cps.get("t", None).await.unwrap().is_none());
        let vars = variable_store(None).await.unwrap();
        assert!(vars.get("s", "k").await.unwrap().is_none());
        assert!(!Path::new("unused.db").exists());
    }
}
