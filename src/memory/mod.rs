//! 记忆层：对话消息、检查点日志、会话变量空间与持久化

pub mod async_persistence;
pub mod checkpoint;
pub mod conversation;
pub mod variables;

#[cfg(feature = "async-sqlite")]
pub use async_persistence::{open_pool, SqliteCheckpointStore, SqliteVariableStore};
pub use async_persistence::{checkpoint_store, variable_store};
pub use checkpoint::{Checkpoint, CheckpointMeta, CheckpointStore, InMemoryCheckpointStore};
pub use conversation::{append_message, sanitize_for_model, Message, Role, ToolCall};
pub use variables::{
    InMemoryVariableStore, VariableEntry, VariableListing, VariableSpace, VariableStore, WriteOp,
};
