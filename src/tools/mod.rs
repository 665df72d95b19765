//! 工具层：工具目录、执行器（超时 + 审计 + 错误编码）、变量空间工具与参数 schema

pub mod executor;
pub mod registry;
pub mod schema;
pub mod variables;

pub use executor::{ToolExecutor, ToolResult};
pub use registry::{FnTool, Tool, ToolCatalog, ToolContext, ToolFuture};
pub use schema::{required_params, schema_of};
pub use variables::{register_variable_tools, VarGetTool, VarListTool, VarSetTool};
