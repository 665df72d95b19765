//! 运行时构建器：按 AppConfig 统一装配执行器、存储、状态机与研究编排
//!
//! [agent] 决定工具超时与轮数，[storage] 决定检查点 / 变量后端，[research] 交给编排器。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::StorageError;
use crate::llm::LlmClient;
use crate::memory::{checkpoint_store, variable_store, VariableSpace};
use crate::react::AgentStateMachine;
use crate::research::ResearchOrchestrator;
use crate::tools::{register_variable_tools, ToolCatalog, ToolExecutor};

/// 装配完成的各组件，彼此共享同一个变量空间与检查点存储
pub struct HiveRuntime {
    pub executor: Arc<ToolExecutor>,
    pub vars: Arc<VariableSpace>,
    pub agent: Arc<AgentStateMachine>,
    pub research: Arc<ResearchOrchestrator>,
}

pub struct AgentBuilder {
    config: AppConfig,
    catalog: ToolCatalog,
    variable_tools: bool,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            catalog: ToolCatalog::new(),
            variable_tools: true,
        }
    }

    /// 调用方自己的工具；变量工具会在 build 时追加进去
    pub fn with_catalog(mut self, catalog: ToolCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// 是否注册 var_set / var_get / var_list（默认注册）
    pub fn with_variable_tools(mut self, enable: bool) -> Self {
        self.variable_tools = enable;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn build(self, llm: Arc<dyn LlmClient>) -> Result<HiveRuntime, StorageError> {
        let AgentBuilder {
            config,
            mut catalog,
            variable_tools,
        } = self;

        let checkpoints = checkpoint_store(config.storage.checkpoint_db.as_deref()).await?;
        let vars = Arc::new(VariableSpace::new(
            variable_store(config.storage.variable_db.as_deref()).await?,
        ));
        if variable_tools {
            register_variable_tools(&mut catalog, vars.clone());
        }

        let executor = Arc::new(ToolExecutor::new(Arc::new(catalog), config.agent.tool_timeout_secs));
        let agent = Arc::new(AgentStateMachine::new(
            llm.clone(),
            executor.clone(),
            checkpoints,
            config.agent_config(),
        ));
        let research = Arc::new(ResearchOrchestrator::new(
            llm,
            agent.clone(),
            vars.clone(),
            config.research.clone(),
        ));
        tracing::info!(
            tools = executor.catalog().tool_names().len(),
            tool_timeout_secs = config.agent.tool_timeout_secs,
            max_tool_rounds = config.agent.max_tool_rounds,
            "runtime built"
        );

        Ok(HiveRuntime {
            executor,
            vars,
            agent,
            research,
        })
    }
}
