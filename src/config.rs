//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__RESEARCH__CONCURRENCY=4`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::llm::UsageHeuristics;
use crate::react::{AgentConfig, DEFAULT_ROUND_LIMIT_MESSAGE};
use crate::research::ResearchConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    /// 用量占位值检测阈值；只是经验值
    pub usage: UsageHeuristics,
    pub research: ResearchConfig,
    pub storage: StorageSection,
}

/// [agent] 段：轮数上限、工具超时、上限时的终止回复
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_tool_rounds: u32,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub round_limit_message: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_tool_rounds: 8,
            tool_timeout_secs: 30,
            round_limit_message: DEFAULT_ROUND_LIMIT_MESSAGE.to_string(),
        }
    }
}

/// [storage] 段：SQLite 文件路径（需 async-sqlite feature）；未设置时使用内存存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSection {
    pub checkpoint_db: Option<PathBuf>,
    pub variable_db: Option<PathBuf>,
}

impl AppConfig {
    /// 状态机配置：[agent] + [usage]
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            max_tool_rounds: self.agent.max_tool_rounds,
            round_limit_message: self.agent.round_limit_message.clone(),
            usage: self.usage.clone(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_sections_missing() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_tool_rounds, 8);
        assert_eq!(cfg.agent.tool_timeout_secs, 30);
        assert_eq!(cfg.usage.min_chars_for_check, 200);
        assert_eq!(cfg.research.max_attempts, 2);
        assert!(cfg.storage.checkpoint_db.is_none());
        assert_eq!(cfg.agent_config().round_limit_message, DEFAULT_ROUND_LIMIT_MESSAGE);
    }

    #[test]
    fn test_default_toml_matches_struct_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let defaults = AppConfig::default();
        assert_eq!(cfg.research, defaults.research);
        assert_eq!(cfg.research.directory_limit, 30);
        assert_eq!(cfg.agent.max_tool_rounds, defaults.agent.max_tool_rounds);
        assert_eq!(cfg.agent.tool_timeout_secs, defaults.agent.tool_timeout_secs);
        assert_eq!(cfg.usage.min_chars_for_check, defaults.usage.min_chars_for_check);
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[agent]\nmax_tool_rounds = 3\n\n[research]\nconcurrency = 0\nplan_key = \"plan\"\n\n[usage]\nmax_chars_per_token = 20.0"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.max_tool_rounds, 3);
        assert_eq!(cfg.agent.tool_timeout_secs, 30);
        assert_eq!(cfg.research.concurrency, 0);
        assert_eq!(cfg.research.plan_key, "plan");
        assert_eq!(cfg.research.max_tasks, 6);
        assert_eq!(cfg.usage.max_chars_per_token, 20.0);
        assert_eq!(cfg.usage.min_chars_for_check, 200);
    }
}
