//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `STORECHAT__*` 覆盖（双下划线表示嵌套，如 `STORECHAT__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{ChatError, RetryPolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub conversation: ConversationSection,
    pub archive: ArchiveSection,
}

/// [app] 段：应用名与 system prompt 文件
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 未设置或读取失败时用内置提示词
    pub system_prompt_path: Option<PathBuf>,
}

/// 重试段（[llm.retry] / [tools.retry] / [archive.retry] 共用）
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
    #[serde(default)]
    pub retry: RetrySection,
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
            retry: RetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次生成（含流式读取）超时，秒
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

/// [tools] 段：外部工具执行服务、单次尝试超时、并发与协议块上限
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 工具执行服务地址；未设置时无法构建服务
    pub endpoint: Option<String>,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_block_chars")]
    pub max_block_chars: usize,
    #[serde(default)]
    pub retry: RetrySection,
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_block_chars() -> usize {
    crate::react::parser::DEFAULT_MAX_BLOCK_CHARS
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_concurrency: default_max_concurrency(),
            max_block_chars: default_max_block_chars(),
            retry: RetrySection::default(),
        }
    }
}

/// [conversation] 段：工具轮数上限、空闲超时与维护周期
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationSection {
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

fn default_max_tool_rounds() -> usize {
    crate::react::DEFAULT_MAX_TOOL_ROUNDS
}

fn default_session_idle_timeout_secs() -> u64 {
    1800
}

fn default_maintenance_interval_secs() -> u64 {
    60
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

/// [archive] 段：SQLite 地址、队列容量、flush 周期与写入重试
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveSection {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default)]
    pub retry: RetrySection,
}

fn default_database_url() -> String {
    "sqlite:storechat.db?mode=rwc".to_string()
}

fn default_queue_capacity() -> usize {
    crate::archive::archiver::DEFAULT_QUEUE_CAPACITY
}

fn default_flush_interval_secs() -> u64 {
    5
}

impl Default for ArchiveSection {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            queue_capacity: default_queue_capacity(),
            flush_interval_secs: default_flush_interval_secs(),
            retry: RetrySection::default(),
        }
    }
}

impl AppConfig {
    /// 二进制启动前检查：工具执行服务必须配置，否则给出可操作的提示
    pub fn require_tool_endpoint(&self) -> Result<&str, ChatError> {
        match self.tools.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => Ok(endpoint),
            _ => Err(ChatError::ConfigError(
                "tools.endpoint is not set; uncomment it in config/default.toml \
                 or export STORECHAT__TOOLS__ENDPOINT=http://127.0.0.1:9000/tools/execute"
                    .to_string(),
            )),
        }
    }

    /// 读取 system prompt 文件；未配置或读取失败时返回 None
    pub fn system_prompt(&self) -> Option<String> {
        let path = self.app.system_prompt_path.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(s) if !s.trim().is_empty() => Some(s),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read system prompt, using built-in");
                None
            }
        }
    }
}

/// 从 config 目录加载配置，环境变量 STORECHAT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 STORECHAT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("STORECHAT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_serde_defaults() {
        let from_empty: AppConfig = config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let d = AppConfig::default();
        assert_eq!(from_empty.tools.max_concurrency, d.tools.max_concurrency);
        assert_eq!(from_empty.conversation.max_tool_rounds, 5);
        assert_eq!(from_empty.archive.queue_capacity, 64);
        assert_eq!(from_empty.llm.provider, d.llm.provider);
        assert_eq!(from_empty.llm.retry.max_attempts, d.llm.retry.max_attempts);
    }

    #[test]
    fn test_explicit_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[tools]\nendpoint = \"http://tools.local/run\"\nmax_concurrency = 2\n\n[tools.retry]\nmax_attempts = 5\n\n[conversation]\nmax_tool_rounds = 3"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.tools.endpoint.as_deref(), Some("http://tools.local/run"));
        assert_eq!(cfg.tools.max_concurrency, 2);
        assert_eq!(cfg.tools.retry.max_attempts, 5);
        assert_eq!(cfg.tools.retry.base_delay_ms, 200);
        assert_eq!(cfg.conversation.max_tool_rounds, 3);
    }

    #[test]
    fn test_retry_section_to_policy() {
        let p = RetrySection::default().to_policy();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.base_delay, Duration::from_millis(200));
    }

    #[test]
    fn test_missing_tool_endpoint_is_explained() {
        let mut cfg = AppConfig::default();
        let err = cfg.require_tool_endpoint().unwrap_err();
        assert!(matches!(&err, ChatError::ConfigError(m) if m.contains("STORECHAT__TOOLS__ENDPOINT")));

        cfg.tools.endpoint = Some("  ".into());
        assert!(cfg.require_tool_endpoint().is_err());

        cfg.tools.endpoint = Some("http://tools.local/run".into());
        assert_eq!(cfg.require_tool_endpoint().unwrap(), "http://tools.local/run");
    }
}
