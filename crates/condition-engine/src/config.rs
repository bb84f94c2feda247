//! 配置管理模块
//!
//! 支持从配置文件加载引擎参数，并允许环境变量覆盖。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::observability::ObservabilityConfig;

/// 失败消息中无法解析的占位符默认替换值
pub const DEFAULT_MISSING_TOKEN_PLACEHOLDER: &str = "N/A";

/// 引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `@{Property.Path}` 无法解析或值为 null 时使用的替换文本
    pub missing_token_placeholder: String,
    /// 缓存按键加锁的等待上限（毫秒），为空表示一直等待
    pub cache_lock_timeout_ms: Option<u64>,
    pub observability: ObservabilityConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            missing_token_placeholder: DEFAULT_MISSING_TOKEN_PLACEHOLDER.to_string(),
            cache_lock_timeout_ms: None,
            observability: ObservabilityConfig::default(),
        }
    }
}

impl EngineConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. 内置默认值
    /// 2. {CONFIG_DIR}/condition-engine.toml（可选）
    /// 3. 环境变量（CONDITION_ENGINE_ 前缀，嵌套字段用 `__` 分隔，
    ///    如 CONDITION_ENGINE_OBSERVABILITY__LOG_LEVEL -> observability.log_level）
    pub fn load() -> Result<Self, ConfigError> {
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
        Self::load_from(Path::new(&config_dir).join("condition-engine.toml").as_path())
    }

    /// 从指定文件加载配置，文件不存在时只使用默认值和环境变量
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix("CONDITION_ENGINE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 设置占位符替换文本
    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.missing_token_placeholder = placeholder.into();
        self
    }

    /// 设置缓存锁等待上限
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.cache_lock_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn cache_lock_timeout(&self) -> Option<Duration> {
        self.cache_lock_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.missing_token_placeholder, "N/A");
        assert!(config.cache_lock_timeout().is_none());
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = EngineConfig::load_from(Path::new("/nonexistent/condition-engine.toml"))
            .unwrap();
        assert_eq!(config.missing_token_placeholder, "N/A");
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("condition-engine-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("condition-engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "missing_token_placeholder = \"<none>\"\ncache_lock_timeout_ms = 250\n\n[observability]\nlog_level = \"debug\"\njson_logs = true"
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.missing_token_placeholder, "<none>");
        assert_eq!(config.cache_lock_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.observability.log_level, "debug");
        assert!(config.observability.json_logs);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_builder_helpers() {
        let config = EngineConfig::default()
            .with_placeholder("?")
            .with_lock_timeout(Duration::from_secs(2));
        assert_eq!(config.missing_token_placeholder, "?");
        assert_eq!(config.cache_lock_timeout_ms, Some(2000));
    }
}
