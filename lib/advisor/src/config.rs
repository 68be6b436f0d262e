/* 配置：TOML 文件，所有字段都有默认值 */
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::{Protocol, SearchParams};
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdvisorConfig {
    pub engine: EngineConfig,
    pub cloud: CloudConfig,
    pub score_db: ScoreDbConfig,
    pub books: BooksConfig,
    pub merge: MergeConfig,
    pub log: LogConfig,
}

impl AdvisorConfig {
    /// 没给路径就用默认配置；给了路径但读不到是错误
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(AdvisorConfig::default());
        };
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub path: Option<PathBuf>,
    pub protocol: Protocol,
    /// 0 表示不限深度
    pub depth: u32,
    /// 毫秒，0 表示不限时间
    pub movetime: u64,
    pub multipv: u32,
    pub options: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            path: None,
            protocol: Protocol::Ucci,
            depth: 0,
            movetime: 0,
            multipv: 1,
            options: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            depth: self.depth,
            movetime: self.movetime,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CloudConfig {
    pub enabled: bool,
    pub url: String,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            enabled: true,
            url: "http://www.chessdb.cn/chessdb.php".to_owned(),
            max_attempts: 3,
            retry_delay_ms: 2000,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoreDbConfig {
    pub enabled: bool,
    pub url: String,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
}

impl Default for ScoreDbConfig {
    fn default() -> Self {
        ScoreDbConfig {
            enabled: false,
            url: "http://127.0.0.1:8887/query".to_owned(),
            max_attempts: 5,
            retry_delay_ms: 2000,
            timeout_ms: 10_000,
        }
    }
}

/// 云库与评分服务共用的请求设置
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSettings {
    pub url: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl From<&CloudConfig> for RemoteSettings {
    fn from(c: &CloudConfig) -> Self {
        RemoteSettings {
            url: c.url.clone(),
            max_attempts: c.max_attempts.max(1),
            retry_delay: Duration::from_millis(c.retry_delay_ms),
            timeout: Duration::from_millis(c.timeout_ms),
        }
    }
}

impl From<&ScoreDbConfig> for RemoteSettings {
    fn from(c: &ScoreDbConfig) -> Self {
        RemoteSettings {
            url: c.url.clone(),
            max_attempts: c.max_attempts.max(1),
            retry_delay: Duration::from_millis(c.retry_delay_ms),
            timeout: Duration::from_millis(c.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct BooksConfig {
    pub local: Option<PathBuf>,
    pub master: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    /// 分差超过这个值的着法不显示，0 表示不过滤
    pub score_limit: i32,
    /// 与最佳分数相差不超过这个值的都算最佳着法
    pub best_tolerance: i32,
    /// 走出的着法比最佳着法差这么多就标记为失误
    pub blunder_threshold: i32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            score_limit: 90,
            best_tolerance: 5,
            blunder_threshold: -40,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_owned(),
        }
    }
}
