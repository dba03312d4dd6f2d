//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `gh-vault.yml` 的字段元信息。

use std::num::NonZeroUsize;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::config::{ConfigError, ConfigSpec, FieldMeta};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 路径配置
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    // 并发配置
    #[serde(default)]
    pub max_workers: usize,
    #[serde(default = "default_sequential_threshold")]
    pub sequential_threshold: usize,

    // 网络配置
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    // 重试配置
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default = "default_max_rate_limit_wait_secs")]
    pub max_rate_limit_wait_secs: u64,

    // 报告配置
    #[serde(default = "default_top_n_size")]
    pub top_n_size: usize,
    #[serde(default = "default_top_n_recent")]
    pub top_n_recent: usize,
    #[serde(default = "default_true")]
    pub progress_bar: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            log_dir: default_log_dir(),
            max_workers: 0,
            sequential_threshold: default_sequential_threshold(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_timeout_secs(),
            token_env: default_token_env(),
            page_size: default_page_size(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_true(),
            max_rate_limit_wait_secs: default_max_rate_limit_wait_secs(),
            top_n_size: default_top_n_size(),
            top_n_recent: default_top_n_recent(),
            progress_bar: default_true(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "gh-vault.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 16] = [
            FieldMeta {
                name: "backup_dir",
                description: "备份根目录（其下生成 repositories/ gists/ reports/）",
            },
            FieldMeta {
                name: "log_dir",
                description: "日志目录",
            },
            FieldMeta {
                name: "max_workers",
                description: "最大并发下载线程数，0 表示自动（CPU 核数 - 1）",
            },
            FieldMeta {
                name: "sequential_threshold",
                description: "条目数不超过该值时在主线程顺序下载",
            },
            FieldMeta {
                name: "timeout_secs",
                description: "单次下载超时时间（秒）",
            },
            FieldMeta {
                name: "connect_timeout_secs",
                description: "连接超时时间（秒）",
            },
            FieldMeta {
                name: "token_env",
                description: "读取访问令牌的环境变量名（留空表示匿名）",
            },
            FieldMeta {
                name: "page_size",
                description: "清单分页大小",
            },
            FieldMeta {
                name: "max_attempts",
                description: "每个条目的最大尝试次数",
            },
            FieldMeta {
                name: "base_delay_ms",
                description: "首次重试前的退避时间, 单位ms（之后逐次翻倍）",
            },
            FieldMeta {
                name: "max_delay_ms",
                description: "最大退避时间, 单位ms",
            },
            FieldMeta {
                name: "jitter",
                description: "是否为退避时间叠加随机抖动",
            },
            FieldMeta {
                name: "max_rate_limit_wait_secs",
                description: "遇到限流时最多等待的秒数",
            },
            FieldMeta {
                name: "top_n_size",
                description: "报告中列出的最大条目数量",
            },
            FieldMeta {
                name: "top_n_recent",
                description: "报告中列出的最近更新条目数量",
            },
            FieldMeta {
                name: "progress_bar",
                description: "是否显示下载进度条",
            },
        ];
        &FIELDS
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Validation(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }

    pub fn backup_root(&self) -> PathBuf {
        PathBuf::from(&self.backup_dir)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.backup_root().join("reports")
    }

    /// 读取一次机器并行度；调度器只接收这个快照。
    pub fn available_parallelism(&self) -> usize {
        if self.max_workers > 0 {
            // 显式指定的 worker 数需要为编排线程再留出一份。
            return self.max_workers.saturating_add(1);
        }
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(5)
    }

    pub fn token(&self) -> Option<String> {
        let name = self.token_env.trim();
        if name.is_empty() {
            return None;
        }
        std::env::var(name)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

fn default_true() -> bool {
    true
}

fn default_backup_dir() -> String {
    "backup".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_sequential_threshold() -> usize {
    5
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_page_size() -> usize {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_rate_limit_wait_secs() -> u64 {
    300
}

fn default_top_n_size() -> usize {
    10
}

fn default_top_n_recent() -> usize {
    5
}
