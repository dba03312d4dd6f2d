//! 下载相关的数据模型定义。
//!
//! 包含条目描述（ItemDescriptor）、下载任务（DownloadTask）、单次尝试记录（AttemptRecord）
//! 与任务终态（OutcomeRecord）。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Repository,
    Gist,
}

impl ItemKind {
    pub fn label(self) -> &'static str {
        match self {
            ItemKind::Repository => "repository",
            ItemKind::Gist => "gist",
        }
    }
}

/// 由 Item Source 产生的只读条目描述。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDescriptor {
    pub id: String,
    pub display_name: String,
    #[serde(rename = "sourceURL", alias = "sourceUrl")]
    pub source_url: String,
    /// 主地址返回 404 时依次尝试（如 main.zip → master.zip）。
    #[serde(default)]
    pub fallback_urls: Vec<String>,
    #[serde(default)]
    pub size_hint: Option<u64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    pub kind: ItemKind,
}

impl ItemDescriptor {
    /// Primary URL first, then fallbacks.
    pub fn candidate_urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.source_url.as_str()).chain(self.fallback_urls.iter().map(|s| s.as_str()))
    }
}

/// 单个条目的下载生命周期，由执行它的 worker 独占。
#[derive(Debug)]
pub struct DownloadTask {
    pub descriptor: ItemDescriptor,
    pub destination: PathBuf,
    pub attempts: Vec<AttemptRecord>,
}

impl DownloadTask {
    pub fn new(descriptor: ItemDescriptor, destination: PathBuf) -> Self {
        Self {
            descriptor,
            destination,
            attempts: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptOutcome {
    Success,
    NetworkFailure,
    Timeout,
    IntegrityFailure,
    FilesystemFailure,
    RateLimited,
    Unauthorized,
    NotFound,
    Interrupted,
}

impl From<&TransferError> for AttemptOutcome {
    fn from(err: &TransferError) -> Self {
        match err {
            TransferError::Network(_) => AttemptOutcome::NetworkFailure,
            TransferError::Timeout(_) => AttemptOutcome::Timeout,
            TransferError::Integrity(_) => AttemptOutcome::IntegrityFailure,
            TransferError::Filesystem { .. } => AttemptOutcome::FilesystemFailure,
            TransferError::RateLimited { .. } => AttemptOutcome::RateLimited,
            TransferError::Unauthorized(_) => AttemptOutcome::Unauthorized,
            TransferError::NotFound(_) => AttemptOutcome::NotFound,
            TransferError::Interrupted => AttemptOutcome::Interrupted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt_number: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Backoff slept before this attempt started (0 for the first one).
    pub delay_before_ms: u64,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Succeeded,
    Failed,
}

/// 失败原因（报告中的 `reason` 字段）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Network,
    Timeout,
    Integrity,
    Filesystem,
    RateLimited,
    Unauthorized,
    NotFound,
    Interrupted,
    /// Destination could not be resolved; no attempt was made.
    InvalidDestination,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Network => "network",
            FailureReason::Timeout => "timeout",
            FailureReason::Integrity => "integrity",
            FailureReason::Filesystem => "filesystem",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::NotFound => "not_found",
            FailureReason::Interrupted => "interrupted",
            FailureReason::InvalidDestination => "invalid_destination",
        }
    }
}

impl From<&TransferError> for FailureReason {
    fn from(err: &TransferError) -> Self {
        match err {
            TransferError::Network(_) => FailureReason::Network,
            TransferError::Timeout(_) => FailureReason::Timeout,
            TransferError::Integrity(_) => FailureReason::Integrity,
            TransferError::Filesystem { .. } => FailureReason::Filesystem,
            TransferError::RateLimited { .. } => FailureReason::RateLimited,
            TransferError::Unauthorized(_) => FailureReason::Unauthorized,
            TransferError::NotFound(_) => FailureReason::NotFound,
            TransferError::Interrupted => FailureReason::Interrupted,
        }
    }
}

/// 任务终态，完成后不可变，交由 Result Aggregator 持有。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRecord {
    pub descriptor: ItemDescriptor,
    pub final_status: FinalStatus,
    pub attempts: Vec<AttemptRecord>,
    pub bytes_written: u64,
    pub total_duration_ms: u64,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl OutcomeRecord {
    pub fn succeeded(&self) -> bool {
        self.final_status == FinalStatus::Succeeded
    }

    /// 未开始即终止（中断 / 路径非法）的条目。
    pub fn unattempted(descriptor: ItemDescriptor, reason: FailureReason, message: Option<String>) -> Self {
        Self {
            descriptor,
            final_status: FinalStatus::Failed,
            attempts: Vec::new(),
            bytes_written: 0,
            total_duration_ms: 0,
            failure: Some(reason),
            last_error: message,
        }
    }
}
