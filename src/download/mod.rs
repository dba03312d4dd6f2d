//! 下载编排模块入口。
//!
//! 子模块：
//! - `models`     — 数据模型（ItemDescriptor / DownloadTask / OutcomeRecord 等）
//! - `error`      — 传输错误分类
//! - `source`     — 条目来源与惰性分页
//! - `transfer`   — HTTP 流式下载
//! - `verify`     — zip 完整性校验
//! - `retry`      — 退避重试策略
//! - `task`       — 单任务尝试状态机
//! - `scheduler`  — 顺序 / 线程池调度
//! - `progress`   — CLI 进度条

pub mod error;
pub mod models;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod source;
pub(crate) mod task;
pub mod transfer;
pub mod verify;

pub use models::OutcomeRecord;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError};
