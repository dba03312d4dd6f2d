//! 会话结果汇总与报告。
//!
//! - `aggregator` — OutcomeRecord → SessionStats（流式、幂等、可并发写入）
//! - `generator`  — SessionStats → 结构化 / 可读 / 摘要三种形式
//! - `sink`       — 报告落盘

pub mod aggregator;
pub mod generator;
pub mod sink;

pub use aggregator::{ResultAggregator, SessionMeta, SessionStats, SharedAggregator};
pub use generator::{render, render_error};
pub use sink::{FileReportSink, ReportSink};
