//! 报告渲染：SessionStats → 结构化报告 / 可读报告 / 一行摘要。
//!
//! 纯函数，不做任何 IO；落盘交给 [`super::sink::ReportSink`]。

use std::fmt::Write as _;

use serde::Serialize;
use time::OffsetDateTime;
use time::macros::format_description;

use super::aggregator::{FailureEntry, KindStats, SessionStats, TopEntry};
use crate::download::models::{FailureReason, ItemKind};

const RULE_WIDE: usize = 60;
const RULE_NARROW: usize = 40;
const MAX_LISTED_FAILURES: usize = 10;
const NAME_WIDTH: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// 100%
    Perfect,
    /// ≥ 95%
    Good,
    /// 80% ~ 95%
    Attention,
    /// < 80%
    Poor,
}

impl Health {
    pub fn classify(success_rate: f64) -> Self {
        if success_rate >= 100.0 {
            Health::Perfect
        } else if success_rate >= 95.0 {
            Health::Good
        } else if success_rate >= 80.0 {
            Health::Attention
        } else {
            Health::Poor
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Health::Perfect | Health::Good => "good",
            Health::Attention => "attention",
            Health::Poor => "poor",
        }
    }

    pub fn headline(self) -> &'static str {
        match self {
            Health::Perfect => "PERFECT SUCCESS! All items downloaded successfully.",
            Health::Good => "EXCELLENT! Almost all items downloaded successfully.",
            Health::Attention => "GOOD, but some items failed. Consider checking the items below.",
            Health::Poor => "POOR SUCCESS RATE. Issues detected, review the failures below.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
}

impl From<&KindStats> for KindReport {
    fn from(k: &KindStats) -> Self {
        Self {
            total: k.total,
            succeeded: k.succeeded,
            failed: k.failed,
            success_rate: round1(k.success_rate()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ByKind {
    pub repositories: KindReport,
    pub gists: KindReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetadata {
    pub backup_path: String,
    pub backup_size: String,
    pub workers: usize,
    pub timeout_secs: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredReport {
    pub total_items: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub total_bytes: u64,
    pub duration_ms: u64,
    pub top_by_size: Vec<TopEntry>,
    pub top_by_recency: Vec<TopEntry>,
    pub failures: Vec<FailureEntry>,
    pub health: Health,
    pub recommendations: Vec<String>,
    pub by_kind: ByKind,
    pub total_attempts: usize,
    pub retried_items: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ReportMetadata>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedReport {
    pub structured: StructuredReport,
    pub human: String,
    pub summary: String,
}

pub fn render(stats: &SessionStats) -> RenderedReport {
    let rate = stats.success_rate();
    let health = Health::classify(rate);
    let recommendations = recommendations(stats, health);

    let structured = StructuredReport {
        total_items: stats.total_items,
        succeeded: stats.succeeded,
        failed: stats.failed,
        success_rate: round1(rate),
        total_bytes: stats.total_bytes,
        duration_ms: stats.duration_ms,
        top_by_size: stats.top_by_size.clone(),
        top_by_recency: stats.top_by_recency.clone(),
        failures: stats.failures.clone(),
        health,
        recommendations: recommendations.clone(),
        by_kind: ByKind {
            repositories: KindReport::from(&stats.repositories),
            gists: KindReport::from(&stats.gists),
        },
        total_attempts: stats.total_attempts,
        retried_items: stats.retried_items,
        metadata: stats.meta.as_ref().map(|m| ReportMetadata {
            backup_path: m.backup_path.display().to_string(),
            backup_size: format_size(stats.total_bytes),
            workers: m.workers,
            timeout_secs: m.timeout_secs,
            generated_at: m.generated_at,
            interrupted: m.interrupted,
        }),
    };

    RenderedReport {
        human: render_human(stats, health, &recommendations),
        summary: render_summary(stats, health),
        structured,
    }
}

/// 健康等级文字 + 针对具体问题的建议。
fn recommendations(stats: &SessionStats, health: Health) -> Vec<String> {
    let mut out = vec![health.headline().to_string()];
    if stats.repositories.failed > 0 {
        out.push(format!(
            "{} repositories failed - check URLs and permissions",
            stats.repositories.failed
        ));
    }
    if stats.gists.failed > 0 {
        out.push(format!(
            "{} gists failed - gists may be private or deleted",
            stats.gists.failed
        ));
    }
    let rate_limited = count_reason(&stats.failures, FailureReason::RateLimited);
    if rate_limited > 0 {
        out.push(format!(
            "{rate_limited} items hit the API rate limit - rerun later or raise max_rate_limit_wait_secs"
        ));
    }
    if let Some(meta) = stats.meta.as_ref() {
        if meta.interrupted {
            out.push("Backup was interrupted - rerun to fetch the remaining items".to_string());
        }
        if meta.workers <= 1 {
            out.push("Consider increasing parallel workers for faster downloads".to_string());
        }
        if meta.timeout_secs < 60 && stats.total_items > 50 {
            out.push("Consider increasing timeout for large downloads".to_string());
        }
    }
    out
}

fn count_reason(failures: &[FailureEntry], reason: FailureReason) -> usize {
    failures.iter().filter(|f| f.reason == reason).count()
}

fn render_human(stats: &SessionStats, health: Health, recommendations: &[String]) -> String {
    let mut s = String::new();
    let wide = "=".repeat(RULE_WIDE);
    let narrow = "-".repeat(RULE_NARROW);

    let _ = writeln!(s, "GITHUB BACKUP REPORT");
    let _ = writeln!(s, "{wide}");
    if let Some(meta) = stats.meta.as_ref() {
        let _ = writeln!(s, "Generated: {}", format_time(meta.generated_at));
    }
    let _ = writeln!(s, "Duration:  {}", format_duration(stats.duration_ms));
    let _ = writeln!(s);

    let _ = writeln!(s, "OPERATIONS SUMMARY");
    let _ = writeln!(s, "{narrow}");
    if stats.total_items == 0 {
        let _ = writeln!(s, "No items were processed");
    } else {
        let _ = writeln!(s, "Repositories: {} total", stats.repositories.total);
        let _ = writeln!(s, "Gists:        {} total", stats.gists.total);
    }
    if let Some(meta) = stats.meta.as_ref() {
        let _ = writeln!(s, "Backup location: {}", meta.backup_path.display());
        let _ = writeln!(
            s,
            "Workers: {}    Timeout: {}s",
            meta.workers, meta.timeout_secs
        );
    }
    let _ = writeln!(s, "Backup size: {}", format_size(stats.total_bytes));
    let _ = writeln!(
        s,
        "Attempts: {} ({} items needed a retry)",
        stats.total_attempts, stats.retried_items
    );
    let _ = writeln!(s);

    for kind in [ItemKind::Repository, ItemKind::Gist] {
        let k = stats.kind(kind);
        if k.total == 0 {
            continue;
        }
        let title = match kind {
            ItemKind::Repository => "REPOSITORIES",
            ItemKind::Gist => "GISTS",
        };
        let _ = writeln!(s, "{title}");
        let _ = writeln!(s, "{narrow}");
        let _ = writeln!(s, "Total:      {}", k.total);
        let _ = writeln!(
            s,
            "Successful: {} ({:.1}%)",
            k.succeeded,
            k.success_rate()
        );
        let _ = writeln!(
            s,
            "Failed:     {} ({:.1}%)",
            k.failed,
            100.0 - k.success_rate()
        );
        let _ = writeln!(s);
    }

    if !stats.top_by_size.is_empty() {
        let _ = writeln!(s, "TOP {} LARGEST ITEMS:", stats.top_by_size.len());
        for (i, e) in stats.top_by_size.iter().enumerate() {
            let _ = writeln!(
                s,
                "  {:2}. {} {:<width$} {:>10}",
                i + 1,
                mark(e.succeeded),
                clip(&e.display_name, NAME_WIDTH),
                format_size(e.bytes),
                width = NAME_WIDTH
            );
        }
        let _ = writeln!(s);
    }

    if !stats.top_by_recency.is_empty() {
        let _ = writeln!(s, "RECENTLY UPDATED:");
        for (i, e) in stats.top_by_recency.iter().enumerate() {
            let date = e.updated_at.map(format_date).unwrap_or_default();
            let _ = writeln!(
                s,
                "  {:2}. {} {:<width$} {}",
                i + 1,
                mark(e.succeeded),
                clip(&e.display_name, NAME_WIDTH),
                date,
                width = NAME_WIDTH
            );
        }
        let _ = writeln!(s);
    }

    if !stats.failures.is_empty() {
        let _ = writeln!(s, "FAILED ITEMS");
        let _ = writeln!(s, "{narrow}");
        for (i, f) in stats.failures.iter().take(MAX_LISTED_FAILURES).enumerate() {
            let _ = write!(
                s,
                "  {:2}. [{}] {} ({}) - {} after {} attempt(s)",
                i + 1,
                f.kind.label(),
                clip(&f.display_name, NAME_WIDTH),
                f.id,
                f.reason.as_str(),
                f.attempts
            );
            match f.last_error.as_deref() {
                Some(err) => {
                    let _ = writeln!(s, ": {err}");
                }
                None => {
                    let _ = writeln!(s);
                }
            }
        }
        if stats.failures.len() > MAX_LISTED_FAILURES {
            let _ = writeln!(
                s,
                "     ... and {} more",
                stats.failures.len() - MAX_LISTED_FAILURES
            );
        }
        let _ = writeln!(s);
    }

    let _ = writeln!(s, "INSIGHTS & RECOMMENDATIONS");
    let _ = writeln!(s, "{narrow}");
    if let Some((headline, rest)) = recommendations.split_first() {
        let _ = writeln!(s, "{headline}");
        for r in rest {
            let _ = writeln!(s, "  * {r}");
        }
    }
    let _ = writeln!(s);

    let _ = writeln!(s, "{wide}");
    let _ = writeln!(
        s,
        "Success rate: {:.1}% ({})",
        stats.success_rate(),
        health.label()
    );
    s
}

fn render_summary(stats: &SessionStats, health: Health) -> String {
    let mut line = format!(
        "Backup {}: {}/{} succeeded ({:.1}%), {} failed, {} in {}",
        health.label(),
        stats.succeeded,
        stats.total_items,
        stats.success_rate(),
        stats.failed,
        format_size(stats.total_bytes),
        format_duration(stats.duration_ms)
    );
    if stats.meta.as_ref().is_some_and(|m| m.interrupted) {
        line.push_str(" [interrupted]");
    }
    line
}

/// 会话级致命错误（如鉴权失败）时的排错说明。
pub fn render_error(message: &str, at: OffsetDateTime) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "BACKUP ERROR REPORT");
    let _ = writeln!(s, "{}", "=".repeat(RULE_WIDE));
    let _ = writeln!(s, "Time: {}", format_time(at));
    let _ = writeln!(s, "Error: {message}");
    let _ = writeln!(s);
    let _ = writeln!(s, "TROUBLESHOOTING:");
    for tip in [
        "Check GitHub token validity and permissions",
        "Verify internet connection",
        "Ensure sufficient disk space",
        "Check GitHub API rate limits",
        "Run again with --debug for details",
    ] {
        let _ = writeln!(s, "  * {tip}");
    }
    let _ = writeln!(s);
    let _ = writeln!(s, "For assistance, include this report in your issue.");
    s
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    for unit in &UNITS[..UNITS.len() - 1] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} {}", UNITS[UNITS.len() - 1])
}

fn format_duration(ms: u64) -> String {
    if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        let secs = ms / 1000;
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}

fn format_time(t: OffsetDateTime) -> String {
    t.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| t.to_string())
}

fn format_date(t: OffsetDateTime) -> String {
    t.format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| t.date().to_string())
}

fn mark(ok: bool) -> &'static str {
    if ok { "[ok]" } else { "[x] " }
}

fn clip(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    let mut s: String = name.chars().take(max.saturating_sub(3)).collect();
    s.push_str("...");
    s
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
