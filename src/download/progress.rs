//! 进度上报与 CLI 进度条管理。

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::models::OutcomeRecord;

/// 每条 OutcomeRecord 推进一格；可在 worker 线程上并发调用。
pub struct ProgressReporter {
    bar: Option<ProgressBar>,
}

impl ProgressReporter {
    /// `total` 未知时使用 spinner 形式。
    pub fn new(enabled: bool, total: Option<usize>) -> Self {
        if !enabled {
            return Self { bar: None };
        }

        let bar = match total {
            Some(n) => {
                let style = ProgressStyle::with_template(
                    "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} ({eta}) {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-");
                let bar = ProgressBar::with_draw_target(Some(n as u64), ProgressDrawTarget::stderr());
                bar.set_style(style);
                bar
            }
            None => {
                let style = ProgressStyle::with_template("{prefix} [{elapsed_precise}] {pos} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner());
                let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
                bar.set_style(style);
                bar
            }
        };
        bar.set_prefix("备份下载");
        Self { bar: Some(bar) }
    }

    pub fn record(&self, outcome: &OutcomeRecord) {
        let Some(bar) = self.bar.as_ref() else {
            return;
        };
        if !outcome.succeeded() {
            bar.set_message(format!("失败: {}", outcome.descriptor.display_name));
        }
        bar.inc(1);
    }

    pub fn finish(&self) {
        if let Some(bar) = self.bar.as_ref() {
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::models::{FailureReason, ItemDescriptor, ItemKind};

    fn outcome() -> OutcomeRecord {
        OutcomeRecord::unattempted(
            ItemDescriptor {
                id: "1".into(),
                display_name: "me/a".into(),
                source_url: "https://example.invalid/a.zip".into(),
                fallback_urls: Vec::new(),
                size_hint: None,
                updated_at: None,
                kind: ItemKind::Repository,
            },
            FailureReason::Interrupted,
            None,
        )
    }

    #[test]
    fn counts_one_step_per_outcome() {
        let progress = ProgressReporter::new(true, Some(3));
        progress.record(&outcome());
        progress.record(&outcome());
        assert_eq!(progress.bar.as_ref().unwrap().position(), 2);
        progress.finish();
    }

    #[test]
    fn disabled_reporter_is_inert() {
        let progress = ProgressReporter::new(false, Some(3));
        progress.record(&outcome());
        progress.finish();
        assert!(progress.bar.is_none());
    }
}
