//! 报告落盘。

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::info;

use super::generator::RenderedReport;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("cannot write report {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedReport {
    pub structured: PathBuf,
    pub human: PathBuf,
    pub summary: PathBuf,
}

pub trait ReportSink {
    fn persist(&self, report: &RenderedReport) -> Result<SavedReport, ReportError>;

    /// 会话级致命错误的排错报告。
    fn persist_error(&self, text: &str) -> Result<PathBuf, ReportError>;
}

/// 写入 `<dir>/backup_report_<ts>.json|.txt` 与 `<dir>/backup_summary_<ts>.txt`。
pub struct FileReportSink {
    dir: PathBuf,
    stamp: String,
}

impl FileReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_time(dir, OffsetDateTime::now_utc())
    }

    pub fn with_time(dir: impl Into<PathBuf>, at: OffsetDateTime) -> Self {
        let stamp = at
            .format(format_description!(
                "[year][month][day]_[hour][minute][second]"
            ))
            .unwrap_or_else(|_| at.unix_timestamp().to_string());
        Self {
            dir: dir.into(),
            stamp,
        }
    }

    fn path_for(&self, prefix: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{prefix}_{}.{ext}", self.stamp))
    }

    fn ensure_dir(&self) -> Result<(), ReportError> {
        fs::create_dir_all(&self.dir).map_err(|source| ReportError::Io {
            path: self.dir.clone(),
            source,
        })
    }
}

impl ReportSink for FileReportSink {
    fn persist(&self, report: &RenderedReport) -> Result<SavedReport, ReportError> {
        self.ensure_dir()?;
        let saved = SavedReport {
            structured: self.path_for("backup_report", "json"),
            human: self.path_for("backup_report", "txt"),
            summary: self.path_for("backup_summary", "txt"),
        };

        let json = serde_json::to_vec_pretty(&report.structured)?;
        write_atomic(&saved.structured, &json)?;
        write_atomic(&saved.human, report.human.as_bytes())?;
        write_atomic(&saved.summary, format!("{}\n", report.summary).as_bytes())?;

        info!(target: "report", dir = %self.dir.display(), "报告已保存");
        Ok(saved)
    }

    fn persist_error(&self, text: &str) -> Result<PathBuf, ReportError> {
        self.ensure_dir()?;
        let path = self.path_for("backup_error", "txt");
        write_atomic(&path, text.as_bytes())?;
        Ok(path)
    }
}

/// 先写 `*.part` 再 rename，读者不会看到写了一半的报告。
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ReportError> {
    let tmp = path.with_extension(format!(
        "{}.part",
        path.extension().and_then(|s| s.to_str()).unwrap_or("")
    ));
    fs::write(&tmp, bytes).map_err(|source| ReportError::Io {
        path: tmp.clone(),
        source,
    })?;
    // Windows 上 rename 不会覆盖已存在的文件
    let _ = fs::remove_file(path);
    fs::rename(&tmp, path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
