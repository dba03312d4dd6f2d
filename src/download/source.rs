//! 条目来源：分页读取条目描述，并展平为惰性迭代器。
//!
//! 远端 API 客户端不在本 crate 内；`ManifestSource` 读取其导出的 JSON 清单。

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::models::ItemDescriptor;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid page cursor: {0}")]
    Cursor(String),
}

#[derive(Debug, Default)]
pub struct Page {
    pub items: Vec<ItemDescriptor>,
    pub next_cursor: Option<String>,
}

pub trait ItemSource {
    fn next_page(&mut self, cursor: Option<&str>) -> Result<Page, SourceError>;

    /// 已知的条目总数（用于进度条），未知时为 None。
    fn total_hint(&self) -> Option<usize> {
        None
    }
}

/// 惰性展平：当前页耗尽时才请求下一页。
pub struct PagedItems<S: ItemSource> {
    source: S,
    buffer: std::vec::IntoIter<ItemDescriptor>,
    cursor: Option<String>,
    finished: bool,
    error: Option<SourceError>,
    pages: usize,
}

impl<S: ItemSource> PagedItems<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            buffer: Vec::new().into_iter(),
            cursor: None,
            finished: false,
            error: None,
            pages: 0,
        }
    }

    pub fn total_hint(&self) -> Option<usize> {
        self.source.total_hint()
    }

    /// 分页失败时迭代提前结束，错误在此取回。
    pub fn take_error(&mut self) -> Option<SourceError> {
        self.error.take()
    }
}

impl<S: ItemSource> Iterator for PagedItems<S> {
    type Item = ItemDescriptor;

    fn next(&mut self) -> Option<ItemDescriptor> {
        loop {
            if let Some(item) = self.buffer.next() {
                return Some(item);
            }
            if self.finished {
                return None;
            }
            match self.source.next_page(self.cursor.as_deref()) {
                Ok(page) => {
                    self.pages += 1;
                    debug!(target: "source", page = self.pages, items = page.items.len(), "拉取分页");
                    self.finished = page.next_cursor.is_none();
                    self.cursor = page.next_cursor;
                    self.buffer = page.items.into_iter();
                }
                Err(err) => {
                    warn!(target: "source", error = %err, "分页拉取失败，停止枚举");
                    self.finished = true;
                    self.error = Some(err);
                    return None;
                }
            }
        }
    }
}

pub struct ManifestSource {
    items: Vec<ItemDescriptor>,
    page_size: usize,
}

impl ManifestSource {
    pub fn open(path: &Path, page_size: usize) -> Result<Self, SourceError> {
        let raw = fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let items: Vec<ItemDescriptor> =
            serde_json::from_str(&raw).map_err(|source| SourceError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_items(items, page_size))
    }

    pub fn from_items(items: Vec<ItemDescriptor>, page_size: usize) -> Self {
        Self {
            items,
            page_size: page_size.max(1),
        }
    }
}

impl ItemSource for ManifestSource {
    fn next_page(&mut self, cursor: Option<&str>) -> Result<Page, SourceError> {
        let offset = match cursor {
            None => 0,
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| SourceError::Cursor(c.to_string()))?,
        };
        let start = offset.min(self.items.len());
        let end = (start + self.page_size).min(self.items.len());
        let next_cursor = (end < self.items.len()).then(|| end.to_string());
        Ok(Page {
            items: self.items[start..end].to_vec(),
            next_cursor,
        })
    }

    fn total_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }
}
