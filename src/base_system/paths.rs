//! 备份目录布局与目标路径解析。
//!
//! repositories → `<root>/repositories/<name>.zip`，gists → `<root>/gists/<id>.zip`。
//! 同一会话内每个条目的路径唯一，多个 worker 不会写同一个文件。

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::download::models::{ItemDescriptor, ItemKind};

const MAX_NAME_LEN: usize = 120;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path escapes backup directory: {0}")]
    Traversal(PathBuf),
    #[error("cannot create directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// 外部协作者：为条目给出唯一且互不冲突的目标路径。
pub trait DestinationResolver: Send + Sync {
    fn resolve(&self, item: &ItemDescriptor) -> Result<PathBuf, PathError>;
}

pub struct LayoutResolver {
    root: PathBuf,
    claimed: Mutex<HashSet<PathBuf>>,
}

impl LayoutResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn kind_dir(&self, kind: ItemKind) -> PathBuf {
        match kind {
            ItemKind::Repository => self.root.join("repositories"),
            ItemKind::Gist => self.root.join("gists"),
        }
    }

    /// 预先创建 repositories/ 与 gists/。
    pub fn prepare(&self) -> Result<(), PathError> {
        for kind in [ItemKind::Repository, ItemKind::Gist] {
            let dir = self.kind_dir(kind);
            std::fs::create_dir_all(&dir).map_err(|source| PathError::Io { path: dir, source })?;
        }
        Ok(())
    }

    fn stem_for(item: &ItemDescriptor) -> String {
        match item.kind {
            ItemKind::Repository => {
                // owner/name → name
                let name = item
                    .display_name
                    .rsplit('/')
                    .find(|s| !s.trim().is_empty())
                    .unwrap_or(&item.id);
                safe_fs_name(name, "_", MAX_NAME_LEN)
            }
            ItemKind::Gist => safe_fs_name(&item.id, "_", MAX_NAME_LEN),
        }
    }
}

impl DestinationResolver for LayoutResolver {
    fn resolve(&self, item: &ItemDescriptor) -> Result<PathBuf, PathError> {
        let dir = self.kind_dir(item.kind);
        let stem = Self::stem_for(item);
        let mut candidate = dir.join(format!("{stem}.zip"));
        ensure_within(&dir, &candidate)?;

        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        if claimed.contains(&candidate) {
            let id = safe_fs_name(&item.id, "_", MAX_NAME_LEN);
            candidate = dir.join(format!("{stem}-{id}.zip"));
            let mut n = 2usize;
            while claimed.contains(&candidate) {
                candidate = dir.join(format!("{stem}-{id}-{n}.zip"));
                n += 1;
            }
            ensure_within(&dir, &candidate)?;
        }
        claimed.insert(candidate.clone());
        Ok(candidate)
    }
}

fn ensure_within(dir: &Path, candidate: &Path) -> Result<(), PathError> {
    let rel = candidate
        .strip_prefix(dir)
        .map_err(|_| PathError::Traversal(candidate.to_path_buf()))?;
    let mut components = rel.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(PathError::Traversal(candidate.to_path_buf())),
    }
}

pub fn safe_fs_name(name: &str, replacement: &str, max_len: usize) -> String {
    let fallback = replacement.chars().next().unwrap_or('_');
    let mut cleaned: String = name
        .trim()
        .chars()
        .map(|ch| match ch {
            ':' | '"' | '<' | '>' | '/' | '\\' | '|' | '?' | '*' => fallback,
            c if (c as u32) < 32 => fallback,
            _ => ch,
        })
        .collect();

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }
    while cleaned.starts_with('.') {
        cleaned.remove(0);
    }

    if cleaned.is_empty() {
        cleaned.push_str("unnamed");
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if RESERVED.contains(&cleaned.to_uppercase().as_str()) {
        cleaned = format!("_{cleaned}");
    }

    if cleaned.len() > max_len {
        let mut end = max_len;
        while !cleaned.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        cleaned.truncate(end);
    }

    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn item(id: &str, name: &str, kind: ItemKind) -> ItemDescriptor {
        ItemDescriptor {
            id: id.to_string(),
            display_name: name.to_string(),
            source_url: format!("https://example.invalid/{id}.zip"),
            fallback_urls: Vec::new(),
            size_hint: None,
            updated_at: None,
            kind,
        }
    }

    #[test]
    fn lays_out_by_kind() {
        let resolver = LayoutResolver::new("/backup");
        let repo = resolver
            .resolve(&item("1", "octocat/hello-world", ItemKind::Repository))
            .unwrap();
        assert_eq!(repo, PathBuf::from("/backup/repositories/hello-world.zip"));

        let gist = resolver
            .resolve(&item("aa11bb", "notes", ItemKind::Gist))
            .unwrap();
        assert_eq!(gist, PathBuf::from("/backup/gists/aa11bb.zip"));
    }

    #[test]
    fn collisions_get_unique_paths() {
        let resolver = LayoutResolver::new("/backup");
        let a = resolver
            .resolve(&item("1", "alice/tools", ItemKind::Repository))
            .unwrap();
        let b = resolver
            .resolve(&item("2", "bob/tools", ItemKind::Repository))
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(b, PathBuf::from("/backup/repositories/tools-2.zip"));
    }

    #[test]
    fn hostile_names_stay_inside_kind_dir() {
        let resolver = LayoutResolver::new("/backup");
        for name in ["..", "../../etc", "a/..", "..\\..\\x", "  ", "CON"] {
            let path = resolver
                .resolve(&item(name, name, ItemKind::Repository))
                .unwrap();
            assert_eq!(path.parent(), Some(Path::new("/backup/repositories")));
        }
    }

    #[test]
    fn concurrent_resolution_never_hands_out_the_same_path() {
        let resolver = Arc::new(LayoutResolver::new("/backup"));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let resolver = Arc::clone(&resolver);
                std::thread::spawn(move || {
                    resolver
                        .resolve(&item(&i.to_string(), "same/name", ItemKind::Repository))
                        .unwrap()
                })
            })
            .collect();
        let paths: HashSet<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(paths.len(), 8);
    }

    #[test]
    fn safe_name_replaces_forbidden_characters() {
        assert_eq!(safe_fs_name("a:b*c?", "_", 50), "a_b_c_");
        assert_eq!(safe_fs_name("name. ", "_", 50), "name");
        assert_eq!(safe_fs_name("", "_", 50), "unnamed");
        assert_eq!(safe_fs_name("nul", "_", 50), "_nul");
        assert_eq!(safe_fs_name("abcdef", "_", 3), "abc");
    }
}
