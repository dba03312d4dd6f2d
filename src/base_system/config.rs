//! 配置文件读写与带注释生成。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid yaml at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldMeta {
    pub name: &'static str,
    pub description: &'static str,
}

pub trait ConfigSpec: Serialize + DeserializeOwned + Default {
    const FILE_NAME: &'static str;
    fn fields() -> &'static [FieldMeta];
}

/// Load a config file, creating it with defaults when absent.
///
/// `config_path` overrides the default `FILE_NAME` in the current directory.
/// User values are merged over the defaults; if the file lacks any known
/// field it is rewritten with the full, commented field list.
pub fn load_or_create<T: ConfigSpec>(config_path: Option<&Path>) -> Result<T, ConfigError> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(T::FILE_NAME));

    if !path.exists() {
        let default_config = T::default();
        write_with_comments(&default_config, &path)?;
        return Ok(default_config);
    }

    let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let user_yaml: Value = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })?;
    let incomplete = has_missing_fields::<T>(&user_yaml);

    let mut merged = serde_yaml::to_value(T::default())
        .map_err(|err| ConfigError::Validation(err.to_string()))?;
    merge_values(&mut merged, user_yaml);

    let config: T =
        serde_yaml::from_value(merged).map_err(|err| ConfigError::Validation(err.to_string()))?;

    if incomplete {
        write_with_comments(&config, &path)?;
    }

    Ok(config)
}

pub fn write_with_comments<T: ConfigSpec>(config: &T, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let yaml = generate_yaml_with_comments(config)?;
    fs::write(path, yaml).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn generate_yaml_with_comments<T: ConfigSpec>(config: &T) -> Result<String, ConfigError> {
    let Value::Mapping(mapping) =
        serde_yaml::to_value(config).map_err(|err| ConfigError::Validation(err.to_string()))?
    else {
        return Err(ConfigError::Validation(
            "config must serialize to a mapping".to_string(),
        ));
    };

    let mut lines = Vec::with_capacity(T::fields().len() * 2);
    for field in T::fields() {
        if !field.description.is_empty() {
            lines.push(format!("# {}", field.description.replace('\n', "\n# ")));
        }
        let key = Value::String(field.name.to_string());
        let val = mapping.get(&key).cloned().unwrap_or(Value::Null);
        let yaml_line = serde_yaml::to_string(&Mapping::from_iter([(key, val)]))
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        lines.push(yaml_line.trim().to_string());
    }
    lines.push(String::new());

    Ok(lines.join("\n"))
}

fn has_missing_fields<T: ConfigSpec>(user_yaml: &Value) -> bool {
    let Value::Mapping(map) = user_yaml else {
        return true;
    };
    T::fields()
        .iter()
        .any(|field| !map.contains_key(Value::String(field.name.to_string())))
}

fn merge_values(default: &mut Value, user: Value) {
    match (default, user) {
        (Value::Mapping(dest), Value::Mapping(src)) => {
            for (key, user_val) in src {
                if let Some(dest_val) = dest.get_mut(&key) {
                    merge_values(dest_val, user_val);
                } else {
                    dest.insert(key, user_val);
                }
            }
        }
        // `key:` with no value keeps the default.
        (_, Value::Null) => {}
        (dest, other) => {
            *dest = other;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_system::context::Config;

    #[test]
    fn creates_commented_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gh-vault.yml");

        let cfg: Config = load_or_create(Some(&path)).unwrap();
        assert_eq!(cfg.max_attempts, 3);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("# 每个条目的最大尝试次数"));
        assert!(text.contains("max_attempts: 3"));
    }

    #[test]
    fn merges_partial_file_and_backfills_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gh-vault.yml");
        fs::write(&path, "max_workers: 6\ntimeout_secs: 90\n").unwrap();

        let cfg: Config = load_or_create(Some(&path)).unwrap();
        assert_eq!(cfg.max_workers, 6);
        assert_eq!(cfg.timeout_secs, 90);
        assert_eq!(cfg.top_n_size, 10);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("max_workers: 6"));
        assert!(text.contains("top_n_recent: 5"));
    }

    #[test]
    fn reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gh-vault.yml");
        fs::write(&path, "max_workers: [unterminated\n").unwrap();

        let err = load_or_create::<Config>(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
