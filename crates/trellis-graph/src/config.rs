//! Engine configuration.
//!
//! Loaded from a TOML file (by default `$TRELLIS_DATA_DIR/engine.toml`).
//! Every field has a default, so a missing file or a partial file is fine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Root configuration for a [`GraphEngine`](crate::GraphEngine).
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Flush the dirty set through the context indexer after each mutation.
    #[serde(default)]
    pub index_after_mutation: bool,

    #[serde(default)]
    pub context: ContextConfig,
}

/// Surround context settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    /// Maximum length, in characters, of a context string.
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Joins context items.
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_database_path() -> PathBuf {
    data_dir().join("trellis.db")
}

fn default_max_connections() -> u32 {
    4
}

fn default_max_length() -> usize {
    110
}

fn default_separator() -> String {
    "{{".to_string()
}

/// Base data directory: `TRELLIS_DATA_DIR`, else `$HOME/.trellis`, else `.trellis`.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("TRELLIS_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".trellis");
    }
    PathBuf::from(".trellis")
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            separator: default_separator(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_connections: default_max_connections(),
            index_after_mutation: false,
            context: ContextConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("engine.toml")
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)?;
        if config.context.separator.is_empty() {
            anyhow::bail!("context.separator must not be empty");
        }
        Ok(config)
    }

    /// Config for an in-memory database; used by tests and tooling.
    pub fn in_memory() -> Self {
        Self {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1,
            ..Default::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == ":memory:"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.context.max_length, 110);
        assert_eq!(config.context.separator, "{{");
        assert!(!config.index_after_mutation);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
database_path = "/tmp/graph.db"
index_after_mutation = true

[context]
max_length = 64
"#;
        let config = EngineConfig::from_toml(toml).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/graph.db"));
        assert!(config.index_after_mutation);
        assert_eq!(config.context.max_length, 64);
        assert_eq!(config.context.separator, "{{");
        assert_eq!(config.max_connections, 4);
    }

    #[test]
    fn test_rejects_empty_separator() {
        let toml = r#"
[context]
separator = ""
"#;
        assert!(EngineConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = EngineConfig::load(Path::new("/nonexistent/trellis/engine.toml")).unwrap();
        assert_eq!(config.context.max_length, 110);
    }
}
