use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::mutate::LayerCompression;

/// created_by recorded when nothing else is configured
pub const DEFAULT_CREATED_BY: &str = "repack";

/// defaults read from a TOML file
///
/// ```toml
/// [history]
/// author = "builder <builds@example.com>"
/// created_by = "repack"
///
/// [layer]
/// compression = "gzip"
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub history: HistoryDefaults,
    #[serde(default)]
    pub layer: LayerDefaults,
}

/// history fields applied when the caller gives none
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryDefaults {
    /// author; the base image's author when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

impl Default for HistoryDefaults {
    fn default() -> Self {
        Self {
            author: None,
            created_by: default_created_by(),
        }
    }
}

fn default_created_by() -> String {
    DEFAULT_CREATED_BY.to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDefaults {
    #[serde(default)]
    pub compression: LayerCompression,
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.history.created_by, "repack");
        assert_eq!(config.history.author, None);
        assert_eq!(config.layer.compression, LayerCompression::Gzip);
    }

    #[test]
    fn test_parse() {
        let config: Config = toml::from_str(
            r#"
            [history]
            author = "ci"

            [layer]
            compression = "none"
            "#,
        )
        .unwrap();
        assert_eq!(config.history.author.as_deref(), Some("ci"));
        assert_eq!(config.history.created_by, "repack");
        assert_eq!(config.layer.compression, LayerCompression::None);
    }

    #[test]
    fn test_unknown_compression() {
        let result: std::result::Result<Config, _> = toml::from_str("[layer]\ncompression = \"lz4\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repack.toml");

        let mut config = Config::default();
        config.history.author = Some("someone".into());
        config.history.created_by = "pipeline".into();
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_missing() {
        let dir = tempdir().unwrap();
        let result = Config::load(&dir.path().join("nope.toml"));
        let err = result.unwrap_err();
        assert!(matches!(err, Error::ConfigFile { .. }));
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }
}
