//! Store configuration, loaded from YAML or built in code.
//!
//! ```yaml
//! backend:
//!   type: sqlite
//!   path: data/cushion.db
//! id_strategy: ulid
//! map_workers: 4
//! step_limit: 500000
//! ```

use crate::document::IdStrategy;
use crate::error::{CushionError, Result};
use crate::query::executor::DEFAULT_STEP_LIMIT;
use crate::query::MapSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CushionConfig {
    pub backend: BackendConfig,
    pub id_strategy: IdStrategy,
    /// Threads used to run map functions during a query
    pub map_workers: usize,
    /// Interpreter steps allowed per document before the map fails
    pub step_limit: u64,
}

impl Default for CushionConfig {
    fn default() -> Self {
        CushionConfig {
            backend: BackendConfig::Memory,
            id_strategy: IdStrategy::default(),
            map_workers: 1,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }
}

impl CushionConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        CushionConfig {
            backend: BackendConfig::Sqlite { path: path.into() },
            ..Self::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CushionConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML config file. A relative sqlite path is resolved against
    /// the directory containing the file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;

        if let BackendConfig::Sqlite { path: db_path } = &mut config.backend {
            if db_path.is_relative() {
                if let Some(dir) = path.parent() {
                    *db_path = dir.join(&*db_path);
                }
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.map_workers == 0 {
            return Err(CushionError::Config("map_workers must be at least 1".into()));
        }
        if self.step_limit == 0 {
            return Err(CushionError::Config("step_limit must be at least 1".into()));
        }
        if let BackendConfig::Sqlite { path } = &self.backend {
            if path.as_os_str().is_empty() {
                return Err(CushionError::Config("sqlite backend needs a path".into()));
            }
        }
        Ok(())
    }

    pub fn map_settings(&self) -> MapSettings {
        MapSettings {
            workers: self.map_workers,
            step_limit: self.step_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CushionConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, CushionConfig::default());
        assert_eq!(config.backend, BackendConfig::Memory);
        assert_eq!(config.id_strategy, IdStrategy::Uuid);
        assert_eq!(config.map_settings(), MapSettings::default());
    }

    #[test]
    fn test_parse_sqlite_config() {
        let yaml = r#"
backend:
  type: sqlite
  path: /var/lib/cushion.db
id_strategy: nanoid
map_workers: 4
step_limit: 5000
"#;
        let config = CushionConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.backend, BackendConfig::Sqlite { path: "/var/lib/cushion.db".into() });
        assert_eq!(config.id_strategy, IdStrategy::Nanoid);
        assert_eq!(config.map_settings(), MapSettings { workers: 4, step_limit: 5000 });
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = CushionConfig::from_yaml_str("map_workers: 0").unwrap_err();
        assert!(matches!(err, CushionError::Config(_)));

        let err = CushionConfig::from_yaml_str("id_strategy: sequential").unwrap_err();
        assert!(matches!(err, CushionError::Yaml(_)));

        let err = CushionConfig::from_yaml_str("unknown_key: 1").unwrap_err();
        assert!(matches!(err, CushionError::Yaml(_)));
    }

    #[test]
    fn test_load_resolves_relative_db_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cushion.yaml");
        std::fs::write(&file, "backend:\n  type: sqlite\n  path: data/store.db\n").unwrap();

        let config = CushionConfig::load(&file).unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Sqlite { path: dir.path().join("data/store.db") }
        );
    }
}
