//! Engine configuration.
//!
//! Loaded from TOML. Every table and field is optional; missing values fall
//! back to the defaults below.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid engine config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid engine config: {0}")]
    Invalid(String),
}

/// How the tree manager materializes an execution tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingStrategy {
    /// Fetch every node of a case instance on first access.
    #[default]
    Prefetch,
    /// Fetch nodes and child lists one at a time as they are touched.
    Lazy,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TreeConfig {
    pub loading: LoadingStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// Treat a failing history handler as a transaction failure.
    pub fail_on_error: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            enabled: true,
            fail_on_error: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Upper bound on atomic operations performed by a single command.
    pub max_operations_per_command: usize,
    pub invoke_custom_variable_listeners: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            max_operations_per_command: 10_000,
            invoke_custom_variable_listeners: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub tree: TreeConfig,
    pub history: HistoryConfig,
    pub execution: ExecutionConfig,
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.max_operations_per_command == 0 {
            return Err(ConfigError::Invalid(
                "execution.max_operations_per_command must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.tree.loading, LoadingStrategy::Prefetch);
        assert!(config.history.enabled);
        assert!(!config.history.fail_on_error);
        assert_eq!(config.execution.max_operations_per_command, 10_000);
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [tree]
            loading = "lazy"

            [execution]
            max_operations_per_command = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.tree.loading, LoadingStrategy::Lazy);
        assert_eq!(config.execution.max_operations_per_command, 50);
        assert!(config.execution.invoke_custom_variable_listeners);
        assert!(config.history.enabled);
    }

    #[test]
    fn unknown_field_rejected() {
        let err = EngineConfig::from_toml_str("[tree]\nstrategy = \"lazy\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_budget_rejected() {
        let err = EngineConfig::from_toml_str("[execution]\nmax_operations_per_command = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = EngineConfig::load("/nonexistent/arbor-engine.toml").unwrap_err();
        match err {
            ConfigError::Io { path, .. } => assert!(path.ends_with("arbor-engine.toml")),
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}
