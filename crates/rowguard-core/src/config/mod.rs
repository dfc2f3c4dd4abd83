//! Configuration types for rowguard.
//!
//! Configuration is loaded from a single `rowguard.yaml`, optionally with the
//! tenancy section kept in a separate file referenced by `tenancy_file`.
//!
//! # Example
//!
//! ```yaml
//! dialect: postgres
//! tenancy:
//!   enabled: true
//!   global_tables: [sys_tenant]
//! operations:
//!   system.notice:
//!     tenant: true
//!   system.dept.select_list:
//!     tenant: true
//!     data_permission:
//!       table: sys_dept
//!       dept_column: dept_id
//! ```

pub mod permission;
pub mod tenancy;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub use permission::{CombineMode, DataPermissionConfig, DataPermissionRule, OperationRule};
pub use tenancy::{TableTenancyConfig, TenancyConfig};

/// Complete rowguard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowGuardConfig {
    /// SQL dialect used to parse and render statements.
    #[serde(default)]
    pub dialect: SqlDialectKind,

    /// Tenancy configuration (inline or from file).
    #[serde(default)]
    pub tenancy: TenancyConfig,

    /// Path to tenancy configuration file (alternative to inline).
    #[serde(default)]
    pub tenancy_file: Option<PathBuf>,

    /// Data-permission settings.
    #[serde(default)]
    pub data_permission: DataPermissionConfig,

    /// Rules keyed by operation id or operation namespace.
    #[serde(default)]
    pub operations: BTreeMap<String, OperationRule>,
}

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialectKind {
    #[default]
    Postgres,
    Mysql,
    Generic,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RowGuardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Load configuration, resolve `tenancy_file` relative to the
    /// configuration's directory, and validate the result.
    pub fn load_with_context(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = Self::from_file(path)?;

        let base_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        if let Some(tenancy_file) = &config.tenancy_file {
            config.tenancy = TenancyConfig::load_from_path(tenancy_file, &base_dir)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tenancy.validate()?;

        if self.data_permission.deny_predicate.trim().is_empty() {
            return Err(ConfigError::Config(
                "data_permission.deny_predicate must not be empty".to_string(),
            ));
        }

        for (operation_id, rule) in &self.operations {
            rule.validate(operation_id)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
dialect: mysql
tenancy:
  enabled: true
  global_tables: [sys_tenant]
operations:
  system.notice:
    tenant: true
  system.dept.select_list:
    tenant: true
    data_permission:
      table: sys_dept
      combine: and
"#;

    #[test]
    fn test_parse_full_config() {
        let config = RowGuardConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.dialect, SqlDialectKind::Mysql);
        assert!(config.tenancy.enabled);
        assert!(config.data_permission.enabled);
        assert_eq!(config.operations.len(), 2);

        let rule = &config.operations["system.dept.select_list"];
        let dp = rule.data_permission.as_ref().unwrap();
        assert_eq!(dp.table.as_deref(), Some("sys_dept"));
        assert_eq!(dp.combine, CombineMode::And);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_operation_is_fatal() {
        let config = RowGuardConfig::from_yaml(
            r#"
operations:
  system.user.list: {}
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Config(_))));
    }

    #[test]
    fn test_malformed_yaml() {
        let result = RowGuardConfig::from_yaml("operations: [not, a, map]");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_load_with_tenancy_file() {
        let dir = tempfile::tempdir().unwrap();

        let mut tenancy = fs::File::create(dir.path().join("tenancy.yaml")).unwrap();
        writeln!(tenancy, "enabled: true\ndefault_column: org_id").unwrap();

        let config_path = dir.path().join("rowguard.yaml");
        let mut file = fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            "tenancy_file: tenancy.yaml\noperations:\n  app.orders:\n    tenant: true"
        )
        .unwrap();

        let config = RowGuardConfig::load_with_context(&config_path).unwrap();
        assert!(config.tenancy.enabled);
        assert_eq!(config.tenancy.default_column, "org_id");
    }

    #[test]
    fn test_missing_tenancy_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("rowguard.yaml");
        fs::write(&config_path, "tenancy_file: missing.yaml\n").unwrap();

        let result = RowGuardConfig::load_with_context(&config_path);
        assert!(matches!(result, Err(ConfigError::Config(_))));
    }
}
