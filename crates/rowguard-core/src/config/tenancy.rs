//! Tenancy configuration for multi-tenant databases.
//!
//! This module defines whether tenant isolation is active, which column
//! carries the tenant id per table, and which tables are shared between
//! tenants.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::ConfigError;

/// Configuration for tenant isolation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenancyConfig {
    /// Master switch for multi-tenancy. When false, no tenant predicate is
    /// ever injected and dynamic tenant overrides are ignored.
    #[serde(default)]
    pub enabled: bool,

    /// Default column name for tenant isolation.
    /// Used when not overridden per-table.
    #[serde(default = "default_tenant_column")]
    pub default_column: String,

    /// Per-table tenant column configuration.
    #[serde(default)]
    pub tables: HashMap<String, TableTenancyConfig>,

    /// Tables that are global (no tenant scoping applied).
    #[serde(default)]
    pub global_tables: Vec<String>,

    /// Marker that identifies cache keys shared by all tenants.
    #[serde(default = "default_global_key_marker")]
    pub global_key_marker: String,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_column: default_tenant_column(),
            tables: HashMap::new(),
            global_tables: Vec::new(),
            global_key_marker: default_global_key_marker(),
        }
    }
}

/// Per-table tenancy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableTenancyConfig {
    /// The column name used for tenant isolation in this table.
    #[serde(default)]
    pub tenant_column: Option<String>,

    /// Whether this is a global table (no tenant scoping).
    #[serde(default)]
    pub global: bool,
}

impl TenancyConfig {
    /// Load tenancy configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Load tenancy configuration from a file path relative to a base directory.
    ///
    /// If the tenancy_file path is absolute, it is used directly.
    /// Otherwise, it is resolved relative to the base_dir.
    pub fn load_from_path(
        tenancy_file: impl AsRef<Path>,
        base_dir: impl AsRef<Path>,
    ) -> Result<Self, ConfigError> {
        let tenancy_file = tenancy_file.as_ref();
        let tenancy_path = if tenancy_file.is_absolute() {
            tenancy_file.to_path_buf()
        } else {
            base_dir.as_ref().join(tenancy_file)
        };

        if tenancy_path.exists() {
            Self::from_file(&tenancy_path)
        } else {
            Err(ConfigError::Config(format!(
                "Tenancy file not found: {}",
                tenancy_path.display()
            )))
        }
    }

    /// Parse tenancy configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Get the tenant column for a given table.
    ///
    /// Returns None if the table is global (no tenant scoping).
    pub fn get_tenant_column(&self, table_name: &str) -> Option<&str> {
        if self.is_global_table(table_name) {
            return None;
        }

        if let Some(col) = self
            .table_config(table_name)
            .and_then(|t| t.tenant_column.as_deref())
        {
            return Some(col);
        }

        Some(&self.default_column)
    }

    /// Check if a table is global (no tenant scoping).
    pub fn is_global_table(&self, table_name: &str) -> bool {
        if self
            .global_tables
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table_name))
        {
            return true;
        }

        self.table_config(table_name).is_some_and(|t| t.global)
    }

    fn table_config(&self, table_name: &str) -> Option<&TableTenancyConfig> {
        self.tables.get(table_name).or_else(|| {
            self.tables
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(table_name))
                .map(|(_, config)| config)
        })
    }

    /// Check the tenancy section for values that would make scoping unsafe.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_column.trim().is_empty() {
            return Err(ConfigError::Config(
                "tenancy.default_column must not be empty".to_string(),
            ));
        }

        for (table, config) in &self.tables {
            if let Some(column) = &config.tenant_column {
                if column.trim().is_empty() {
                    return Err(ConfigError::Config(format!(
                        "tenancy.tables.{}.tenant_column must not be empty",
                        table
                    )));
                }
            }
        }

        if self.global_key_marker.trim().is_empty() {
            return Err(ConfigError::Config(
                "tenancy.global_key_marker must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_tenant_column() -> String {
    "tenant_id".to_string()
}

fn default_global_key_marker() -> String {
    "global:".to_string()
}
