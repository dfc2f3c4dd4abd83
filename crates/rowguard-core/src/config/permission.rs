//! Per-operation permission rules.
//!
//! Operations opt in to scoping explicitly: an operation id with no rule
//! (neither for itself nor for one of its namespaces) is never rewritten.

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Global data-permission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPermissionConfig {
    /// Switch for data-permission scoping, independent of tenancy.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Predicate used when none of the caller's roles grants any rows.
    #[serde(default = "default_deny_predicate")]
    pub deny_predicate: String,
}

impl Default for DataPermissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            deny_predicate: default_deny_predicate(),
        }
    }
}

/// Scoping declared for one operation id (or a whole namespace of them).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRule {
    /// Whether the tenant predicate applies.
    #[serde(default)]
    pub tenant: bool,

    /// Data-permission scoping, if any.
    #[serde(default)]
    pub data_permission: Option<DataPermissionRule>,
}

/// Column mapping for department/user based row scoping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPermissionRule {
    /// Table the fragment is attached to. When unset the fragment is
    /// emitted unqualified, once per SELECT.
    #[serde(default)]
    pub table: Option<String>,

    /// Column holding the owning department.
    #[serde(default = "default_dept_column")]
    pub dept_column: Option<String>,

    /// Column holding the owning user.
    #[serde(default)]
    pub user_column: Option<String>,

    /// Menu permission a role must hold for its data scope to count.
    #[serde(default)]
    pub permission: Option<String>,

    /// How fragments of different roles are combined.
    #[serde(default)]
    pub combine: CombineMode,
}

impl Default for DataPermissionRule {
    fn default() -> Self {
        Self {
            table: None,
            dept_column: default_dept_column(),
            user_column: None,
            permission: None,
            combine: CombineMode::default(),
        }
    }
}

/// Boolean connective used to merge role fragments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineMode {
    /// Any role's scope grants visibility.
    #[default]
    Or,
    /// Every role's scope must grant visibility.
    And,
}

impl OperationRule {
    /// Validate a rule declared under `operation_id`.
    pub fn validate(&self, operation_id: &str) -> Result<(), ConfigError> {
        if operation_id.trim().is_empty() {
            return Err(ConfigError::Config(
                "operation rules must have a non-empty operation id".to_string(),
            ));
        }

        if !self.tenant && self.data_permission.is_none() {
            return Err(ConfigError::Config(format!(
                "operation '{}' declares neither tenant nor data_permission scoping",
                operation_id
            )));
        }

        if let Some(rule) = &self.data_permission {
            let blank = |c: &Option<String>| c.as_deref().is_none_or(|c| c.trim().is_empty());
            if blank(&rule.dept_column) && blank(&rule.user_column) {
                return Err(ConfigError::Config(format!(
                    "operation '{}': data_permission needs dept_column or user_column",
                    operation_id
                )));
            }
            if rule.table.as_deref().is_some_and(|t| t.trim().is_empty()) {
                return Err(ConfigError::Config(format!(
                    "operation '{}': data_permission.table must not be empty",
                    operation_id
                )));
            }
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_deny_predicate() -> String {
    "1 = 0".to_string()
}

fn default_dept_column() -> Option<String> {
    Some("dept_id".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_defaults() {
        let rule: OperationRule = serde_yaml::from_str("data_permission: {}").unwrap();
        let dp = rule.data_permission.unwrap();
        assert_eq!(dp.dept_column.as_deref(), Some("dept_id"));
        assert_eq!(dp.user_column, None);
        assert_eq!(dp.combine, CombineMode::Or);
    }

    #[test]
    fn test_empty_rule_rejected() {
        let rule = OperationRule::default();
        assert!(rule.validate("system.dept.list").is_err());
    }

    #[test]
    fn test_rule_without_columns_rejected() {
        let rule = OperationRule {
            tenant: false,
            data_permission: Some(DataPermissionRule {
                dept_column: None,
                ..DataPermissionRule::default()
            }),
        };
        assert!(rule.validate("system.user.list").is_err());
    }

    #[test]
    fn test_tenant_only_rule_accepted() {
        let rule = OperationRule {
            tenant: true,
            data_permission: None,
        };
        assert!(rule.validate("system.notice.list").is_ok());
        assert!(rule.validate(" ").is_err());
    }
}
