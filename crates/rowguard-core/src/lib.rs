use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Configuration types shared across all rowguard crates
pub mod config;

pub use config::{
    CombineMode, ConfigError, DataPermissionConfig, DataPermissionRule, OperationRule,
    RowGuardConfig, SqlDialectKind, TableTenancyConfig, TenancyConfig,
};

/// The authenticated caller as supplied by the session store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    /// Tenant the caller logged in to.
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub dept_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<RoleScope>,
    /// Super administrators bypass data-permission scoping.
    #[serde(default)]
    pub super_admin: bool,
}

/// A role held by the caller together with the rows it can see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleScope {
    pub role_id: String,
    pub data_scope: DataScope,
    /// Menu permissions granted through this role.
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Row visibility granted by a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataScope {
    /// Every row.
    All,
    /// Rows of the departments explicitly assigned to the role.
    Custom,
    /// Rows of the caller's own department.
    Dept,
    /// Rows of the caller's department and all departments below it.
    DeptAndChild,
    /// Rows created by the caller.
    SelfOnly,
}

impl DataScope {
    /// Numeric code used by role records ("1" = all ... "5" = self).
    pub fn code(&self) -> &'static str {
        match self {
            DataScope::All => "1",
            DataScope::Custom => "2",
            DataScope::Dept => "3",
            DataScope::DeptAndChild => "4",
            DataScope::SelfOnly => "5",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "1" => Some(DataScope::All),
            "2" => Some(DataScope::Custom),
            "3" => Some(DataScope::Dept),
            "4" => Some(DataScope::DeptAndChild),
            "5" => Some(DataScope::SelfOnly),
            _ => None,
        }
    }
}

impl fmt::Display for DataScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataScope::All => "all",
            DataScope::Custom => "custom",
            DataScope::Dept => "dept",
            DataScope::DeptAndChild => "dept_and_child",
            DataScope::SelfOnly => "self_only",
        };
        f.write_str(name)
    }
}

impl FromStr for DataScope {
    type Err = String;

    /// Accepts either the snake_case name or the numeric code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(scope) = Self::from_code(s) {
            return Ok(scope);
        }
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(DataScope::All),
            "custom" => Ok(DataScope::Custom),
            "dept" => Ok(DataScope::Dept),
            "dept_and_child" => Ok(DataScope::DeptAndChild),
            "self_only" | "self" => Ok(DataScope::SelfOnly),
            other => Err(format!("unknown data scope '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_scope_codes() {
        for scope in [
            DataScope::All,
            DataScope::Custom,
            DataScope::Dept,
            DataScope::DeptAndChild,
            DataScope::SelfOnly,
        ] {
            assert_eq!(DataScope::from_code(scope.code()), Some(scope));
            assert_eq!(scope.to_string().parse::<DataScope>(), Ok(scope));
        }
        assert_eq!(DataScope::from_code("9"), None);
        assert_eq!("self".parse::<DataScope>(), Ok(DataScope::SelfOnly));
    }

    #[test]
    fn test_principal_from_yaml() {
        let principal: Principal = serde_yaml::from_str(
            r#"
user_id: "7"
tenant_id: "000000"
dept_id: "103"
roles:
  - role_id: "2"
    data_scope: dept_and_child
    permissions: ["system:dept:list"]
"#,
        )
        .unwrap();
        assert_eq!(principal.tenant_id.as_deref(), Some("000000"));
        assert_eq!(principal.roles[0].data_scope, DataScope::DeptAndChild);
        assert!(!principal.super_admin);
    }
}
