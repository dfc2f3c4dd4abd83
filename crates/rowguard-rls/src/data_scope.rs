//! Data-permission fragments built from the caller's role data scopes.

use std::collections::{HashMap, HashSet, VecDeque};

use rowguard_core::{CombineMode, DataPermissionRule, DataScope, RoleScope};

use crate::context::Session;
use crate::error::RlsError;

/// Department lookups needed by the `Custom` and `DeptAndChild` scopes.
pub trait DeptDirectory: Send + Sync {
    /// Departments explicitly assigned to a role.
    fn role_custom_depts(&self, role_id: &str) -> anyhow::Result<Vec<String>>;

    /// A department and all departments below it.
    fn dept_and_children(&self, dept_id: &str) -> anyhow::Result<Vec<String>>;
}

/// [`DeptDirectory`] backed by in-memory maps.
#[derive(Debug, Clone, Default)]
pub struct StaticDeptDirectory {
    role_depts: HashMap<String, Vec<String>>,
    children: HashMap<String, Vec<String>>,
}

impl StaticDeptDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role_depts(mut self, role_id: &str, depts: &[&str]) -> Self {
        self.role_depts.insert(
            role_id.to_string(),
            depts.iter().map(|d| d.to_string()).collect(),
        );
        self
    }

    pub fn with_dept(mut self, dept_id: &str, parent_id: &str) -> Self {
        self.children
            .entry(parent_id.to_string())
            .or_default()
            .push(dept_id.to_string());
        self
    }
}

impl DeptDirectory for StaticDeptDirectory {
    fn role_custom_depts(&self, role_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.role_depts.get(role_id).cloned().unwrap_or_default())
    }

    fn dept_and_children(&self, dept_id: &str) -> anyhow::Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut queue = VecDeque::from([dept_id.to_string()]);
        while let Some(dept) = queue.pop_front() {
            if !seen.insert(dept.clone()) {
                continue;
            }
            if let Some(children) = self.children.get(&dept) {
                queue.extend(children.iter().cloned());
            }
            out.push(dept);
        }
        Ok(out)
    }
}

/// Render a value as a SQL string literal.
pub(crate) fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(crate) fn qualify(qualifier: Option<&str>, column: &str) -> String {
    match qualifier {
        Some(q) if !column.contains('.') => format!("{}.{}", q, column),
        _ => column.to_string(),
    }
}

/// Builds the data-permission fragment of one rule for one table.
pub struct DataScopeBuilder<'a> {
    pub rule: &'a DataPermissionRule,
    pub directory: &'a dyn DeptDirectory,
    pub deny_predicate: &'a str,
}

impl DataScopeBuilder<'_> {
    /// The SQL fragment restricting `session` to its visible rows, or `None`
    /// when the caller may see everything.
    pub fn build(
        &self,
        session: &dyn Session,
        qualifier: Option<&str>,
    ) -> Result<Option<String>, RlsError> {
        if session.is_super_admin() {
            return Ok(None);
        }

        let roles: Vec<&RoleScope> = session
            .roles()
            .iter()
            .filter(|role| match &self.rule.permission {
                Some(permission) => role.permissions.iter().any(|p| p == permission),
                None => true,
            })
            .collect();

        let mut fragments: Vec<String> = Vec::new();
        for role in roles {
            if role.data_scope == DataScope::All {
                match self.rule.combine {
                    CombineMode::Or => return Ok(None),
                    CombineMode::And => continue,
                }
            }
            if let Some(fragment) = self.role_fragment(session, role, qualifier)? {
                if !fragments.contains(&fragment) {
                    fragments.push(fragment);
                }
            }
        }

        let sql = match fragments.len() {
            0 => self.deny_predicate.to_string(),
            1 => fragments.remove(0),
            _ => {
                let connective = match self.rule.combine {
                    CombineMode::Or => " OR ",
                    CombineMode::And => " AND ",
                };
                format!("({})", fragments.join(connective))
            }
        };
        Ok(Some(sql))
    }

    fn role_fragment(
        &self,
        session: &dyn Session,
        role: &RoleScope,
        qualifier: Option<&str>,
    ) -> Result<Option<String>, RlsError> {
        let dept_column = self.rule.dept_column.as_deref().map(|c| qualify(qualifier, c));
        let user_column = self.rule.user_column.as_deref().map(|c| qualify(qualifier, c));

        let fragment = match role.data_scope {
            DataScope::All => None,
            DataScope::Custom => match dept_column {
                Some(column) => {
                    let depts = self.directory.role_custom_depts(&role.role_id)?;
                    Some(self.in_list(&column, &depts))
                }
                None => None,
            },
            DataScope::Dept => match (dept_column, session.dept_id()) {
                (Some(column), Some(dept)) => Some(format!("{} = {}", column, sql_literal(dept))),
                _ => None,
            },
            DataScope::DeptAndChild => match (dept_column, session.dept_id()) {
                (Some(column), Some(dept)) => {
                    let depts = self.directory.dept_and_children(dept)?;
                    Some(self.in_list(&column, &depts))
                }
                _ => None,
            },
            DataScope::SelfOnly => match (user_column, session.user_id()) {
                (Some(column), Some(user)) => Some(format!("{} = {}", column, sql_literal(user))),
                _ => None,
            },
        };

        if fragment.is_none() && role.data_scope != DataScope::All {
            tracing::debug!(
                role_id = %role.role_id,
                scope = %role.data_scope,
                "data scope cannot be expressed for this rule; role grants no rows"
            );
        }
        Ok(fragment)
    }

    fn in_list(&self, column: &str, values: &[String]) -> String {
        if values.is_empty() {
            return self.deny_predicate.to_string();
        }
        let list = values
            .iter()
            .map(|v| sql_literal(v))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} IN ({})", column, list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rowguard_core::Principal;

    fn role(id: &str, scope: DataScope) -> RoleScope {
        RoleScope {
            role_id: id.to_string(),
            data_scope: scope,
            permissions: vec!["system:user:list".to_string()],
        }
    }

    fn principal(roles: Vec<RoleScope>) -> Principal {
        Principal {
            user_id: "7".to_string(),
            tenant_id: Some("000000".to_string()),
            dept_id: Some("103".to_string()),
            roles,
            super_admin: false,
        }
    }

    fn directory() -> StaticDeptDirectory {
        StaticDeptDirectory::new()
            .with_role_depts("2", &["100", "101"])
            .with_dept("104", "103")
            .with_dept("105", "104")
    }

    fn build(
        rule: &DataPermissionRule,
        principal: &Principal,
        qualifier: Option<&str>,
    ) -> Option<String> {
        let directory = directory();
        DataScopeBuilder {
            rule,
            directory: &directory,
            deny_predicate: "1 = 0",
        }
        .build(principal, qualifier)
        .unwrap()
    }

    fn rule() -> DataPermissionRule {
        DataPermissionRule {
            user_column: Some("create_by".to_string()),
            ..DataPermissionRule::default()
        }
    }

    #[test]
    fn test_each_scope() {
        let rule = rule();
        let cases = [
            (DataScope::Custom, "d.dept_id IN ('100', '101')"),
            (DataScope::Dept, "d.dept_id = '103'"),
            (DataScope::DeptAndChild, "d.dept_id IN ('103', '104', '105')"),
            (DataScope::SelfOnly, "d.create_by = '7'"),
        ];
        for (scope, expected) in cases {
            let p = principal(vec![role("2", scope)]);
            assert_eq!(build(&rule, &p, Some("d")).as_deref(), Some(expected));
        }
    }

    #[test]
    fn test_all_scope_and_super_admin_are_unrestricted() {
        let rule = rule();
        let p = principal(vec![role("3", DataScope::Dept), role("1", DataScope::All)]);
        assert_eq!(build(&rule, &p, None), None);

        let mut admin = principal(vec![role("3", DataScope::SelfOnly)]);
        admin.super_admin = true;
        assert_eq!(build(&rule, &admin, None), None);
    }

    #[test]
    fn test_roles_combined_with_or_and_deduplicated() {
        let rule = rule();
        let p = principal(vec![
            role("3", DataScope::Dept),
            role("4", DataScope::Dept),
            role("5", DataScope::SelfOnly),
        ]);
        assert_eq!(
            build(&rule, &p, None).as_deref(),
            Some("(dept_id = '103' OR create_by = '7')")
        );
    }

    #[test]
    fn test_and_mode_skips_all_scope() {
        let rule = DataPermissionRule {
            combine: CombineMode::And,
            ..rule()
        };
        let p = principal(vec![role("1", DataScope::All), role("3", DataScope::Dept)]);
        assert_eq!(build(&rule, &p, None).as_deref(), Some("dept_id = '103'"));
    }

    #[test]
    fn test_no_usable_scope_denies() {
        let rule = DataPermissionRule {
            user_column: None,
            ..DataPermissionRule::default()
        };
        let p = principal(vec![role("5", DataScope::SelfOnly)]);
        assert_eq!(build(&rule, &p, None).as_deref(), Some("1 = 0"));

        let nobody = principal(vec![]);
        assert_eq!(build(&rule, &nobody, None).as_deref(), Some("1 = 0"));
    }

    #[test]
    fn test_permission_filters_roles() {
        let rule = DataPermissionRule {
            permission: Some("system:dept:list".to_string()),
            ..rule()
        };
        // The only role lacks the permission, so nothing is granted.
        let p = principal(vec![role("1", DataScope::All)]);
        assert_eq!(build(&rule, &p, None).as_deref(), Some("1 = 0"));
    }

    #[test]
    fn test_literals_are_escaped() {
        assert_eq!(sql_literal("o'brien"), "'o''brien'");
        assert_eq!(qualify(Some("u"), "d.dept_id"), "d.dept_id");
    }
}
