//! `rowguard explain` command implementation.
//!
//! Shows how one statement would be rewritten for a given caller, without
//! touching a database.

use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use rowguard_core::{DataScope, Principal, RoleScope, RowGuardConfig};
use rowguard_rls::{
    BoundStatement, InMemoryTenantStore, RequestContext, RowScopeInterceptor, SqlCommand,
    StaticDeptDirectory,
};

/// Command kind of the explained statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CommandKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl From<CommandKind> for SqlCommand {
    fn from(kind: CommandKind) -> Self {
        match kind {
            CommandKind::Select => SqlCommand::Select,
            CommandKind::Insert => SqlCommand::Insert,
            CommandKind::Update => SqlCommand::Update,
            CommandKind::Delete => SqlCommand::Delete,
        }
    }
}

#[derive(Args, Debug)]
pub struct ExplainArgs {
    /// SQL statement to rewrite.
    pub sql: String,

    /// Operation id the statement is issued under, e.g. system.user.select_page
    #[arg(long = "operation", short = 'o')]
    pub operation_id: String,

    /// Command kind declared by the engine.
    #[arg(long, value_enum, default_value_t = CommandKind::Select)]
    pub command: CommandKind,

    /// Caller's user id. Without it the caller is anonymous.
    #[arg(long, env = "ROWGUARD_USER")]
    pub user: Option<String>,

    /// Caller's tenant id.
    #[arg(long, env = "ROWGUARD_TENANT")]
    pub tenant: Option<String>,

    /// Caller's department id.
    #[arg(long)]
    pub dept: Option<String>,

    /// Role as `<role_id>:<scope>[:<perm>,<perm>...]`; scope is one of
    /// all, custom, dept, dept_and_child, self (or the codes 1-5).
    #[arg(long = "role")]
    pub roles: Vec<String>,

    /// Treat the caller as a super administrator.
    #[arg(long, default_value_t = false)]
    pub super_admin: bool,

    /// Context-local dynamic tenant override.
    #[arg(long)]
    pub dynamic_tenant: Option<String>,

    /// Custom-scope departments as `<role_id>=<dept>,<dept>...`.
    #[arg(long = "role-depts")]
    pub role_depts: Vec<String>,

    /// Department hierarchy edge as `<child>:<parent>`.
    #[arg(long = "dept-parent")]
    pub dept_parents: Vec<String>,

    /// Print the result as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// Machine-readable result of `explain`.
#[derive(Debug, Serialize)]
pub struct Explanation {
    pub operation_id: String,
    /// Operation id or namespace the matching rule was declared under.
    pub rule: Option<String>,
    pub concerns: Vec<String>,
    pub original_sql: String,
    pub rewritten_sql: String,
    pub tables_scoped: Vec<String>,
    pub predicates_added: Vec<String>,
}

pub fn run(config_path: &Path, args: ExplainArgs) -> Result<()> {
    let config = RowGuardConfig::load_with_context(config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    let explanation = explain(&config, &args)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&explanation)?);
        return Ok(());
    }

    match &explanation.rule {
        Some(rule) => println!("Rule:       {} ({})", rule, explanation.concerns.join(", ")),
        None => println!("Rule:       none (statement passes through)"),
    }
    println!("Original:   {}", explanation.original_sql);
    println!("Rewritten:  {}", explanation.rewritten_sql);
    if !explanation.predicates_added.is_empty() {
        println!("Tables:     {}", explanation.tables_scoped.join(", "));
        println!("Predicates:");
        for predicate in &explanation.predicates_added {
            println!("  - {}", predicate);
        }
    }
    Ok(())
}

/// Rewrite `args.sql` for the caller described by `args`.
pub fn explain(config: &RowGuardConfig, args: &ExplainArgs) -> Result<Explanation> {
    let directory = build_directory(&args.role_depts, &args.dept_parents)?;
    let interceptor = RowScopeInterceptor::new(
        config,
        Arc::new(InMemoryTenantStore::new()),
        Arc::new(directory),
    )?;

    let ctx = match &args.user {
        Some(user_id) => RequestContext::for_principal(Principal {
            user_id: user_id.clone(),
            tenant_id: args.tenant.clone(),
            dept_id: args.dept.clone(),
            roles: args
                .roles
                .iter()
                .map(|r| parse_role(r))
                .collect::<Result<_>>()?,
            super_admin: args.super_admin,
        }),
        None => RequestContext::anonymous(),
    };

    let command = SqlCommand::from(args.command);
    let stmt = BoundStatement::new(&args.operation_id, command, &args.sql);

    let plan = || interceptor.plan(&ctx, &stmt);
    let planned = match &args.dynamic_tenant {
        Some(tenant) => interceptor.tenants().run_with_tenant(&ctx, tenant, plan),
        None => plan(),
    }?;

    let explanation = match planned {
        Some((result, concerns)) if args.command != CommandKind::Insert => Explanation {
            operation_id: args.operation_id.clone(),
            rule: interceptor
                .resolver()
                .declared_rule(&args.operation_id)
                .map(|r| r.declared_as.clone()),
            concerns: concerns.iter().map(|c| c.to_string()).collect(),
            original_sql: result.original_sql,
            rewritten_sql: result.rewritten_sql,
            tables_scoped: result.tables_scoped,
            predicates_added: result.predicates_added,
        },
        _ => Explanation {
            operation_id: args.operation_id.clone(),
            rule: None,
            concerns: vec![],
            original_sql: args.sql.clone(),
            rewritten_sql: args.sql.clone(),
            tables_scoped: vec![],
            predicates_added: vec![],
        },
    };
    Ok(explanation)
}

fn parse_role(value: &str) -> Result<RoleScope> {
    let mut parts = value.splitn(3, ':');
    let role_id = parts.next().unwrap_or_default().trim();
    let Some(scope) = parts.next() else {
        bail!("Invalid role '{}': expected <role_id>:<scope>", value);
    };
    if role_id.is_empty() {
        bail!("Invalid role '{}': empty role id", value);
    }

    let data_scope: DataScope = scope
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid role '{}': {}", value, e))?;
    let permissions = parts
        .next()
        .map(|p| {
            p.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(RoleScope {
        role_id: role_id.to_string(),
        data_scope,
        permissions,
    })
}

fn build_directory(
    role_depts: &[String],
    dept_parents: &[String],
) -> Result<StaticDeptDirectory> {
    let mut directory = StaticDeptDirectory::new();

    for value in role_depts {
        let Some((role_id, depts)) = value.split_once('=') else {
            bail!("Invalid --role-depts '{}': expected <role_id>=<dept>,<dept>", value);
        };
        let depts: Vec<&str> = depts
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .collect();
        directory = directory.with_role_depts(role_id.trim(), &depts);
    }

    for value in dept_parents {
        let Some((child, parent)) = value.split_once(':') else {
            bail!("Invalid --dept-parent '{}': expected <child>:<parent>", value);
        };
        directory = directory.with_dept(child.trim(), parent.trim());
    }

    Ok(directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"
tenancy:
  enabled: true
operations:
  system.dept:
    tenant: true
    data_permission:
      table: sys_dept
"#;

    fn args(sql: &str) -> ExplainArgs {
        ExplainArgs {
            sql: sql.to_string(),
            operation_id: "system.dept.select_list".to_string(),
            command: CommandKind::Select,
            user: Some("7".to_string()),
            tenant: Some("000000".to_string()),
            dept: Some("103".to_string()),
            roles: vec!["2:dept_and_child".to_string()],
            super_admin: false,
            dynamic_tenant: None,
            role_depts: vec![],
            dept_parents: vec!["104:103".to_string()],
            json: true,
        }
    }

    #[test]
    fn test_explain_select() {
        let config = RowGuardConfig::from_yaml(CONFIG).unwrap();
        let explanation = explain(&config, &args("SELECT * FROM sys_dept d")).unwrap();

        assert_eq!(explanation.rule.as_deref(), Some("system.dept"));
        assert_eq!(explanation.tables_scoped, vec!["sys_dept"]);
        assert_eq!(
            explanation.predicates_added,
            vec!["d.tenant_id = '000000'", "d.dept_id IN ('103', '104')"]
        );
    }

    #[test]
    fn test_explain_dynamic_tenant() {
        let config = RowGuardConfig::from_yaml(CONFIG).unwrap();
        let mut args = args("SELECT * FROM sys_dept");
        args.dynamic_tenant = Some("222222".to_string());
        args.super_admin = true;
        let explanation = explain(&config, &args).unwrap();
        assert_eq!(explanation.predicates_added, vec!["sys_dept.tenant_id = '222222'"]);
    }

    #[test]
    fn test_explain_insert_passes_through() {
        let config = RowGuardConfig::from_yaml(CONFIG).unwrap();
        let mut args = args("INSERT INTO sys_dept (dept_id) VALUES ('1')");
        args.command = CommandKind::Insert;
        let explanation = explain(&config, &args).unwrap();
        assert_eq!(explanation.rewritten_sql, explanation.original_sql);
        assert!(explanation.rule.is_none());
    }

    #[test]
    fn test_parse_role() {
        let role = parse_role("3:custom:system:user:list").unwrap();
        assert_eq!(role.role_id, "3");
        assert_eq!(role.data_scope, DataScope::Custom);
        assert_eq!(role.permissions, vec!["system:user:list"]);

        assert!(parse_role("3").is_err());
        assert!(parse_role("3:nobody").is_err());
    }
}
