//! Permission rule resolution and predicate construction.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use rowguard_core::{
    DataPermissionConfig, DataPermissionRule, OperationRule, RowGuardConfig, TenancyConfig,
};
use sqlparser::ast::Expr;

use crate::context::RequestContext;
use crate::data_scope::{DataScopeBuilder, DeptDirectory, qualify, sql_literal};
use crate::error::RlsError;
use crate::injector::{Placement, Scope};
use crate::parser::{SqlCodec, TableReference};
use crate::suppression::Concern;
use crate::tenant::TenantContext;

/// Scoping that applies to one operation for the current context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRule {
    /// The operation id (or namespace) the rule was declared under.
    pub declared_as: String,
    pub tenant: bool,
    pub data_permission: Option<DataPermissionRule>,
}

impl PermissionRule {
    fn from_declared(declared_as: &str, rule: &OperationRule) -> Self {
        Self {
            declared_as: declared_as.to_string(),
            tenant: rule.tenant,
            data_permission: rule.data_permission.clone(),
        }
    }

    /// Concerns this rule injects predicates for.
    pub fn concerns(&self) -> Vec<Concern> {
        let mut concerns = Vec::new();
        if self.tenant {
            concerns.push(Concern::TenantLine);
        }
        if self.data_permission.is_some() {
            concerns.push(Concern::DataPermission);
        }
        concerns
    }
}

/// A predicate ready to be ANDed into a statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopedPredicate {
    pub concern: Concern,
    /// Table the predicate was built for; `None` for unqualified fragments.
    pub table: Option<String>,
    pub expr: Expr,
}

/// Maps operation ids to rules and rules to predicates.
pub struct RuleResolver {
    operations: BTreeMap<String, OperationRule>,
    cache: RwLock<HashMap<String, Option<Arc<PermissionRule>>>>,
    tenancy: TenancyConfig,
    data_permission: DataPermissionConfig,
    tenants: TenantContext,
    directory: Arc<dyn DeptDirectory>,
    codec: Arc<dyn SqlCodec>,
}

impl RuleResolver {
    /// Build a resolver. Invalid configuration is rejected here, before any
    /// statement is intercepted.
    pub fn new(
        config: &RowGuardConfig,
        tenants: TenantContext,
        directory: Arc<dyn DeptDirectory>,
        codec: Arc<dyn SqlCodec>,
    ) -> Result<Self, RlsError> {
        config.validate()?;
        codec.parse_expr(&config.data_permission.deny_predicate)?;

        Ok(Self {
            operations: config.operations.clone(),
            cache: RwLock::new(HashMap::new()),
            tenancy: config.tenancy.clone(),
            data_permission: config.data_permission.clone(),
            tenants,
            directory,
            codec,
        })
    }

    pub fn tenants(&self) -> &TenantContext {
        &self.tenants
    }

    /// The rule declared for `operation_id`, falling back to its namespaces
    /// (`a.b.c`, then `a.b`, then `a`).
    pub fn declared_rule(&self, operation_id: &str) -> Option<Arc<PermissionRule>> {
        if let Ok(cache) = self.cache.read() {
            if let Some(hit) = cache.get(operation_id) {
                return hit.clone();
            }
        }

        let mut id = operation_id;
        let found = loop {
            if let Some(rule) = self.operations.get(id) {
                break Some(Arc::new(PermissionRule::from_declared(id, rule)));
            }
            match id.rfind('.') {
                Some(pos) => id = &id[..pos],
                None => break None,
            }
        };

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(operation_id.to_string(), found.clone());
        }
        found
    }

    /// The rule to apply to `operation_id` in `ctx`, with suppressed or
    /// disabled concerns masked out. `None` means "leave the statement alone".
    pub fn resolve(&self, ctx: &RequestContext, operation_id: &str) -> Option<PermissionRule> {
        let Some(declared) = self.declared_rule(operation_id) else {
            tracing::trace!(operation_id, "no permission rule declared");
            return None;
        };

        let tenant =
            declared.tenant && self.tenants.is_enabled() && !ctx.is_suppressed(Concern::TenantLine);
        let data_permission = declared.data_permission.clone().filter(|_| {
            self.data_permission.enabled && !ctx.is_suppressed(Concern::DataPermission)
        });

        if !tenant && data_permission.is_none() {
            tracing::trace!(operation_id, "all concerns of the rule are disabled or suppressed");
            return None;
        }

        Some(PermissionRule {
            declared_as: declared.declared_as.clone(),
            tenant,
            data_permission,
        })
    }

    /// Build the predicates `rule` requires for the tables of one
    /// SELECT/UPDATE/DELETE scope.
    pub fn build_predicates(
        &self,
        ctx: &RequestContext,
        rule: &PermissionRule,
        scope: &Scope,
    ) -> Result<Vec<ScopedPredicate>, RlsError> {
        let mut predicates = Vec::new();
        if rule.tenant {
            self.tenant_predicates(ctx, scope, &mut predicates)?;
        }
        if let Some(dp) = &rule.data_permission {
            self.data_permission_predicates(ctx, dp, scope, &mut predicates)?;
        }
        Ok(predicates)
    }

    fn tenant_predicates(
        &self,
        ctx: &RequestContext,
        scope: &Scope,
        out: &mut Vec<ScopedPredicate>,
    ) -> Result<(), RlsError> {
        let mut tenant_id: Option<String> = None;

        for table in &scope.tables {
            if table.is_system_catalog() {
                tracing::debug!(table = %table.name, "skipping system catalog table");
                continue;
            }
            let Some(column) = self.tenancy.get_tenant_column(table.base_name()) else {
                continue;
            };

            let tenant = match &tenant_id {
                Some(t) => t.clone(),
                None => {
                    let t = self
                        .tenants
                        .effective_tenant_id(ctx)?
                        .ok_or(RlsError::MissingTenantValue)?;
                    tenant_id = Some(t.clone());
                    t
                }
            };

            let column = qualify(qualifier_for(scope, table), column);
            let sql = format!("{} = {}", column, sql_literal(&tenant));
            out.push(ScopedPredicate {
                concern: Concern::TenantLine,
                table: Some(table.base_name().to_string()),
                expr: self.codec.parse_expr(&sql)?,
            });
        }
        Ok(())
    }

    fn data_permission_predicates(
        &self,
        ctx: &RequestContext,
        rule: &DataPermissionRule,
        scope: &Scope,
        out: &mut Vec<ScopedPredicate>,
    ) -> Result<(), RlsError> {
        let builder = DataScopeBuilder {
            rule,
            directory: self.directory.as_ref(),
            deny_predicate: &self.data_permission.deny_predicate,
        };

        match &rule.table {
            Some(target) => {
                for table in scope.tables.iter().filter(|t| t.matches(target)) {
                    if let Some(sql) = builder.build(ctx.session(), qualifier_for(scope, table))? {
                        out.push(ScopedPredicate {
                            concern: Concern::DataPermission,
                            table: Some(table.base_name().to_string()),
                            expr: self.codec.parse_expr(&sql)?,
                        });
                    }
                }
            }
            // One unqualified fragment per WHERE that reads any table.
            None if scope.placement == Placement::Where && scope.visible > 0 => {
                if let Some(sql) = builder.build(ctx.session(), None)? {
                    out.push(ScopedPredicate {
                        concern: Concern::DataPermission,
                        table: None,
                        expr: self.codec.parse_expr(&sql)?,
                    });
                }
            }
            None => {}
        }
        Ok(())
    }
}

/// An UPDATE/DELETE whose only table is unaliased uses bare column names;
/// everything else is qualified with the alias or table name.
fn qualifier_for<'a>(scope: &Scope, table: &'a TableReference) -> Option<&'a str> {
    if scope.bare_columns() && table.alias.is_none() {
        None
    } else {
        Some(table.qualifier())
    }
}
