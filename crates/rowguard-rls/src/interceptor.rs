//! Statement hooks that scope SQL before it reaches the database.

use std::sync::Arc;

use rowguard_core::RowGuardConfig;

use crate::context::RequestContext;
use crate::data_scope::DeptDirectory;
use crate::error::RlsError;
use crate::injector::{InjectionResult, RlsInjector, Scope};
use crate::parser::SqlAnalyzer;
use crate::resolver::RuleResolver;
use crate::suppression::Concern;
use crate::tenant::{TenantContext, TenantStore};

/// Command kind declared by the engine for a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlCommand {
    Select,
    Insert,
    Update,
    Delete,
    Unknown,
}

/// A statement on its way to the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundStatement {
    pub sql: String,
    /// Fully qualified id of the mapped operation, e.g. `system.user.select_page`.
    pub operation_id: String,
    pub command: SqlCommand,
    applied: Vec<Concern>,
}

impl BoundStatement {
    pub fn new(
        operation_id: impl Into<String>,
        command: SqlCommand,
        sql: impl Into<String>,
    ) -> Self {
        Self {
            sql: sql.into(),
            operation_id: operation_id.into(),
            command,
            applied: Vec::new(),
        }
    }

    /// Concerns already injected into this statement.
    pub fn applied(&self) -> &[Concern] {
        &self.applied
    }

    pub fn is_applied(&self, concern: Concern) -> bool {
        self.applied.contains(&concern)
    }

    fn mark_applied(&mut self, concern: Concern) {
        if !self.is_applied(concern) {
            self.applied.push(concern);
        }
    }
}

/// Hook points an execution engine calls for every statement.
pub trait StatementHook: Send + Sync {
    /// Called before a query is executed.
    fn on_before_query(
        &self,
        ctx: &RequestContext,
        stmt: &mut BoundStatement,
    ) -> Result<(), RlsError>;

    /// Called before an update or delete is prepared.
    fn on_before_prepare(
        &self,
        ctx: &RequestContext,
        stmt: &mut BoundStatement,
    ) -> Result<(), RlsError>;
}

/// Scopes statements with tenant and data-permission predicates.
pub struct RowScopeInterceptor {
    resolver: RuleResolver,
    injector: RlsInjector,
}

impl RowScopeInterceptor {
    /// Build the interceptor. Configuration errors are returned here and
    /// must stop startup.
    pub fn new(
        config: &RowGuardConfig,
        store: Arc<dyn TenantStore>,
        directory: Arc<dyn DeptDirectory>,
    ) -> Result<Self, RlsError> {
        let analyzer = SqlAnalyzer::with_dialect(config.dialect);
        let injector = RlsInjector::new(analyzer);
        let tenants = TenantContext::new(&config.tenancy, store);
        let resolver = RuleResolver::new(config, tenants, directory, injector.codec())?;
        Ok(Self { resolver, injector })
    }

    pub fn from_parts(resolver: RuleResolver, injector: RlsInjector) -> Self {
        Self { resolver, injector }
    }

    pub fn tenants(&self) -> &TenantContext {
        self.resolver.tenants()
    }

    pub fn resolver(&self) -> &RuleResolver {
        &self.resolver
    }

    /// Compute the rewrite of `stmt` without applying it. Each statement in
    /// the SQL text is scoped according to its own kind.
    ///
    /// `None` means no rule applies and the statement goes out unchanged.
    pub fn plan(
        &self,
        ctx: &RequestContext,
        stmt: &BoundStatement,
    ) -> Result<Option<(InjectionResult, Vec<Concern>)>, RlsError> {
        let Some(mut rule) = self.resolver.resolve(ctx, &stmt.operation_id) else {
            return Ok(None);
        };
        if stmt.is_applied(Concern::TenantLine) {
            rule.tenant = false;
        }
        if stmt.is_applied(Concern::DataPermission) {
            rule.data_permission = None;
        }
        let concerns = rule.concerns();
        if concerns.is_empty() {
            return Ok(None);
        }

        let source = |scope: &Scope| self.resolver.build_predicates(ctx, &rule, scope);
        let result = self.injector.inject(&stmt.sql, &source)?;
        Ok(Some((result, concerns)))
    }

    fn scope(&self, ctx: &RequestContext, stmt: &mut BoundStatement) -> Result<(), RlsError> {
        let Some((result, concerns)) = self.plan(ctx, stmt)? else {
            return Ok(());
        };
        if !result.is_rewritten() {
            return Ok(());
        }

        tracing::debug!(
            operation_id = %stmt.operation_id,
            tables = ?result.tables_scoped,
            predicates = ?result.predicates_added,
            "statement scoped"
        );
        stmt.sql = result.rewritten_sql;
        for concern in concerns {
            stmt.mark_applied(concern);
        }
        Ok(())
    }
}

impl StatementHook for RowScopeInterceptor {
    fn on_before_query(
        &self,
        ctx: &RequestContext,
        stmt: &mut BoundStatement,
    ) -> Result<(), RlsError> {
        self.scope(ctx, stmt)
    }

    fn on_before_prepare(
        &self,
        ctx: &RequestContext,
        stmt: &mut BoundStatement,
    ) -> Result<(), RlsError> {
        match stmt.command {
            SqlCommand::Update | SqlCommand::Delete => self.scope(ctx, stmt),
            _ => Ok(()),
        }
    }
}
