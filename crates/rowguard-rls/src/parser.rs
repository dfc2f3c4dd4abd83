//! SQL parsing and analysis.

use rowguard_core::SqlDialectKind;
use sqlparser::ast::{
    Expr, FromTable, Query, SetExpr, Statement, TableFactor, TableWithJoins, UpdateTableFromKind,
};
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use crate::error::RlsError;

/// Parses and renders SQL for the injector.
///
/// The injector only ever talks to this trait, so the dialect (or the
/// whole parser) can be replaced without touching the rewriting logic.
pub trait SqlCodec: Send + Sync {
    /// Parse a SQL string into statements.
    fn parse(&self, sql: &str) -> Result<Vec<Statement>, RlsError>;

    /// Parse a standalone boolean expression.
    fn parse_expr(&self, sql: &str) -> Result<Expr, RlsError>;

    /// Render statements back to SQL text.
    fn render(&self, statements: &[Statement]) -> String {
        statements
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Analyzes SQL statements to extract table references.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlAnalyzer {
    kind: SqlDialectKind,
}

impl SqlAnalyzer {
    /// Create a new SQL analyzer for the default (Postgres) dialect.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dialect(kind: SqlDialectKind) -> Self {
        Self { kind }
    }

    fn dialect(&self) -> &'static dyn Dialect {
        match self.kind {
            SqlDialectKind::Postgres => &PostgreSqlDialect {},
            SqlDialectKind::Mysql => &MySqlDialect {},
            SqlDialectKind::Generic => &GenericDialect {},
        }
    }

    /// Extract table references from a statement, including those inside
    /// set operations, CTEs and derived tables.
    pub fn extract_tables(&self, stmt: &Statement) -> Vec<TableReference> {
        let mut tables = Vec::new();
        match stmt {
            Statement::Query(query) => visit_query(query, &mut tables),
            Statement::Update(update) => {
                visit_table_with_joins(&update.table, &mut tables);
                if let Some(
                    UpdateTableFromKind::BeforeSet(from) | UpdateTableFromKind::AfterSet(from),
                ) = &update.from
                {
                    for twj in from {
                        visit_table_with_joins(twj, &mut tables);
                    }
                }
            }
            Statement::Delete(delete) => {
                let (FromTable::WithFromKeyword(from) | FromTable::WithoutKeyword(from)) =
                    &delete.from;
                for twj in from.iter().chain(delete.using.iter().flatten()) {
                    visit_table_with_joins(twj, &mut tables);
                }
            }
            Statement::Insert(insert) => {
                tables.push(TableReference::new(insert.table.to_string(), None))
            }
            _ => {}
        }
        tables
    }

    /// Check if a statement is a DDL statement.
    pub fn is_ddl(&self, stmt: &Statement) -> bool {
        matches!(
            stmt,
            Statement::CreateTable { .. }
                | Statement::AlterTable { .. }
                | Statement::Drop { .. }
                | Statement::Truncate { .. }
                | Statement::CreateIndex { .. }
                | Statement::CreateView { .. }
        )
    }

    /// Get the type of SQL operation.
    pub fn get_operation(&self, stmt: &Statement) -> SqlOperation {
        match stmt {
            Statement::Query(_) => SqlOperation::Select,
            Statement::Insert { .. } => SqlOperation::Insert,
            Statement::Update { .. } => SqlOperation::Update,
            Statement::Delete(_) => SqlOperation::Delete,
            s if self.is_ddl(s) => SqlOperation::Ddl,
            _ => SqlOperation::Other,
        }
    }
}

impl SqlCodec for SqlAnalyzer {
    fn parse(&self, sql: &str) -> Result<Vec<Statement>, RlsError> {
        Parser::parse_sql(self.dialect(), sql).map_err(|e| RlsError::ParseError(e.to_string()))
    }

    fn parse_expr(&self, sql: &str) -> Result<Expr, RlsError> {
        let invalid = |e: sqlparser::parser::ParserError| RlsError::InvalidPredicate {
            predicate: sql.to_string(),
            reason: e.to_string(),
        };
        let mut parser = Parser::new(self.dialect()).try_with_sql(sql).map_err(invalid)?;
        let expr = parser.parse_expr().map_err(invalid)?;
        parser.expect_token(&Token::EOF).map_err(invalid)?;
        Ok(expr)
    }
}

fn visit_query(query: &Query, tables: &mut Vec<TableReference>) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            visit_query(&cte.query, tables);
        }
    }
    visit_set_expr(&query.body, tables);
}

fn visit_set_expr(body: &SetExpr, tables: &mut Vec<TableReference>) {
    match body {
        SetExpr::Select(select) => {
            for twj in &select.from {
                visit_table_with_joins(twj, tables);
            }
        }
        SetExpr::Query(query) => visit_query(query, tables),
        SetExpr::SetOperation { left, right, .. } => {
            visit_set_expr(left, tables);
            visit_set_expr(right, tables);
        }
        _ => {}
    }
}

fn visit_table_with_joins(twj: &TableWithJoins, tables: &mut Vec<TableReference>) {
    visit_table_factor(&twj.relation, tables);
    for join in &twj.joins {
        visit_table_factor(&join.relation, tables);
    }
}

fn visit_table_factor(factor: &TableFactor, tables: &mut Vec<TableReference>) {
    match factor {
        TableFactor::Derived { subquery, .. } => visit_query(subquery, tables),
        other => tables.extend(TableReference::from_factor(other)),
    }
}

/// A reference to a table in a SQL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReference {
    /// The table name as written (possibly schema-qualified).
    pub name: String,
    /// Optional alias.
    pub alias: Option<String>,
}

impl TableReference {
    pub fn new(name: impl Into<String>, alias: Option<String>) -> Self {
        Self {
            name: name.into(),
            alias,
        }
    }

    /// Build a reference from a plain table factor.
    pub fn from_factor(factor: &TableFactor) -> Option<Self> {
        match factor {
            TableFactor::Table { name, alias, .. } => Some(Self::new(
                name.to_string(),
                alias.as_ref().map(|a| a.name.to_string()),
            )),
            _ => None,
        }
    }

    /// Unqualified, unquoted table name (e.g. `public."Orders"` -> `Orders`).
    pub fn base_name(&self) -> &str {
        let last = self.name.rsplit('.').next().unwrap_or(&self.name);
        last.trim_matches(|c| c == '"' || c == '`')
    }

    /// The name columns of this table must be qualified with.
    pub fn qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Whether this reference names `table` (case-insensitive, schema ignored).
    pub fn matches(&self, table: &str) -> bool {
        let wanted = table.rsplit('.').next().unwrap_or(table);
        self.base_name().eq_ignore_ascii_case(wanted)
    }

    /// Whether this is a system catalog table that must never be scoped.
    pub fn is_system_catalog(&self) -> bool {
        let lower = self.name.to_lowercase();
        lower.starts_with("pg_catalog.")
            || lower.starts_with("information_schema.")
            || self.base_name().to_lowercase().starts_with("pg_")
    }
}

/// Types of SQL operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Other,
}
