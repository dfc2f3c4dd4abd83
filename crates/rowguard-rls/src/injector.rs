//! Predicate injection into parsed statements.
//!
//! Predicates are ANDed into the WHERE clause of every SELECT scope (plain
//! selects, each branch of a set operation, CTE bodies, derived tables and
//! subqueries inside expressions) and of UPDATE/DELETE statements. The
//! original WHERE is parenthesised when needed so its meaning is preserved.
//!
//! Outer joins keep their null-extended rows. Predicates for the nullable
//! side of a LEFT or RIGHT join go into that join's ON clause. The tables of
//! a FULL join, or of an outer join without ON, are each replaced by a
//! filtered derived table.

use std::sync::Arc;

use serde::Serialize;
use sqlparser::ast::{
    BinaryOperator, Expr, FromTable, Function, FunctionArg, FunctionArgExpr, FunctionArguments,
    GroupByExpr, JoinConstraint, JoinOperator, OrderBy, OrderByKind, Query, Select, SelectItem,
    SetExpr, Statement, TableFactor, TableWithJoins, UpdateTableFromKind,
};

use crate::error::RlsError;
use crate::parser::{SqlAnalyzer, SqlCodec, SqlOperation, TableReference};
use crate::resolver::ScopedPredicate;

/// Where a batch of predicates is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// WHERE of the enclosing select or statement.
    Where,
    /// ON clause of an outer join, or the filter of a wrapped table.
    Join,
}

/// Tables of one statement scope that need predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub operation: SqlOperation,
    pub placement: Placement,
    pub tables: Vec<TableReference>,
    /// Plain tables read by the enclosing select or statement, wherever
    /// their own predicates are placed.
    pub visible: usize,
}

impl Scope {
    /// Only an UPDATE/DELETE reading a single table may use bare columns.
    pub fn bare_columns(&self) -> bool {
        matches!(self.operation, SqlOperation::Update | SqlOperation::Delete)
            && self.placement == Placement::Where
            && self.visible == 1
    }
}

/// Supplies the predicates for one statement scope.
pub trait PredicateSource {
    fn predicates(&self, scope: &Scope) -> Result<Vec<ScopedPredicate>, RlsError>;
}

impl<F> PredicateSource for F
where
    F: Fn(&Scope) -> Result<Vec<ScopedPredicate>, RlsError>,
{
    fn predicates(&self, scope: &Scope) -> Result<Vec<ScopedPredicate>, RlsError> {
        self(scope)
    }
}

/// Injects row-scoping predicates into SQL statements.
#[derive(Clone)]
pub struct RlsInjector {
    analyzer: SqlAnalyzer,
    codec: Arc<dyn SqlCodec>,
}

impl RlsInjector {
    pub fn new(analyzer: SqlAnalyzer) -> Self {
        Self {
            analyzer,
            codec: Arc::new(analyzer),
        }
    }

    /// Use a custom codec for parsing and rendering.
    pub fn with_codec(analyzer: SqlAnalyzer, codec: Arc<dyn SqlCodec>) -> Self {
        Self { analyzer, codec }
    }

    pub fn codec(&self) -> Arc<dyn SqlCodec> {
        Arc::clone(&self.codec)
    }

    /// Rewrite every SELECT, UPDATE and DELETE in `sql`, each by its own kind.
    ///
    /// A lone statement of another kind passes through. Stacked with other
    /// statements it is rejected, since nothing can scope it. When no
    /// predicate is added the returned SQL is the input, byte for byte.
    /// Unparsable SQL is an error; the unscoped text is never handed back.
    pub fn inject(
        &self,
        sql: &str,
        source: &dyn PredicateSource,
    ) -> Result<InjectionResult, RlsError> {
        let mut statements = self.codec.parse(sql)?;
        let stacked = statements.len() > 1;
        let mut rewrite = Rewrite {
            codec: self.codec.as_ref(),
            source,
            result: InjectionResult::unchanged(sql),
        };

        for stmt in &mut statements {
            match self.analyzer.get_operation(stmt) {
                SqlOperation::Select | SqlOperation::Update | SqlOperation::Delete => {
                    rewrite.statement(stmt)?
                }
                other if stacked => {
                    return Err(RlsError::Unsupported(format!(
                        "{:?} statement stacked with other statements",
                        other
                    )));
                }
                other => tracing::trace!(operation = ?other, "statement kind is not scoped"),
            }
        }

        let mut result = rewrite.result;
        if result.is_rewritten() {
            result.rewritten_sql = self.codec.render(&statements);
        }
        Ok(result)
    }
}

/// Operation and table count shared by every scope of one select or statement.
#[derive(Debug, Clone, Copy)]
struct Frame {
    operation: SqlOperation,
    visible: usize,
}

/// Which side of an outer join is null-extended.
enum Side {
    Joined,
    Preceding,
}

/// State of one `inject` call.
struct Rewrite<'a> {
    codec: &'a dyn SqlCodec,
    source: &'a dyn PredicateSource,
    result: InjectionResult,
}

impl Rewrite<'_> {
    fn statement(&mut self, stmt: &mut Statement) -> Result<(), RlsError> {
        match stmt {
            Statement::Query(query) => self.query(query),
            Statement::Update(update) => {
                for assignment in &mut update.assignments {
                    self.expr(&mut assignment.value)?;
                }
                let tables = std::iter::once(&mut update.table)
                    .chain(update.from.iter_mut().flat_map(|from| match from {
                        UpdateTableFromKind::BeforeSet(from)
                        | UpdateTableFromKind::AfterSet(from) => from.iter_mut(),
                    }))
                    .collect();
                self.scope_from(SqlOperation::Update, tables, &mut update.selection)
            }
            Statement::Delete(delete) => {
                let (FromTable::WithFromKeyword(from) | FromTable::WithoutKeyword(from)) =
                    &mut delete.from;
                let tables = from
                    .iter_mut()
                    .chain(delete.using.iter_mut().flatten())
                    .collect();
                self.scope_from(SqlOperation::Delete, tables, &mut delete.selection)
            }
            _ => Ok(()),
        }
    }

    fn query(&mut self, query: &mut Query) -> Result<(), RlsError> {
        if let Some(with) = query.with.as_mut() {
            for cte in &mut with.cte_tables {
                self.query(&mut cte.query)?;
            }
        }
        self.set_expr(&mut query.body)?;
        if let Some(OrderBy {
            kind: OrderByKind::Expressions(items),
            ..
        }) = query.order_by.as_mut()
        {
            for item in items {
                self.expr(&mut item.expr)?;
            }
        }
        Ok(())
    }

    fn set_expr(&mut self, body: &mut SetExpr) -> Result<(), RlsError> {
        match body {
            SetExpr::Select(select) => self.select(select),
            SetExpr::Query(query) => self.query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.set_expr(left)?;
                self.set_expr(right)
            }
            SetExpr::Values(values) => {
                for row in &mut values.rows {
                    for expr in row {
                        self.expr(expr)?;
                    }
                }
                Ok(())
            }
            SetExpr::Update(stmt) | SetExpr::Delete(stmt) => self.statement(stmt),
            SetExpr::Insert(_) => Ok(()),
            SetExpr::Merge(_) | SetExpr::Table(_) => {
                Err(RlsError::Unsupported(format!("cannot scope `{}`", body)))
            }
        }
    }

    fn select(&mut self, select: &mut Select) -> Result<(), RlsError> {
        for item in &mut select.projection {
            if let SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } = item {
                self.expr(expr)?;
            }
        }
        for expr in [&mut select.prewhere, &mut select.having, &mut select.qualify]
            .into_iter()
            .flatten()
        {
            self.expr(expr)?;
        }
        if let GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
            for expr in exprs {
                self.expr(expr)?;
            }
        }

        let from = select.from.iter_mut().collect();
        self.scope_from(SqlOperation::Select, from, &mut select.selection)
    }

    /// Scope the tables of one FROM list and AND the WHERE predicates into
    /// `selection`.
    fn scope_from(
        &mut self,
        operation: SqlOperation,
        from: Vec<&mut TableWithJoins>,
        selection: &mut Option<Expr>,
    ) -> Result<(), RlsError> {
        if let Some(selection) = selection.as_mut() {
            self.expr(selection)?;
        }

        let frame = Frame {
            operation,
            visible: from.iter().map(|twj| plain_tables(twj)).sum(),
        };
        let mut tables = Vec::new();
        for twj in from {
            self.join_tree(frame, false, twj, &mut tables)?;
        }

        let scope = Scope {
            operation,
            placement: Placement::Where,
            tables,
            visible: frame.visible,
        };
        merge_predicates(selection, self.source.predicates(&scope)?, &mut self.result);
        Ok(())
    }

    /// Scope the joins of `twj`, leaving in `tables` the tables whose
    /// predicates belong in the enclosing WHERE.
    fn join_tree(
        &mut self,
        frame: Frame,
        wrap: bool,
        twj: &mut TableWithJoins,
        tables: &mut Vec<TableReference>,
    ) -> Result<(), RlsError> {
        let wrap = wrap || needs_wrapping(twj);
        let mut outer = Vec::new();
        self.factor(frame, wrap, &mut twj.relation, &mut outer)?;

        for join in &mut twj.joins {
            let mut joined = Vec::new();
            self.factor(frame, wrap, &mut join.relation, &mut joined)?;

            let nullable = nullable_side(&join.join_operator);
            let Some(on) = on_condition(&mut join.join_operator) else {
                outer.append(&mut joined);
                continue;
            };
            self.expr(on)?;
            match nullable {
                Some(Side::Joined) => self.merge_join(frame, joined, on)?,
                Some(Side::Preceding) => {
                    let preceding = std::mem::replace(&mut outer, joined);
                    self.merge_join(frame, preceding, on)?;
                }
                None => outer.append(&mut joined),
            }
        }

        tables.append(&mut outer);
        Ok(())
    }

    fn factor(
        &mut self,
        frame: Frame,
        wrap: bool,
        factor: &mut TableFactor,
        tables: &mut Vec<TableReference>,
    ) -> Result<(), RlsError> {
        if wrap && matches!(factor, TableFactor::Table { .. }) {
            return self.wrap_table(frame.operation, factor);
        }

        match factor {
            TableFactor::Derived { subquery, .. } => self.query(subquery),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.join_tree(frame, wrap, table_with_joins, tables),
            // The pivoted table's columns are not visible outside.
            TableFactor::Pivot { table, .. }
            | TableFactor::Unpivot { table, .. }
            | TableFactor::MatchRecognize { table, .. } => self.factor(frame, true, table, tables),
            TableFactor::TableFunction { expr, .. } => self.expr(expr),
            other => {
                tables.extend(TableReference::from_factor(other));
                Ok(())
            }
        }
    }

    /// AND the predicates for `tables` into an outer join's ON clause.
    fn merge_join(
        &mut self,
        frame: Frame,
        tables: Vec<TableReference>,
        on: &mut Expr,
    ) -> Result<(), RlsError> {
        if tables.is_empty() {
            return Ok(());
        }
        let scope = Scope {
            operation: frame.operation,
            placement: Placement::Join,
            tables,
            visible: frame.visible,
        };
        let mut condition = Some(on.clone());
        merge_predicates(&mut condition, self.source.predicates(&scope)?, &mut self.result);
        if let Some(condition) = condition {
            *on = condition;
        }
        Ok(())
    }

    /// Replace a plain table by `(SELECT * FROM table WHERE ...) AS table`.
    fn wrap_table(
        &mut self,
        operation: SqlOperation,
        factor: &mut TableFactor,
    ) -> Result<(), RlsError> {
        let Some(table) = TableReference::from_factor(factor) else {
            return Ok(());
        };
        let scope = Scope {
            operation,
            placement: Placement::Join,
            tables: vec![table.clone()],
            visible: 1,
        };
        let mut filter = None;
        merge_predicates(&mut filter, self.source.predicates(&scope)?, &mut self.result);
        let Some(filter) = filter else {
            return Ok(());
        };

        let inner = match &table.alias {
            Some(alias) => format!("{} AS {}", table.name, alias),
            None => table.name.clone(),
        };
        let alias = match &table.alias {
            Some(alias) => alias.as_str(),
            None => table.name.rsplit('.').next().unwrap_or(&table.name),
        };
        let sql = format!("SELECT * FROM (SELECT * FROM {} WHERE {}) AS {}", inner, filter, alias);
        match first_factor(self.codec.parse(&sql)?.pop()) {
            Some(wrapped) => {
                *factor = wrapped;
                Ok(())
            }
            None => Err(RlsError::Unsupported(format!("cannot wrap table {}", table.name))),
        }
    }

    /// Scope every query nested in `expr`.
    fn expr(&mut self, expr: &mut Expr) -> Result<(), RlsError> {
        match expr {
            Expr::InSubquery {
                expr: inner,
                subquery,
                ..
            } => {
                self.expr(inner)?;
                self.query(subquery)
            }
            Expr::Exists { subquery, .. } | Expr::Subquery(subquery) => self.query(subquery),
            Expr::BinaryOp { left, right, .. }
            | Expr::AnyOp { left, right, .. }
            | Expr::AllOp { left, right, .. }
            | Expr::IsDistinctFrom(left, right)
            | Expr::IsNotDistinctFrom(left, right)
            | Expr::AtTimeZone {
                timestamp: left,
                time_zone: right,
            }
            | Expr::Like {
                expr: left,
                pattern: right,
                ..
            }
            | Expr::ILike {
                expr: left,
                pattern: right,
                ..
            }
            | Expr::SimilarTo {
                expr: left,
                pattern: right,
                ..
            }
            | Expr::RLike {
                expr: left,
                pattern: right,
                ..
            } => {
                self.expr(left)?;
                self.expr(right)
            }
            Expr::UnaryOp { expr: inner, .. }
            | Expr::Nested(inner)
            | Expr::IsNull(inner)
            | Expr::IsNotNull(inner)
            | Expr::IsTrue(inner)
            | Expr::IsNotTrue(inner)
            | Expr::IsFalse(inner)
            | Expr::IsNotFalse(inner)
            | Expr::IsUnknown(inner)
            | Expr::IsNotUnknown(inner)
            | Expr::IsNormalized { expr: inner, .. }
            | Expr::Cast { expr: inner, .. }
            | Expr::Collate { expr: inner, .. }
            | Expr::Extract { expr: inner, .. }
            | Expr::Named { expr: inner, .. } => self.expr(inner),
            Expr::InList {
                expr: inner, list, ..
            } => {
                self.expr(inner)?;
                for item in list {
                    self.expr(item)?;
                }
                Ok(())
            }
            Expr::Tuple(list) => {
                for item in list {
                    self.expr(item)?;
                }
                Ok(())
            }
            Expr::Between {
                expr: inner,
                low,
                high,
                ..
            } => {
                self.expr(inner)?;
                self.expr(low)?;
                self.expr(high)
            }
            Expr::Case {
                operand,
                conditions,
                else_result,
                ..
            } => {
                for inner in operand.iter_mut().chain(else_result.iter_mut()) {
                    self.expr(inner)?;
                }
                for when in conditions {
                    self.expr(&mut when.condition)?;
                    self.expr(&mut when.result)?;
                }
                Ok(())
            }
            Expr::Function(function) => self.function(function),
            Expr::Identifier(_)
            | Expr::CompoundIdentifier(_)
            | Expr::Value(_)
            | Expr::TypedString(_)
            | Expr::Wildcard(_)
            | Expr::QualifiedWildcard(..) => Ok(()),
            other => reject_hidden_query(other),
        }
    }

    fn function(&mut self, function: &mut Function) -> Result<(), RlsError> {
        match &mut function.args {
            FunctionArguments::Subquery(query) => self.query(query)?,
            FunctionArguments::List(list) => {
                for argument in &mut list.args {
                    let (FunctionArg::Named { arg, .. }
                    | FunctionArg::ExprNamed { arg, .. }
                    | FunctionArg::Unnamed(arg)) = argument;
                    if let FunctionArgExpr::Expr(expr) = arg {
                        self.expr(expr)?;
                    }
                }
            }
            FunctionArguments::None => {}
        }
        if let Some(filter) = function.filter.as_mut() {
            self.expr(filter)?;
        }
        Ok(())
    }
}

/// Expressions the walk does not descend into must not hide a query.
fn reject_hidden_query(expr: &Expr) -> Result<(), RlsError> {
    let sql = expr.to_string();
    if sql.contains("SELECT ") {
        return Err(RlsError::Unsupported(format!("query nested in `{}`", sql)));
    }
    Ok(())
}

/// FULL joins, and outer joins without an ON clause, have no place for the
/// predicates of their nullable side.
fn needs_wrapping(twj: &TableWithJoins) -> bool {
    twj.joins.iter().any(|join| match &join.join_operator {
        JoinOperator::FullOuter(_) => true,
        JoinOperator::Left(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::Right(constraint)
        | JoinOperator::RightOuter(constraint) => !matches!(constraint, JoinConstraint::On(_)),
        _ => false,
    })
}

fn nullable_side(operator: &JoinOperator) -> Option<Side> {
    match operator {
        JoinOperator::Left(_) | JoinOperator::LeftOuter(_) => Some(Side::Joined),
        JoinOperator::Right(_) | JoinOperator::RightOuter(_) => Some(Side::Preceding),
        _ => None,
    }
}

fn on_condition(operator: &mut JoinOperator) -> Option<&mut Expr> {
    let constraint = match operator {
        JoinOperator::Join(constraint)
        | JoinOperator::Inner(constraint)
        | JoinOperator::Left(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::Right(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint)
        | JoinOperator::CrossJoin(constraint)
        | JoinOperator::Semi(constraint)
        | JoinOperator::LeftSemi(constraint)
        | JoinOperator::RightSemi(constraint)
        | JoinOperator::Anti(constraint)
        | JoinOperator::LeftAnti(constraint)
        | JoinOperator::RightAnti(constraint)
        | JoinOperator::StraightJoin(constraint)
        | JoinOperator::AsOf { constraint, .. } => constraint,
        JoinOperator::CrossApply | JoinOperator::OuterApply => return None,
    };
    match constraint {
        JoinConstraint::On(expr) => Some(expr),
        _ => None,
    }
}

/// Number of plain tables in `twj`, looking through nested joins.
fn plain_tables(twj: &TableWithJoins) -> usize {
    std::iter::once(&twj.relation)
        .chain(twj.joins.iter().map(|join| &join.relation))
        .map(|factor| match factor {
            TableFactor::Table { .. } => 1,
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => plain_tables(table_with_joins),
            _ => 0,
        })
        .sum()
}

/// The first FROM item of a parsed `SELECT * FROM <factor>`.
fn first_factor(statement: Option<Statement>) -> Option<TableFactor> {
    let Some(Statement::Query(query)) = statement else {
        return None;
    };
    let SetExpr::Select(select) = *query.body else {
        return None;
    };
    select.from.into_iter().next().map(|twj| twj.relation)
}

/// AND `predicates` into `selection`, skipping any already present.
fn merge_predicates(
    selection: &mut Option<Expr>,
    predicates: Vec<ScopedPredicate>,
    result: &mut InjectionResult,
) {
    for predicate in predicates {
        let rendered = predicate.expr.to_string();
        if selection
            .as_ref()
            .is_some_and(|existing| has_conjunct(existing, &rendered))
        {
            tracing::trace!(predicate = %rendered, "predicate already present");
            continue;
        }

        *selection = Some(match selection.take() {
            Some(existing) => Expr::BinaryOp {
                left: Box::new(parenthesize(existing)),
                op: BinaryOperator::And,
                right: Box::new(parenthesize(predicate.expr)),
            },
            None => predicate.expr,
        });

        result.predicates_added.push(rendered);
        if let Some(table) = predicate.table {
            if !result.tables_scoped.contains(&table) {
                result.tables_scoped.push(table);
            }
        }
    }
}

/// Wrap expressions that bind looser than AND.
fn parenthesize(expr: Expr) -> Expr {
    if matches!(
        expr,
        Expr::BinaryOp {
            op: BinaryOperator::Or | BinaryOperator::Xor,
            ..
        }
    ) {
        Expr::Nested(Box::new(expr))
    } else {
        expr
    }
}

/// Whether `rendered` is one of the AND-connected terms of `expr`.
fn has_conjunct(expr: &Expr, rendered: &str) -> bool {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => has_conjunct(left, rendered) || has_conjunct(right, rendered),
        Expr::Nested(inner) => {
            expr.to_string() == rendered
                || inner.to_string() == rendered
                || matches!(
                    inner.as_ref(),
                    Expr::BinaryOp {
                        op: BinaryOperator::And,
                        ..
                    }
                ) && has_conjunct(inner, rendered)
        }
        other => other.to_string() == rendered,
    }
}

/// Result of predicate injection.
#[derive(Debug, Clone, Serialize)]
pub struct InjectionResult {
    /// The original SQL statement.
    pub original_sql: String,
    /// The rewritten SQL with predicates.
    pub rewritten_sql: String,
    /// Tables that were scoped.
    pub tables_scoped: Vec<String>,
    /// The predicates that were added.
    pub predicates_added: Vec<String>,
}

impl InjectionResult {
    fn unchanged(sql: &str) -> Self {
        Self {
            original_sql: sql.to_string(),
            rewritten_sql: sql.to_string(),
            tables_scoped: vec![],
            predicates_added: vec![],
        }
    }

    pub fn is_rewritten(&self) -> bool {
        !self.predicates_added.is_empty()
    }
}
