//! # rowguard-rls
//!
//! Row-level access control for SQL statements.
//!
//! This crate provides functionality to:
//! - Parse SQL with `sqlparser` behind the [`SqlCodec`] trait
//! - Resolve per-operation scoping rules (tenant isolation, data permissions)
//! - Inject the resulting predicates into SELECT/UPDATE/DELETE statements
//! - Suppress scoping for a block of work, reentrantly and per concern
//!
//! ## How It Works
//!
//! The engine hands every statement to [`RowScopeInterceptor`] together with
//! the caller's [`RequestContext`]:
//!
//! **Before:**
//! ```sql
//! SELECT * FROM orders o WHERE o.status = 'open'
//! ```
//!
//! **After (tenant `000000`):**
//! ```sql
//! SELECT * FROM orders o WHERE o.status = 'open' AND o.tenant_id = '000000'
//! ```
//!
//! ## Supported Operations
//!
//! | Operation | Behavior |
//! |-----------|----------|
//! | `SELECT`  | Every select scope gets `AND predicate`, subqueries included |
//! | `UPDATE`  | WHERE clause, covering the `FROM` tables too |
//! | `DELETE`  | WHERE clause, covering the `USING` tables too |
//! | `INSERT`  | Passed through unchanged |
//! | DDL       | Passed through unchanged |
//!
//! Tables on the nullable side of an outer join are scoped in the join's
//! `ON` clause. A FULL join, or an outer join without `ON`, has its tables
//! replaced by filtered derived tables. Stacked statements are each scoped
//! by their own kind; an unscopable statement in a stack is rejected.

pub mod context;
pub mod data_scope;
pub mod error;
pub mod injector;
pub mod interceptor;
pub mod key_prefix;
pub mod parser;
pub mod resolver;
pub mod suppression;
pub mod tenant;

pub use context::{Anonymous, RequestContext, Session, SuppressionGuard};
pub use data_scope::{DeptDirectory, StaticDeptDirectory};
pub use error::RlsError;
pub use injector::{InjectionResult, Placement, PredicateSource, RlsInjector, Scope};
pub use interceptor::{BoundStatement, RowScopeInterceptor, SqlCommand, StatementHook};
pub use key_prefix::TenantKeyMapper;
pub use parser::{SqlAnalyzer, SqlCodec, SqlOperation, TableReference};
pub use resolver::{PermissionRule, RuleResolver, ScopedPredicate};
pub use suppression::{Concern, IgnoreStrategy, SuppressionScope};
pub use tenant::{InMemoryTenantStore, TenantContext, TenantStore};
