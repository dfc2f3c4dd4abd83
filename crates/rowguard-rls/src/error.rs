//! Error types for the RLS crate.

use thiserror::Error;

/// Errors that can occur while scoping a statement.
#[derive(Debug, Error)]
pub enum RlsError {
    /// SQL parsing failed. The statement must not be executed.
    #[error("failed to parse SQL: {0}")]
    ParseError(String),

    /// A predicate fragment could not be turned into an expression.
    #[error("invalid predicate '{predicate}': {reason}")]
    InvalidPredicate { predicate: String, reason: String },

    /// The statement contains something predicates cannot be placed on.
    /// Like a parse failure, it must not be executed.
    #[error("statement cannot be scoped: {0}")]
    Unsupported(String),

    /// Tenant scoping applies but no tenant could be determined.
    #[error("tenant value required but not provided")]
    MissingTenantValue,

    /// Configuration rejected at startup.
    #[error("invalid configuration: {0}")]
    Config(#[from] rowguard_core::ConfigError),

    /// Internal error (e.g. the shared tenant store failed).
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
