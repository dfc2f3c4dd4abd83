//! CLI command implementations for rowguard.

pub mod check;
pub mod explain;
