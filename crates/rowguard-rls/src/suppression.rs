//! Reentrant suppression ("ignore") scopes.
//!
//! Every concern keeps its own depth counter, while all concerns of one
//! context share a single [`IgnoreStrategy`] holding one flag per concern.
//! Leaving the outermost scope of a concern only discards the shared
//! strategy when no sibling concern still has its flag set.

use std::fmt;

/// Something whose predicate injection (or check) can be suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Concern {
    /// Tenant isolation predicates.
    TenantLine,
    /// Department/user data-permission predicates.
    DataPermission,
    /// Illegal-SQL checks performed by other interceptors.
    IllegalSql,
    /// Full-table UPDATE/DELETE blocking performed by other interceptors.
    BlockAttack,
    /// Dynamic table name replacement performed by other interceptors.
    DynamicTableName,
}

const CONCERN_COUNT: usize = 5;

impl Concern {
    pub const ALL: [Concern; CONCERN_COUNT] = [
        Concern::TenantLine,
        Concern::DataPermission,
        Concern::IllegalSql,
        Concern::BlockAttack,
        Concern::DynamicTableName,
    ];

    fn index(self) -> usize {
        match self {
            Concern::TenantLine => 0,
            Concern::DataPermission => 1,
            Concern::IllegalSql => 2,
            Concern::BlockAttack => 3,
            Concern::DynamicTableName => 4,
        }
    }
}

impl fmt::Display for Concern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Concern::TenantLine => "tenant_line",
            Concern::DataPermission => "data_permission",
            Concern::IllegalSql => "illegal_sql",
            Concern::BlockAttack => "block_attack",
            Concern::DynamicTableName => "dynamic_table_name",
        };
        f.write_str(name)
    }
}

/// The shared flag holder: which concerns are currently ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IgnoreStrategy {
    flags: [bool; CONCERN_COUNT],
}

impl IgnoreStrategy {
    /// A strategy ignoring exactly `concern`.
    pub fn only(concern: Concern) -> Self {
        let mut strategy = Self::default();
        strategy.set(concern, true);
        strategy
    }

    pub fn is_set(&self, concern: Concern) -> bool {
        self.flags[concern.index()]
    }

    pub fn set(&mut self, concern: Concern, value: bool) {
        self.flags[concern.index()] = value;
    }

    /// Whether any concern other than `concern` is set.
    pub fn has_other_than(&self, concern: Concern) -> bool {
        Concern::ALL
            .iter()
            .any(|&other| other != concern && self.is_set(other))
    }
}

/// Per-context suppression state.
#[derive(Debug, Clone, Default)]
pub struct SuppressionScope {
    depths: [u32; CONCERN_COUNT],
    strategy: Option<IgnoreStrategy>,
}

impl SuppressionScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a suppression scope for `concern`.
    pub fn enable(&mut self, concern: Concern) {
        match self.strategy.as_mut() {
            Some(strategy) => strategy.set(concern, true),
            None => self.strategy = Some(IgnoreStrategy::only(concern)),
        }
        self.depths[concern.index()] += 1;
    }

    /// Leave a suppression scope for `concern`.
    ///
    /// Unbalanced calls are tolerated: they log a warning and change nothing.
    pub fn disable(&mut self, concern: Concern) {
        let depth = &mut self.depths[concern.index()];
        if *depth == 0 {
            tracing::warn!(%concern, "disable called without a matching enable; ignoring");
            return;
        }
        *depth -= 1;
        if *depth > 0 {
            return;
        }

        let Some(strategy) = self.strategy.as_mut() else {
            return;
        };
        if strategy.has_other_than(concern) {
            strategy.set(concern, false);
        } else {
            self.strategy = None;
        }
    }

    pub fn is_suppressed(&self, concern: Concern) -> bool {
        self.strategy.is_some_and(|s| s.is_set(concern))
    }

    pub fn depth(&self, concern: Concern) -> u32 {
        self.depths[concern.index()]
    }

    /// The shared strategy, if any concern is currently suppressed.
    pub fn ignore_strategy(&self) -> Option<IgnoreStrategy> {
        self.strategy
    }

    /// True when no concern is suppressed.
    pub fn is_idle(&self) -> bool {
        self.strategy.is_none() && self.depths.iter().all(|&d| d == 0)
    }

    /// Drop all suppression state, e.g. at the end of a unit of work.
    pub fn clear(&mut self) {
        if !self.is_idle() {
            tracing::debug!(strategy = ?self.strategy, "clearing leftover suppression state");
        }
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_disable_single_concern() {
        let mut scope = SuppressionScope::new();
        assert!(!scope.is_suppressed(Concern::TenantLine));

        scope.enable(Concern::TenantLine);
        assert!(scope.is_suppressed(Concern::TenantLine));
        assert_eq!(scope.depth(Concern::TenantLine), 1);

        scope.disable(Concern::TenantLine);
        assert!(!scope.is_suppressed(Concern::TenantLine));
        assert!(scope.ignore_strategy().is_none());
        assert!(scope.is_idle());
    }

    #[test]
    fn test_nested_enable_keeps_suppression_until_outermost_disable() {
        let mut scope = SuppressionScope::new();
        scope.enable(Concern::DataPermission);
        scope.enable(Concern::DataPermission);
        scope.enable(Concern::DataPermission);

        scope.disable(Concern::DataPermission);
        scope.disable(Concern::DataPermission);
        assert!(scope.is_suppressed(Concern::DataPermission));

        scope.disable(Concern::DataPermission);
        assert!(!scope.is_suppressed(Concern::DataPermission));
    }

    #[test]
    fn test_sibling_concern_survives_early_exit() {
        let mut scope = SuppressionScope::new();
        scope.enable(Concern::TenantLine);
        scope.enable(Concern::DataPermission);

        // Tenant exits first; the shared strategy must stay for data permission.
        scope.disable(Concern::TenantLine);
        assert!(!scope.is_suppressed(Concern::TenantLine));
        assert!(scope.is_suppressed(Concern::DataPermission));
        assert!(scope.ignore_strategy().is_some());

        scope.disable(Concern::DataPermission);
        assert!(scope.ignore_strategy().is_none());
    }

    #[test]
    fn test_second_concern_reuses_existing_strategy() {
        let mut scope = SuppressionScope::new();
        scope.enable(Concern::BlockAttack);
        scope.enable(Concern::TenantLine);

        let strategy = scope.ignore_strategy().unwrap();
        assert!(strategy.is_set(Concern::BlockAttack));
        assert!(strategy.is_set(Concern::TenantLine));
        assert!(!strategy.is_set(Concern::DataPermission));
    }

    #[test]
    fn test_unbalanced_disable_is_noop() {
        let mut scope = SuppressionScope::new();
        scope.disable(Concern::TenantLine);
        assert_eq!(scope.depth(Concern::TenantLine), 0);

        scope.enable(Concern::DataPermission);
        scope.disable(Concern::TenantLine);
        assert!(scope.is_suppressed(Concern::DataPermission));
        assert_eq!(scope.depth(Concern::TenantLine), 0);
    }

    #[test]
    fn test_interleaved_sequences_track_each_concern_independently() {
        use Concern::{DataPermission as D, TenantLine as T};

        // (concern, enable?) sequences, balanced overall.
        let sequences: &[&[(Concern, bool)]] = &[
            &[(T, true), (D, true), (T, true), (D, false), (T, false), (T, false)],
            &[(D, true), (T, true), (D, true), (D, false), (T, false), (D, false)],
            &[(T, true), (T, true), (D, true), (T, false), (D, false), (T, false)],
        ];

        for sequence in sequences {
            let mut scope = SuppressionScope::new();
            let mut expected = [0i32; 2];
            for &(concern, enable) in *sequence {
                let slot = if concern == T { 0 } else { 1 };
                if enable {
                    scope.enable(concern);
                    expected[slot] += 1;
                } else {
                    scope.disable(concern);
                    expected[slot] -= 1;
                }
                assert_eq!(scope.is_suppressed(T), expected[0] > 0);
                assert_eq!(scope.is_suppressed(D), expected[1] > 0);
            }
            assert!(scope.is_idle());
        }
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut scope = SuppressionScope::new();
        scope.enable(Concern::TenantLine);
        scope.enable(Concern::IllegalSql);
        scope.clear();
        assert!(scope.is_idle());
        assert_eq!(scope.depth(Concern::TenantLine), 0);
    }
}
