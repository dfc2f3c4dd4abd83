//! `rowguard check` command implementation.
//!
//! Validates a configuration file the same way the interceptor does at
//! startup, then looks for rules that load fine but can never take effect.

use anyhow::Result;
use std::path::{Path, PathBuf};

use rowguard_core::RowGuardConfig;
use rowguard_rls::{SqlAnalyzer, SqlCodec};

// ============================================================================
// Check Result Types
// ============================================================================

/// Severity level for check results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational message.
    Info,
    /// Warning - the rule loads but probably does not do what was meant.
    Warning,
    /// Error - the interceptor would refuse to start.
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// A single check finding.
#[derive(Debug, Clone)]
pub struct CheckFinding {
    pub severity: Severity,
    /// Category of the check that produced this finding.
    pub category: String,
    pub message: String,
    /// Optional location within the file (e.g., "operations.system.user").
    pub location: Option<String>,
}

impl CheckFinding {
    fn error(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category: category.into(),
            message: message.into(),
            location: None,
        }
    }

    fn warning(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            category: category.into(),
            message: message.into(),
            location: None,
        }
    }

    fn info(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            category: category.into(),
            message: message.into(),
            location: None,
        }
    }

    fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Results from running all checks.
#[derive(Debug, Default)]
pub struct CheckResults {
    pub findings: Vec<CheckFinding>,
}

impl CheckResults {
    fn extend(&mut self, findings: impl IntoIterator<Item = CheckFinding>) {
        self.findings.extend(findings);
    }

    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }

    /// Print human-readable summary.
    pub fn print_summary(&self) {
        let mut findings: Vec<_> = self.findings.iter().collect();
        findings.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.category.cmp(&b.category))
        });

        for finding in &findings {
            print_finding(finding);
        }

        println!();
        println!("{}", "═".repeat(60));
        let errors = self.count(Severity::Error);
        let warnings = self.count(Severity::Warning);
        if errors == 0 && warnings == 0 {
            println!("✔ All checks passed!");
        } else {
            println!("Summary: {} error(s), {} warning(s)", errors, warnings);
        }
    }
}

fn print_finding(finding: &CheckFinding) {
    let icon = match finding.severity {
        Severity::Error => "✗",
        Severity::Warning => "⚠",
        Severity::Info => "ℹ",
    };

    let location = finding
        .location
        .as_ref()
        .map(|l| format!(" [{}]", l))
        .unwrap_or_default();

    println!(
        "  {} {} [{}]{}: {}",
        icon, finding.severity, finding.category, location, finding.message
    );
}

// ============================================================================
// Main Check Runner
// ============================================================================

/// Run all configuration checks without printing anything.
pub fn run_quiet(config_path: &Path) -> Result<CheckResults> {
    let mut results = CheckResults::default();

    // 1. Load, resolve tenancy_file and run startup validation
    let config = match RowGuardConfig::load_with_context(config_path) {
        Ok(config) => config,
        Err(e) => {
            results.extend([CheckFinding::error("config", e.to_string())
                .with_location(config_path.display().to_string())]);
            return Ok(results);
        }
    };

    // 2. Deny predicate must be a valid expression in the configured dialect
    results.extend(check_deny_predicate(&config));

    // 3. Rules that are switched off globally
    results.extend(check_disabled_concerns(&config));

    // 4. Tables both tenant-scoped and global
    results.extend(check_global_tables(&config));

    // 5. Rules hidden behind a more specific rule
    results.extend(check_shadowed_rules(&config));

    Ok(results)
}

/// Run all configuration checks and print the findings.
pub fn run(config_path: &Path) -> Result<()> {
    println!("Checking rowguard configuration {}...", config_path.display());
    println!();

    let results = run_quiet(config_path)?;
    results.print_summary();

    if results.has_errors() {
        anyhow::bail!(
            "Configuration check failed with {} error(s)",
            results.count(Severity::Error)
        );
    }
    Ok(())
}

/// Default configuration path, relative to the working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("rowguard.yaml")
}

// ============================================================================
// Individual checks
// ============================================================================

fn check_deny_predicate(config: &RowGuardConfig) -> Vec<CheckFinding> {
    let analyzer = SqlAnalyzer::with_dialect(config.dialect);
    match analyzer.parse_expr(&config.data_permission.deny_predicate) {
        Ok(_) => vec![],
        Err(e) => vec![
            CheckFinding::error("deny-predicate", e.to_string())
                .with_location("data_permission.deny_predicate"),
        ],
    }
}

fn check_disabled_concerns(config: &RowGuardConfig) -> Vec<CheckFinding> {
    let mut findings = Vec::new();

    if config.operations.is_empty() {
        findings.push(CheckFinding::warning(
            "operations",
            "No operation rules declared; no statement will ever be scoped",
        ));
    }

    for (operation_id, rule) in &config.operations {
        let location = format!("operations.{}", operation_id);
        if rule.tenant && !config.tenancy.enabled {
            findings.push(
                CheckFinding::warning(
                    "tenancy",
                    format!(
                        "Operation '{}' requests tenant scoping but tenancy.enabled is false",
                        operation_id
                    ),
                )
                .with_location(location.clone()),
            );
        }
        if rule.data_permission.is_some() && !config.data_permission.enabled {
            findings.push(
                CheckFinding::warning(
                    "data-permission",
                    format!(
                        "Operation '{}' declares data_permission but it is disabled globally",
                        operation_id
                    ),
                )
                .with_location(location),
            );
        }
    }

    findings
}

fn check_global_tables(config: &RowGuardConfig) -> Vec<CheckFinding> {
    let mut tables: Vec<_> = config
        .tenancy
        .tables
        .iter()
        .filter(|(name, table)| !table.global && config.tenancy.is_global_table(name))
        .map(|(name, _)| name.as_str())
        .collect();
    tables.sort_unstable();

    tables
        .into_iter()
        .map(|name| {
            CheckFinding::warning(
                "tenancy",
                format!(
                    "Table '{}' has a tenant column but is listed in global_tables",
                    name
                ),
            )
            .with_location(format!("tenancy.tables.{}", name))
        })
        .collect()
}

fn check_shadowed_rules(config: &RowGuardConfig) -> Vec<CheckFinding> {
    let mut findings = Vec::new();
    for operation_id in config.operations.keys() {
        let mut namespace = operation_id.as_str();
        while let Some(pos) = namespace.rfind('.') {
            namespace = &namespace[..pos];
            if config.operations.contains_key(namespace) {
                findings.push(
                    CheckFinding::info(
                        "operations",
                        format!(
                            "Rule for '{}' overrides the rule for namespace '{}'",
                            operation_id, namespace
                        ),
                    )
                    .with_location(format!("operations.{}", operation_id)),
                );
                break;
            }
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn check(yaml: &str) -> CheckResults {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rowguard.yaml");
        fs::write(&path, yaml).unwrap();
        run_quiet(&path).unwrap()
    }

    #[test]
    fn test_valid_config_passes() {
        let results = check(
            r#"
tenancy:
  enabled: true
operations:
  system.notice:
    tenant: true
"#,
        );
        assert!(!results.has_errors());
        assert_eq!(results.count(Severity::Warning), 0);
    }

    #[test]
    fn test_invalid_rule_is_an_error() {
        let results = check(
            r#"
operations:
  system.notice: {}
"#,
        );
        assert!(results.has_errors());
        assert_eq!(results.findings[0].category, "config");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let results = run_quiet(&dir.path().join("missing.yaml")).unwrap();
        assert!(results.has_errors());
    }

    #[test]
    fn test_bad_deny_predicate() {
        let results = check(
            r#"
data_permission:
  deny_predicate: "1 = = 0"
operations:
  system.user:
    data_permission:
      table: sys_user
"#,
        );
        assert!(
            results
                .findings
                .iter()
                .any(|f| f.category == "deny-predicate" && f.severity == Severity::Error)
        );
    }

    #[test]
    fn test_warnings_for_rules_that_never_apply() {
        let results = check(
            r#"
tenancy:
  enabled: false
  tables:
    sys_tenant:
      tenant_column: id
  global_tables: [sys_tenant]
operations:
  system.notice:
    tenant: true
  system.notice.select_all:
    tenant: true
"#,
        );
        assert!(!results.has_errors());
        // Two tenant rules with tenancy off, plus the global table overlap.
        assert_eq!(results.count(Severity::Warning), 3);
        assert_eq!(results.count(Severity::Info), 1);
    }
}
