//! The policy document: an immutable value, swapped atomically on reload (§3, §6).
//!
//! Loaded from a YAML file with `serde_yaml`. Unknown fields are rejected so a config typo fails
//! closed at load time instead of silently being ignored.

use crate::error::PolicyConfigError;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub max_connections: u32,
    pub idle_timeout_seconds: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TimeRestriction {
    /// `HH:MM-HH:MM`. A range where start > end is inclusive of both halves (wraps midnight).
    pub allow_range: String,
    /// IANA zone name, e.g. `America/New_York`.
    pub zone: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AccessRule {
    /// `*` matches any user.
    pub user: String,
    #[serde(default)]
    pub source_ip_cidr: Option<String>,
    #[serde(default)]
    pub allowed_tables: Vec<String>,
    #[serde(default)]
    pub allowed_operations: Vec<String>,
    #[serde(default)]
    pub blocked_operations: Vec<String>,
    #[serde(default)]
    pub time_restriction: Option<TimeRestriction>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct SqlRules {
    #[serde(default)]
    pub block_statements: Vec<String>,
    #[serde(default)]
    pub block_patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureMode {
    Whitelist,
    Blacklist,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProcedureControl {
    pub mode: ProcedureMode,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub block_dynamic_sql: bool,
    #[serde(default)]
    pub block_create_alter: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct DataProtection {
    #[serde(default)]
    pub max_result_rows: Option<u64>,
    #[serde(default)]
    pub block_schema_access: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub global: GlobalSettings,
    #[serde(default)]
    pub access_control: Vec<AccessRule>,
    #[serde(default)]
    pub sql_rules: SqlRules,
    pub procedure_control: ProcedureControl,
    #[serde(default)]
    pub data_protection: DataProtection,
}

impl PolicyConfig {
    fn validate(self) -> Result<Self, PolicyConfigError> {
        if self.sql_rules.block_patterns.is_empty() {
            return Err(PolicyConfigError::EmptyBlockPatterns);
        }
        Ok(self)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, PolicyConfigError> {
        let cfg: PolicyConfig = serde_yaml::from_str(s)?;
        cfg.validate()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
global:
  log_level: info
  max_connections: 100
  idle_timeout_seconds: 300
access_control:
  - user: "*"
    allowed_tables: ["*"]
    allowed_operations: ["*"]
sql_rules:
  block_statements: []
  block_patterns: ["union\\s+select"]
procedure_control:
  mode: blacklist
  names: []
  block_dynamic_sql: false
  block_create_alter: false
"#;

    #[test]
    fn loads_a_valid_document() {
        let cfg = PolicyConfig::from_yaml_str(VALID_YAML).unwrap();
        assert_eq!(cfg.global.max_connections, 100);
        assert_eq!(cfg.access_control.len(), 1);
    }

    #[test]
    fn rejects_empty_block_patterns() {
        let yaml = VALID_YAML.replace(r#"["union\\s+select"]"#, "[]");
        let result = PolicyConfig::from_yaml_str(&yaml);
        assert!(matches!(
            result,
            Err(PolicyConfigError::EmptyBlockPatterns)
        ));
    }

    #[test]
    fn rejects_unknown_fields() {
        let yaml = format!("{VALID_YAML}\nextra_field: true\n");
        assert!(PolicyConfig::from_yaml_str(&yaml).is_err());
    }
}
