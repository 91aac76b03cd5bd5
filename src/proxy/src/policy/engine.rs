//! The policy evaluation engine (§4.6): holds an atomically-swappable `PolicyConfig` and runs the
//! ordered, contractual evaluation pipeline. Allow is produced only by the pipeline's final step;
//! every earlier return is Block. `PolicyResult::default()` is `Block`, so "no explicit allow
//! match" is the default constructible value rather than something each branch has to remember.

use crate::error::ClassifyError;
use crate::policy::config::{PolicyConfig, ProcedureMode};
use crate::server::session_context::SessionContext;
use crate::sql::classifier::{ParsedQuery, QueryKind};
use crate::sql::procedure::{detect_procedure, ProcedureKind};

use arc_swap::ArcSwapOption;
use chrono::{NaiveTime, Timelike};
use std::net::Ipv4Addr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Block,
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyResult {
    pub action: Action,
    pub matched_rule: String,
    pub reason: String,
}

impl Default for PolicyResult {
    fn default() -> Self {
        PolicyResult::block("no-config", "no policy config loaded")
    }
}

impl PolicyResult {
    fn block(rule: &str, reason: impl Into<String>) -> Self {
        PolicyResult {
            action: Action::Block,
            matched_rule: rule.to_string(),
            reason: reason.into(),
        }
    }

    fn allow(rule: impl Into<String>) -> Self {
        PolicyResult {
            action: Action::Allow,
            matched_rule: rule.into(),
            reason: "explicit access rule match".to_string(),
        }
    }
}

pub struct PolicyEngine {
    config: ArcSwapOption<PolicyConfig>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    pub fn new() -> Self {
        PolicyEngine {
            config: ArcSwapOption::from(None),
        }
    }

    pub fn with_config(config: PolicyConfig) -> Self {
        PolicyEngine {
            config: ArcSwapOption::from(Some(Arc::new(config))),
        }
    }

    /// Atomically replaces the config handle. In-flight evaluations holding a previous `Arc`
    /// complete unaffected; subsequent calls observe the new config. `None` is allowed and causes
    /// subsequent evaluations to Block.
    pub fn reload(&self, new_config: Option<PolicyConfig>) {
        self.config.store(new_config.map(Arc::new));
    }

    /// The config snapshot currently in effect, if any. Used by callers that need read-only
    /// access to global settings (e.g. `max_connections`) without duplicating the atomic handle.
    pub fn current(&self) -> Option<Arc<PolicyConfig>> {
        self.config.load_full()
    }

    /// Non-throwing by contract: always returns Block, regardless of internal state.
    pub fn evaluate_error(&self, err: &ClassifyError, _ctx: &SessionContext) -> PolicyResult {
        PolicyResult::block("invalid-sql", err.0.clone())
    }

    pub fn evaluate(&self, query: &ParsedQuery, ctx: &SessionContext) -> PolicyResult {
        let config = match self.config.load_full() {
            Some(c) => c,
            None => return PolicyResult::block("no-config", "no policy config loaded"),
        };

        if query.kind == QueryKind::Unknown {
            return PolicyResult::block("unknown-command", "unrecognized statement keyword");
        }

        let command_name = query.kind.as_str();

        if config
            .sql_rules
            .block_statements
            .iter()
            .any(|s| s.eq_ignore_ascii_case(command_name))
        {
            return PolicyResult::block(
                "block-statement",
                format!("statement '{command_name}' is blocked by sql_rules.block_statements"),
            );
        }

        for pattern in &config.sql_rules.block_patterns {
            if let Ok(re) = regex::RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
            {
                if re.is_match(&query.raw_sql) {
                    return PolicyResult::block(
                        "block-pattern",
                        format!("matched block pattern: {pattern}"),
                    );
                }
            }
        }

        let rule = config.access_control.iter().find(|r| {
            let user_matches = r.user == "*" || r.user == ctx.db_user;
            let ip_matches = match &r.source_ip_cidr {
                None => true,
                Some(cidr) => cidr_contains(cidr, ctx.client_ip),
            };
            user_matches && ip_matches
        });
        let rule = match rule {
            Some(r) => r,
            None => return PolicyResult::block("no-access-rule", "no access rule matched"),
        };

        if rule
            .blocked_operations
            .iter()
            .any(|op| op.eq_ignore_ascii_case(command_name))
        {
            return PolicyResult::block(
                "blocked-operation",
                format!("operation '{command_name}' is in blocked_operations"),
            );
        }

        if let Some(restriction) = &rule.time_restriction {
            match time_in_range(&restriction.allow_range, &restriction.zone) {
                Some(true) => {}
                Some(false) => {
                    return PolicyResult::block(
                        "time-restriction",
                        "current time is outside the allowed window",
                    )
                }
                None => {
                    return PolicyResult::block(
                        "time-restriction",
                        "failed to evaluate time restriction",
                    )
                }
            }
        }

        let tables_ok = rule.allowed_tables.iter().any(|t| t == "*")
            || query.tables.is_empty()
            || query
                .tables
                .iter()
                .all(|t| rule.allowed_tables.iter().any(|a| a.eq_ignore_ascii_case(t)));
        if !tables_ok {
            return PolicyResult::block("allowed-tables", "referenced table not in allowed_tables");
        }

        if !rule.allowed_operations.is_empty()
            && !rule.allowed_operations.iter().any(|o| o == "*")
            && !rule
                .allowed_operations
                .iter()
                .any(|o| o.eq_ignore_ascii_case(command_name))
        {
            return PolicyResult::block(
                "allowed-operations",
                format!("operation '{command_name}' not in allowed_operations"),
            );
        }

        if matches!(
            query.kind,
            QueryKind::Call | QueryKind::Prepare | QueryKind::Execute
        ) {
            if let Some(info) = detect_procedure(query) {
                if info.is_dynamic_sql && config.procedure_control.block_dynamic_sql {
                    return PolicyResult::block(
                        "procedure-control",
                        "dynamic SQL (PREPARE/EXECUTE) is blocked",
                    );
                }
                if info.kind == ProcedureKind::Call {
                    let name = info.name.as_deref().unwrap_or("");
                    let listed = config
                        .procedure_control
                        .names
                        .iter()
                        .any(|n| n.eq_ignore_ascii_case(name));
                    match config.procedure_control.mode {
                        ProcedureMode::Whitelist if !listed => {
                            return PolicyResult::block(
                                "procedure-control",
                                format!("procedure '{name}' is not whitelisted"),
                            )
                        }
                        ProcedureMode::Blacklist if listed => {
                            return PolicyResult::block(
                                "procedure-control",
                                format!("procedure '{name}' is blacklisted"),
                            )
                        }
                        _ => {}
                    }
                }
            }
        }
        if matches!(query.kind, QueryKind::Create | QueryKind::Alter)
            && config.procedure_control.block_create_alter
        {
            if let Some(info) = detect_procedure(query) {
                if matches!(
                    info.kind,
                    ProcedureKind::CreateProcedure | ProcedureKind::AlterProcedure
                ) {
                    return PolicyResult::block(
                        "procedure-control",
                        "CREATE/ALTER PROCEDURE is blocked",
                    );
                }
            }
        }

        if config.data_protection.block_schema_access {
            const PROTECTED: [&str; 4] =
                ["information_schema", "mysql", "performance_schema", "sys"];
            if query
                .tables
                .iter()
                .any(|t| PROTECTED.iter().any(|p| p.eq_ignore_ascii_case(t)))
            {
                return PolicyResult::block(
                    "schema-protection",
                    "access to a protected schema table is blocked",
                );
            }
        }

        PolicyResult::allow(format!("access-rule:{}", ctx.db_user))
    }
}

fn cidr_contains(cidr: &str, ip: Ipv4Addr) -> bool {
    match cidr.parse::<ipnet::Ipv4Net>() {
        Ok(net) => net.contains(&ip),
        Err(_) => false,
    }
}

/// Parses `HH:MM-HH:MM`, computes the current wall-clock time in `zone`, and reports whether it
/// falls within the range. A range crossing midnight (start > end) is inclusive of both halves.
/// Returns `None` on any parse or zone-lookup failure — the caller treats that as Block, never
/// Allow.
fn time_in_range(range: &str, zone: &str) -> Option<bool> {
    let tz: chrono_tz::Tz = zone.parse().ok()?;
    let (start_str, end_str) = range.split_once('-')?;
    let start = NaiveTime::parse_from_str(start_str.trim(), "%H:%M").ok()?;
    let end = NaiveTime::parse_from_str(end_str.trim(), "%H:%M").ok()?;
    let now = chrono::Utc::now().with_timezone(&tz).time();
    let now_secs = now.num_seconds_from_midnight();
    let start_secs = start.num_seconds_from_midnight();
    let end_secs = end.num_seconds_from_midnight();
    if start_secs <= end_secs {
        Some(now_secs >= start_secs && now_secs <= end_secs)
    } else {
        Some(now_secs >= start_secs || now_secs <= end_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::config::PolicyConfig;
    use crate::sql::classifier::classify;
    use std::net::Ipv4Addr;

    fn ctx() -> SessionContext {
        SessionContext::new(1, Ipv4Addr::new(127, 0, 0, 1), 5000)
    }

    const BASE_YAML: &str = r#"
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
    fn no_config_blocks() {
        let engine = PolicyEngine::new();
        let q = classify("SELECT 1").unwrap();
        let result = engine.evaluate(&q, &ctx());
        assert_eq!(result.action, Action::Block);
        assert_eq!(result.matched_rule, "no-config");
    }

    #[test]
    fn unknown_command_blocks() {
        let cfg = PolicyConfig::from_yaml_str(BASE_YAML).unwrap();
        let engine = PolicyEngine::with_config(cfg);
        let q = classify("EXPLAIN SELECT 1").unwrap();
        let result = engine.evaluate(&q, &ctx());
        assert_eq!(result.action, Action::Block);
        assert_eq!(result.matched_rule, "unknown-command");
    }

    #[test]
    fn allow_path_with_wildcard_rule() {
        let cfg = PolicyConfig::from_yaml_str(BASE_YAML).unwrap();
        let engine = PolicyEngine::with_config(cfg);
        let q = classify("SELECT 1").unwrap();
        let result = engine.evaluate(&q, &ctx());
        assert_eq!(result.action, Action::Allow);
    }

    #[test]
    fn block_statement_takes_precedence() {
        let yaml = BASE_YAML.replace("block_statements: []", "block_statements: [\"DROP\"]");
        let cfg = PolicyConfig::from_yaml_str(&yaml).unwrap();
        let engine = PolicyEngine::with_config(cfg);
        let q = classify("DROP TABLE users").unwrap();
        let result = engine.evaluate(&q, &ctx());
        assert_eq!(result.action, Action::Block);
        assert_eq!(result.matched_rule, "block-statement");
    }

    #[test]
    fn empty_access_control_always_blocks() {
        let cfg = PolicyConfig::from_yaml_str(BASE_YAML).unwrap();
        let mut cfg = cfg;
        cfg.access_control.clear();
        let engine = PolicyEngine::with_config(cfg);
        let q = classify("SELECT 1").unwrap();
        assert_eq!(engine.evaluate(&q, &ctx()).action, Action::Block);
    }

    #[test]
    fn reload_is_observed_by_next_evaluation() {
        let cfg_a = PolicyConfig::from_yaml_str(BASE_YAML).unwrap();
        let engine = PolicyEngine::with_config(cfg_a);
        let q = classify("DROP TABLE t").unwrap();
        assert_eq!(engine.evaluate(&q, &ctx()).action, Action::Allow);

        let yaml_b = BASE_YAML.replace("block_statements: []", "block_statements: [\"DROP\"]");
        let cfg_b = PolicyConfig::from_yaml_str(&yaml_b).unwrap();
        engine.reload(Some(cfg_b));

        assert_eq!(engine.evaluate(&q, &ctx()).action, Action::Block);
    }

    #[test]
    fn evaluate_error_always_blocks() {
        let cfg = PolicyConfig::from_yaml_str(BASE_YAML).unwrap();
        let engine = PolicyEngine::with_config(cfg);
        let err = ClassifyError("multi-statement".to_string());
        let result = engine.evaluate_error(&err, &ctx());
        assert_eq!(result.action, Action::Block);
    }
}
