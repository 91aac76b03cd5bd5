//! Stored-procedure and dynamic-SQL detection (§4.5). Dispatches on a query's command tag, not on
//! its own parse pass, so it always agrees with the classifier about what statement it's looking
//! at.

use crate::sql::classifier::{ParsedQuery, QueryKind};
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    Call,
    CreateProcedure,
    AlterProcedure,
    DropProcedure,
    PrepareExecute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureInfo {
    pub kind: ProcedureKind,
    /// Only meaningful for `Call`.
    pub name: Option<String>,
    pub is_dynamic_sql: bool,
}

fn call_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)CALL\s+([\w.]+)\s*\(").unwrap())
}

fn procedure_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bPROCEDURE\b").unwrap())
}

/// Returns `None` for any command that isn't CALL / CREATE·ALTER·DROP PROCEDURE / PREPARE /
/// EXECUTE. For `Create`/`Alter`/`Drop`, only fires if the statement's comment-stripped,
/// upper-cased form contains the whole word `PROCEDURE` — letting table DDL fall through to
/// table-level ACLs untouched.
pub fn detect_procedure(query: &ParsedQuery) -> Option<ProcedureInfo> {
    match query.kind {
        QueryKind::Call => {
            let name = call_name_re()
                .captures(&query.raw_sql)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            Some(ProcedureInfo {
                kind: ProcedureKind::Call,
                name,
                is_dynamic_sql: false,
            })
        }
        QueryKind::Create | QueryKind::Alter | QueryKind::Drop => {
            if !procedure_word_re().is_match(&query.normalized_sql) {
                return None;
            }
            let kind = match query.kind {
                QueryKind::Create => ProcedureKind::CreateProcedure,
                QueryKind::Alter => ProcedureKind::AlterProcedure,
                _ => ProcedureKind::DropProcedure,
            };
            Some(ProcedureInfo {
                kind,
                name: None,
                is_dynamic_sql: false,
            })
        }
        QueryKind::Prepare | QueryKind::Execute => Some(ProcedureInfo {
            kind: ProcedureKind::PrepareExecute,
            name: None,
            is_dynamic_sql: true,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::classifier::classify;

    #[test]
    fn call_extracts_procedure_name() {
        let q = classify("CALL my_proc(1, 2)").unwrap();
        let info = detect_procedure(&q).unwrap();
        assert_eq!(info.kind, ProcedureKind::Call);
        assert_eq!(info.name.as_deref(), Some("my_proc"));
        assert!(!info.is_dynamic_sql);
    }

    #[test]
    fn drop_procedure_is_detected() {
        let q = classify("DROP PROCEDURE my_proc").unwrap();
        let info = detect_procedure(&q).unwrap();
        assert_eq!(info.kind, ProcedureKind::DropProcedure);
    }

    #[test]
    fn drop_table_is_not_a_procedure() {
        let q = classify("DROP TABLE users").unwrap();
        assert!(detect_procedure(&q).is_none());
    }

    #[test]
    fn procedure_word_hidden_in_a_comment_does_not_trigger() {
        let q = classify("CREATE TABLE t /* PROCEDURE */ (id INT)").unwrap();
        assert!(detect_procedure(&q).is_none());
    }

    #[test]
    fn prepare_and_execute_are_dynamic_sql() {
        let q = classify("PREPARE s FROM 'SELECT 1'").unwrap();
        let info = detect_procedure(&q).unwrap();
        assert_eq!(info.kind, ProcedureKind::PrepareExecute);
        assert!(info.is_dynamic_sql);
    }

    #[test]
    fn select_has_no_procedure_info() {
        let q = classify("SELECT 1").unwrap();
        assert!(detect_procedure(&q).is_none());
    }
}
