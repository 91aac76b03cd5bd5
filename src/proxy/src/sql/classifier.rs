//! A deliberately sub-parser SQL classifier. Its job is to yield a `ParsedQuery` fast and
//! correctly enough for first-keyword policy and table-level ACLs, not to fully parse SQL.
//!
//! Known limits, which the procedure detector and the fail-close policy engine compensate for
//! rather than this module trying to close: subquery inner tables are not extracted; a keyword
//! split across a block comment (`UN/**/ION`) only evades detection when the split falls inside
//! the keyword itself; URL- or hex-encoded payloads are invisible; prepared-statement bodies
//! embedded as string literals are not inspected.

use crate::error::ClassifyError;
use once_cell_regexes::*;

/// The discriminated command tag of a parsed query. `Unknown` must never reach the evaluator as
/// allowable; the evaluator always treats it as blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
    Drop,
    Truncate,
    Alter,
    Create,
    Call,
    Prepare,
    Execute,
    Unknown,
}

impl QueryKind {
    /// The upper-case keyword this tag corresponds to, used for case-insensitive rule matching
    /// against `block_statements` / `allowed_operations` / `blocked_operations`.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Select => "SELECT",
            QueryKind::Insert => "INSERT",
            QueryKind::Update => "UPDATE",
            QueryKind::Delete => "DELETE",
            QueryKind::Drop => "DROP",
            QueryKind::Truncate => "TRUNCATE",
            QueryKind::Alter => "ALTER",
            QueryKind::Create => "CREATE",
            QueryKind::Call => "CALL",
            QueryKind::Prepare => "PREPARE",
            QueryKind::Execute => "EXECUTE",
            QueryKind::Unknown => "UNKNOWN",
        }
    }

    fn from_token(token: &str) -> QueryKind {
        match token {
            "SELECT" => QueryKind::Select,
            "INSERT" => QueryKind::Insert,
            "UPDATE" => QueryKind::Update,
            "DELETE" => QueryKind::Delete,
            "DROP" => QueryKind::Drop,
            "TRUNCATE" => QueryKind::Truncate,
            "ALTER" => QueryKind::Alter,
            "CREATE" => QueryKind::Create,
            "CALL" => QueryKind::Call,
            "PREPARE" => QueryKind::Prepare,
            "EXECUTE" => QueryKind::Execute,
            _ => QueryKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub kind: QueryKind,
    pub tables: Vec<String>,
    pub raw_sql: String,
    /// Comment-stripped, upper-cased form. Keyword checks that must ignore text hidden inside
    /// comments (e.g. the `PROCEDURE` check in `sql::procedure`) match against this, not `raw_sql`.
    pub normalized_sql: String,
    pub has_where_clause: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum GateState {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    BlockComment,
    LineComment,
    HashComment,
}

/// Scans the raw SQL for a statement-separating `;` outside string/comment regions. Runs before
/// comment stripping because comments may themselves contain semicolons.
fn multi_statement_gate(sql: &str) -> Result<(), ClassifyError> {
    let bytes = sql.as_bytes();
    let mut state = GateState::Normal;
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        match state {
            GateState::Normal => match b {
                b'\'' => state = GateState::SingleQuoted,
                b'"' => state = GateState::DoubleQuoted,
                b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                    state = GateState::BlockComment;
                    i += 1;
                }
                b'-' if i + 1 < bytes.len() && bytes[i + 1] == b'-' => {
                    state = GateState::LineComment;
                    i += 1;
                }
                b'#' => state = GateState::HashComment,
                b';' => {
                    return Err(ClassifyError(
                        "multiple statements in a single request".to_string(),
                    ))
                }
                _ => {}
            },
            GateState::SingleQuoted => match b {
                b'\\' => i += 1,
                b'\'' => {
                    // doubled quote closes-and-reopens the same literal; otherwise it closes it.
                    if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                        i += 1;
                    } else {
                        state = GateState::Normal;
                    }
                }
                _ => {}
            },
            GateState::DoubleQuoted => match b {
                b'\\' => i += 1,
                b'"' => {
                    if i + 1 < bytes.len() && bytes[i + 1] == b'"' {
                        i += 1;
                    } else {
                        state = GateState::Normal;
                    }
                }
                _ => {}
            },
            GateState::BlockComment => {
                if b == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                    state = GateState::Normal;
                    i += 1;
                }
            }
            GateState::LineComment | GateState::HashComment => {
                if b == b'\n' {
                    state = GateState::Normal;
                }
            }
        }
        i += 1;
    }
    if state == GateState::SingleQuoted || state == GateState::DoubleQuoted {
        return Err(ClassifyError(
            "statement contains an unterminated string literal".to_string(),
        ));
    }
    Ok(())
}

/// Replaces block comments with a single space (to keep `DROP/**/TABLE` from fusing into
/// `DROPTABLE`) and drops `-- ...` / `# ...` line comments. Nested block comments are not
/// supported.
fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut i = 0usize;
    let mut in_single = false;
    let mut in_double = false;
    while i < bytes.len() {
        let b = bytes[i];
        if in_single {
            out.push(b as char);
            if b == b'\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1] as char);
                i += 2;
                continue;
            }
            if b == b'\'' {
                in_single = false;
            }
            i += 1;
            continue;
        }
        if in_double {
            out.push(b as char);
            if b == b'\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1] as char);
                i += 2;
                continue;
            }
            if b == b'"' {
                in_double = false;
            }
            i += 1;
            continue;
        }
        if b == b'\'' {
            in_single = true;
            out.push('\'');
            i += 1;
            continue;
        }
        if b == b'"' {
            in_double = true;
            out.push('"');
            i += 1;
            continue;
        }
        if b == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            i += 2;
            while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                i += 1;
            }
            i = (i + 2).min(bytes.len());
            out.push(' ');
            continue;
        }
        if b == b'-' && i + 1 < bytes.len() && bytes[i + 1] == b'-' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if b == b'#' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        out.push(b as char);
        i += 1;
    }
    out
}

mod once_cell_regexes {
    use regex::Regex;
    use std::sync::OnceLock;

    pub fn table_keyword_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(r"(?i)\b(FROM|JOIN|INTO|UPDATE|TABLE)\s+([^\s;()]+(?:\s*,\s*[^\s;()]+)*)")
                .unwrap()
        })
    }

    pub fn where_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"(?i)\bWHERE\b").unwrap())
    }
}

fn strip_backticks(s: &str) -> String {
    s.trim_matches('`').to_string()
}

/// Restores the author's original case for `candidate` by a case-insensitive, identifier-boundary
/// search in `raw_sql`. Falls back to the normalized candidate if no boundary-respecting match is
/// found.
fn recover_case(raw_sql: &str, candidate: &str) -> String {
    let lower_candidate = candidate.to_ascii_lowercase();
    let raw_lower = raw_sql.to_ascii_lowercase();
    let is_ident_byte = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'$';
    let mut start = 0usize;
    while let Some(pos) = raw_lower[start..].find(&lower_candidate) {
        let abs = start + pos;
        let before_ok = abs == 0 || !is_ident_byte(raw_lower.as_bytes()[abs - 1]);
        let end = abs + lower_candidate.len();
        let after_ok = end >= raw_lower.len() || !is_ident_byte(raw_lower.as_bytes()[end]);
        if before_ok && after_ok {
            return raw_sql[abs..end].to_string();
        }
        start = abs + 1;
        if start >= raw_lower.len() {
            break;
        }
    }
    candidate.to_string()
}

fn extract_tables(normalized: &str, raw_sql: &str) -> Vec<String> {
    let mut seen_lower = std::collections::HashSet::new();
    let mut tables = Vec::new();
    for caps in once_cell_regexes::table_keyword_re().captures_iter(normalized) {
        let list = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        for raw_tok in list.split(',') {
            let tok = raw_tok.trim();
            if tok.is_empty() || tok.starts_with('(') {
                continue;
            }
            let tok = strip_backticks(tok);
            let lower = tok.to_ascii_lowercase();
            if seen_lower.contains(&lower) {
                continue;
            }
            seen_lower.insert(lower);
            tables.push(recover_case(raw_sql, &tok));
        }
    }
    tables
}

/// Runs the full classifier pipeline: multi-statement gate, comment stripping, normalization,
/// first-keyword classification, table extraction, and WHERE-presence detection.
pub fn classify(raw_sql: &str) -> Result<ParsedQuery, ClassifyError> {
    if raw_sql.trim().is_empty() {
        return Err(ClassifyError("empty statement".to_string()));
    }
    multi_statement_gate(raw_sql)?;
    let stripped = strip_comments(raw_sql);
    let normalized = stripped.to_ascii_uppercase();

    let first_token = normalized
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string();
    let kind = QueryKind::from_token(&first_token);

    let tables = extract_tables(&normalized, raw_sql);
    let has_where_clause = once_cell_regexes::where_re().is_match(&normalized);

    Ok(ParsedQuery {
        kind,
        tables,
        raw_sql: raw_sql.to_string(),
        normalized_sql: normalized,
        has_where_clause,
    })
}
