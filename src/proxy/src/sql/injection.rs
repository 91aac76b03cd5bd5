//! Regex-based injection pattern detector (§4.4). Fails closed: constructing a detector from an
//! empty (or entirely invalid) pattern set makes every subsequent `check` report a match, so a
//! misconfigured or emptied pattern list can never silently let traffic through.

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionResult {
    pub detected: bool,
    /// The source regex string that matched. Audit-only — never returned to the client.
    pub pattern: Option<String>,
    pub reason: String,
}

impl InjectionResult {
    fn clean() -> Self {
        InjectionResult {
            detected: false,
            pattern: None,
            reason: String::new(),
        }
    }
}

pub struct InjectionDetector {
    patterns: Vec<(String, Regex)>,
    fail_close_active: bool,
}

impl InjectionDetector {
    /// Compiles each source string case-insensitively. Invalid sources are dropped (and should be
    /// logged by the caller); if the resulting compiled set is empty, the detector enters
    /// fail-close-active mode.
    pub fn new(sources: &[String]) -> Self {
        let patterns: Vec<(String, Regex)> = sources
            .iter()
            .filter_map(|src| {
                regex::RegexBuilder::new(src)
                    .case_insensitive(true)
                    .build()
                    .ok()
                    .map(|re| (src.clone(), re))
            })
            .collect();
        let fail_close_active = patterns.is_empty();
        InjectionDetector {
            patterns,
            fail_close_active,
        }
    }

    pub fn check(&self, sql: &str) -> InjectionResult {
        if self.fail_close_active {
            return InjectionResult {
                detected: true,
                pattern: None,
                reason: "no valid patterns loaded".to_string(),
            };
        }
        for (source, re) in &self.patterns {
            if re.is_match(sql) {
                return InjectionResult {
                    detected: true,
                    pattern: Some(source.clone()),
                    reason: format!("matched injection pattern: {source}"),
                };
            }
        }
        InjectionResult::clean()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pattern_set_is_fail_close_active() {
        let d = InjectionDetector::new(&[]);
        let r = d.check("SELECT 1");
        assert!(r.detected);
        assert_eq!(r.reason, "no valid patterns loaded");
    }

    #[test]
    fn all_invalid_patterns_is_also_fail_close_active() {
        let d = InjectionDetector::new(&["(unterminated".to_string()]);
        assert!(d.check("anything").detected);
    }

    #[test]
    fn matches_case_insensitively() {
        let d = InjectionDetector::new(&["union\\s+select".to_string()]);
        let r = d.check("1 UNION   SELECT password FROM users");
        assert!(r.detected);
        assert_eq!(r.pattern.as_deref(), Some("union\\s+select"));
    }

    #[test]
    fn no_match_is_clean() {
        let d = InjectionDetector::new(&["drop\\s+table".to_string()]);
        let r = d.check("SELECT 1");
        assert!(!r.detected);
        assert!(r.pattern.is_none());
    }
}
