//! Best-effort static pre-filter for submitted code.
//!
//! The filter is an ordered substring scan over a denylist of signatures.
//! It cannot see through obfuscation (string concatenation, aliasing,
//! indirect lookups) and is not an isolation boundary: code that passes
//! the filter still runs inside the capability-restricted sandbox, which
//! simply has no process, file or network primitives to call.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How much scrutiny submitted code receives before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// No checks. Every submission is approved immediately.
    None,
    /// Denylist scan. Approval or rejection is automatic.
    #[default]
    Basic,
    /// Denylist scan is advisory; a reviewer must approve or reject.
    Strict,
}

impl SecurityLevel {
    /// Returns the persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::None => "none",
            SecurityLevel::Basic => "basic",
            SecurityLevel::Strict => "strict",
        }
    }

    /// Returns true if review resolves without an external decision.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, SecurityLevel::Strict)
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(SecurityLevel::None),
            "basic" => Ok(SecurityLevel::Basic),
            "strict" => Ok(SecurityLevel::Strict),
            other => Err(format!("unknown security level '{}'", other)),
        }
    }
}

/// A denylisted text signature and the reason reported when it matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Substring searched for in the submitted code.
    pub pattern: String,
    /// Human-readable reason reported on a match.
    pub reason: String,
}

impl Signature {
    /// Creates a new signature.
    pub fn new(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }
}

/// Returns the built-in ordered denylist.
pub fn default_denylist() -> Vec<Signature> {
    vec![
        // Process and interpreter escape hatches
        Signature::new("import os", "os module import blocked"),
        Signature::new("import subprocess", "subprocess module import blocked"),
        Signature::new("import sys", "sys module import blocked for security"),
        Signature::new("__import__('os')", "dynamic os import blocked"),
        Signature::new("__import__('subprocess')", "dynamic subprocess import blocked"),
        Signature::new("eval(", "eval() is blocked"),
        Signature::new("exec(", "exec() is blocked"),
        Signature::new("compile(", "compile() is blocked"),
        // Filesystem escapes
        Signature::new("open('/", "absolute path file access restricted"),
        Signature::new("open(\"/", "absolute path file access restricted"),
        Signature::new("../", "parent directory traversal blocked"),
        // Shell execution
        Signature::new("os.system", "os.system() is blocked"),
        Signature::new("subprocess.", "subprocess operations blocked"),
        // Network primitives
        Signature::new("import socket", "socket module import blocked"),
        Signature::new("urllib", "network access via urllib blocked"),
        Signature::new("requests.", "network access via requests blocked"),
    ]
}

/// Outcome of a filter check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterVerdict {
    /// Whether the code may proceed.
    pub allowed: bool,
    /// Human-readable explanation.
    pub reason: String,
    /// The pattern that matched, if any.
    pub matched: Option<String>,
}

impl FilterVerdict {
    fn allow(reason: &str) -> Self {
        Self {
            allowed: true,
            reason: reason.to_string(),
            matched: None,
        }
    }
}

/// Ordered denylist scanner.
#[derive(Debug, Clone)]
pub struct SecurityFilter {
    denylist: Vec<Signature>,
}

impl Default for SecurityFilter {
    fn default() -> Self {
        Self::new(default_denylist())
    }
}

impl SecurityFilter {
    /// Creates a filter over the given ordered denylist.
    pub fn new(denylist: Vec<Signature>) -> Self {
        Self { denylist }
    }

    /// Returns the denylist in scan order.
    pub fn denylist(&self) -> &[Signature] {
        &self.denylist
    }

    /// Checks code against the denylist at the given level.
    ///
    /// Returns the first matching signature in denylist order. At
    /// [`SecurityLevel::Strict`] the verdict is advisory; the caller is
    /// still expected to obtain a reviewer decision.
    pub fn check(&self, code: &str, level: SecurityLevel) -> FilterVerdict {
        if level == SecurityLevel::None {
            return FilterVerdict::allow("Security checks disabled");
        }

        for sig in &self.denylist {
            if !sig.pattern.is_empty() && code.contains(&sig.pattern) {
                return FilterVerdict {
                    allowed: false,
                    reason: format!("{} (matched `{}`)", sig.reason, sig.pattern),
                    matched: Some(sig.pattern.clone()),
                };
            }
        }

        FilterVerdict::allow("Code passed security checks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_none_allows_anything() {
        let filter = SecurityFilter::default();
        let verdict = filter.check("import os\nos.system('rm -rf /')", SecurityLevel::None);
        assert!(verdict.allowed);
        assert!(verdict.matched.is_none());
    }

    #[test]
    fn basic_blocks_shell_invocation() {
        let filter = SecurityFilter::default();
        let verdict = filter.check("x = 1\nos.system(\"ls\")", SecurityLevel::Basic);
        assert!(!verdict.allowed);
        assert_eq!(verdict.matched.as_deref(), Some("os.system"));
        assert!(verdict.reason.contains("os.system"));
    }

    #[test]
    fn first_match_in_denylist_order_wins() {
        let filter = SecurityFilter::default();
        let verdict = filter.check("import os\nos.system(\"ls\")", SecurityLevel::Basic);
        assert_eq!(verdict.matched.as_deref(), Some("import os"));
        assert!(verdict.reason.starts_with("os module import blocked"));
    }

    #[test]
    fn strict_scans_the_same_denylist() {
        let filter = SecurityFilter::default();
        assert!(!filter.check("eval('1')", SecurityLevel::Strict).allowed);
        assert!(filter.check("sum([1, 2])", SecurityLevel::Strict).allowed);
    }

    #[test]
    fn clean_code_passes_basic() {
        let filter = SecurityFilter::default();
        let verdict = filter.check("total = sum(range(10))\ntotal", SecurityLevel::Basic);
        assert!(verdict.allowed);
        assert_eq!(verdict.reason, "Code passed security checks");
    }

    #[test]
    fn custom_denylist_is_respected() {
        let filter = SecurityFilter::new(vec![Signature::new("llm_query", "no model calls")]);
        let verdict = filter.check("llm_query('hi')", SecurityLevel::Basic);
        assert!(!verdict.allowed);
        assert!(filter.check("import os", SecurityLevel::Basic).allowed);
    }

    #[test]
    fn obfuscated_equivalents_are_not_detected() {
        // Known limitation: the scan is purely textual.
        let filter = SecurityFilter::default();
        let verdict = filter.check("m = 'o' + 's'\nx = m", SecurityLevel::Basic);
        assert!(verdict.allowed);
    }

    #[test]
    fn security_level_round_trips_through_strings() {
        assert_eq!("STRICT".parse::<SecurityLevel>().unwrap(), SecurityLevel::Strict);
        assert_eq!(SecurityLevel::Basic.to_string(), "basic");
        assert!("paranoid".parse::<SecurityLevel>().is_err());
        assert_eq!(
            serde_json::to_string(&SecurityLevel::None).unwrap(),
            "\"none\""
        );
    }
}
