//! Independently toggleable groups of sandbox primitives.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A group of primitives that sandboxed code may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Container and scalar constructors, `len`, container methods.
    Data,
    /// `range`, `enumerate`, `zip`, `map`, `filter`, `sorted`, `reversed`, `any`, `all`.
    Iteration,
    /// `abs`, `round`, `pow`, `divmod`, `min`, `max`, `sum`.
    Arithmetic,
    /// `chr`, `ord`, `hex`, `bin`, `oct`, `repr`, `format` and string methods.
    Strings,
    /// `type`, `isinstance`, `callable`, `hasattr`, `getattr`, `dir`, `hash`.
    Introspection,
    /// Exception classes usable in `raise` and `except`.
    Errors,
    /// `print`.
    Output,
    /// The read-only `context` binding.
    Context,
    /// `llm_query`, forwarding a prompt to the secondary model.
    ModelQuery,
    /// `FINAL_VAR`, reading a variable back as the final answer.
    FinalVar,
    /// `import math` and `import json`.
    Modules,
}

impl Capability {
    pub const ALL: [Capability; 11] = [
        Capability::Data,
        Capability::Iteration,
        Capability::Arithmetic,
        Capability::Strings,
        Capability::Introspection,
        Capability::Errors,
        Capability::Output,
        Capability::Context,
        Capability::ModelQuery,
        Capability::FinalVar,
        Capability::Modules,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Data => "data",
            Capability::Iteration => "iteration",
            Capability::Arithmetic => "arithmetic",
            Capability::Strings => "strings",
            Capability::Introspection => "introspection",
            Capability::Errors => "errors",
            Capability::Output => "output",
            Capability::Context => "context",
            Capability::ModelQuery => "model_query",
            Capability::FinalVar => "final_var",
            Capability::Modules => "modules",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| format!("unknown capability '{}'", s))
    }
}

/// The set of capabilities granted to a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    enabled: BTreeSet<Capability>,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::all()
    }
}

impl CapabilitySet {
    /// Every capability enabled.
    pub fn all() -> Self {
        Self {
            enabled: Capability::ALL.into_iter().collect(),
        }
    }

    /// Nothing enabled; only literals and control flow remain.
    pub fn none() -> Self {
        Self {
            enabled: BTreeSet::new(),
        }
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.enabled.insert(capability);
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.enabled.remove(&capability);
        self
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.enabled.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.enabled.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            enabled: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grants_everything() {
        let caps = CapabilitySet::default();
        assert!(Capability::ALL.iter().all(|c| caps.contains(*c)));
    }

    #[test]
    fn capabilities_toggle_independently() {
        let caps = CapabilitySet::all()
            .without(Capability::ModelQuery)
            .without(Capability::Output);
        assert!(!caps.contains(Capability::ModelQuery));
        assert!(!caps.contains(Capability::Output));
        assert!(caps.contains(Capability::Data));

        let caps = CapabilitySet::none().with(Capability::Arithmetic);
        assert_eq!(caps.iter().collect::<Vec<_>>(), vec![Capability::Arithmetic]);
    }

    #[test]
    fn serializes_as_a_list_of_names() {
        let caps = CapabilitySet::none()
            .with(Capability::Output)
            .with(Capability::ModelQuery);
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, "[\"output\",\"model_query\"]");

        let parsed: CapabilitySet = serde_json::from_str("[\"data\", \"final_var\"]").unwrap();
        assert!(parsed.contains(Capability::FinalVar));
        assert_eq!("modules".parse::<Capability>().unwrap(), Capability::Modules);
    }
}
