//! Configuration for gated REPL sessions.
//!
//! Loaded from TOML or YAML and validated before sessions are opened.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sandbox::{Capability, CapabilitySet};
use crate::security::{default_denylist, SecurityLevel, Signature};

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Resource bounds for a single sandbox execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Interpreter steps before `StepLimitExceeded`.
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    /// Wall-clock budget in milliseconds before `Timeout`.
    #[serde(default = "default_wall_clock_ms")]
    pub wall_clock_ms: u64,
    /// Maximum function call nesting.
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    /// Bytes of output one execution may produce.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Live heap objects per session.
    #[serde(default = "default_max_heap_objects")]
    pub max_heap_objects: usize,
    /// Elements in any one list, tuple, dict or set.
    #[serde(default = "default_max_collection_len")]
    pub max_collection_len: usize,
    /// Bytes in any one string.
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,
}

fn default_max_steps() -> u64 {
    1_000_000
}

fn default_wall_clock_ms() -> u64 {
    30_000
}

fn default_max_call_depth() -> usize {
    64
}

fn default_max_output_bytes() -> usize {
    1_000_000
}

fn default_max_heap_objects() -> usize {
    1_000_000
}

fn default_max_collection_len() -> usize {
    1_000_000
}

fn default_max_string_len() -> usize {
    16 * 1024 * 1024
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            wall_clock_ms: default_wall_clock_ms(),
            max_call_depth: default_max_call_depth(),
            max_output_bytes: default_max_output_bytes(),
            max_heap_objects: default_max_heap_objects(),
            max_collection_len: default_max_collection_len(),
            max_string_len: default_max_string_len(),
        }
    }
}

/// Top-level REPL configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplConfig {
    /// Review policy for new sessions.
    #[serde(default)]
    pub security_level: SecurityLevel,
    /// Executions allowed per session.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Per-execution resource bounds.
    #[serde(default)]
    pub limits: ExecutionLimits,
    /// Sandbox primitives granted to submitted code.
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Ordered denylist used by the security filter.
    #[serde(default = "default_denylist")]
    pub denylist: Vec<Signature>,
    /// Persist code and output to the artifact sink.
    #[serde(default)]
    pub artifacts_enabled: bool,
    /// Characters of stdout returned from an execution.
    #[serde(default = "default_output_truncation_chars")]
    pub output_truncation_chars: usize,
    /// Characters of the last output shown in a state snapshot.
    #[serde(default = "default_state_output_preview_chars")]
    pub state_output_preview_chars: usize,
}

fn default_max_iterations() -> u32 {
    20
}

fn default_output_truncation_chars() -> usize {
    100_000
}

fn default_state_output_preview_chars() -> usize {
    500
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::default(),
            max_iterations: default_max_iterations(),
            limits: ExecutionLimits::default(),
            capabilities: CapabilitySet::default(),
            denylist: default_denylist(),
            artifacts_enabled: false,
            output_truncation_chars: default_output_truncation_chars(),
            state_output_preview_chars: default_state_output_preview_chars(),
        }
    }
}

impl ReplConfig {
    /// Loads configuration from a `.toml`, `.yaml` or `.yml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let config = match extension.as_deref() {
            Some("toml") => Self::from_toml(&text)?,
            Some("yaml") | Some("yml") => Self::from_yaml(&text)?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config format {:?} for {}",
                    other.unwrap_or(""),
                    path.display()
                )))
            }
        };
        tracing::debug!(path = %path.display(), level = %config.security_level, "Loaded REPL config");
        Ok(config)
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Config(format!("invalid YAML: {}", e)))
    }
}

impl Validate for ExecutionLimits {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.max_steps == 0 {
            result.add_error("limits.max_steps must be at least 1");
        }

        if self.wall_clock_ms == 0 {
            result.add_error("limits.wall_clock_ms must be at least 1");
        }

        if self.max_call_depth == 0 {
            result.add_error("limits.max_call_depth must be at least 1");
        }

        if self.max_heap_objects == 0 || self.max_collection_len == 0 {
            result.add_error("limits.max_heap_objects and max_collection_len must be at least 1");
        }

        // Deep recursion runs on the worker's native stack
        if self.max_call_depth > 200 {
            result.add_warning("limits.max_call_depth over 200 risks exhausting the worker stack");
        }

        if self.wall_clock_ms > 600_000 {
            result.add_warning("limits.wall_clock_ms over 10 minutes may indicate a misconfiguration");
        }

        result
    }
}

impl Validate for ReplConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = self.limits.validate();

        if self.max_iterations == 0 {
            result.add_error("max_iterations must be at least 1");
        }

        if self.output_truncation_chars == 0 {
            result.add_error("output_truncation_chars must be at least 1");
        }

        if self.security_level != SecurityLevel::None && self.denylist.is_empty() {
            result.add_warning(format!(
                "denylist is empty - security level '{}' will approve everything",
                self.security_level
            ));
        }

        for sig in &self.denylist {
            if sig.pattern.trim().is_empty() {
                result.add_error("denylist contains an empty pattern");
            }
        }

        if !self.capabilities.contains(Capability::Output) {
            result.add_warning("output capability disabled - print() is unavailable");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn repl_config_has_sensible_defaults() {
        let config = ReplConfig::default();

        assert_eq!(config.security_level, SecurityLevel::Basic);
        assert_eq!(config.max_iterations, 20);
        assert_eq!(config.limits.max_steps, 1_000_000);
        assert_eq!(config.limits.wall_clock_ms, 30_000);
        assert_eq!(config.limits.max_call_depth, 64);
        assert_eq!(config.output_truncation_chars, 100_000);
        assert_eq!(config.state_output_preview_chars, 500);
        assert!(!config.artifacts_enabled);
        assert_eq!(config.denylist, default_denylist());
        assert!(config.validate().is_valid());
    }

    #[test]
    fn repl_config_deserializes_from_toml() {
        let toml = r#"
            security_level = "strict"
            max_iterations = 5
            capabilities = ["data", "output"]

            [limits]
            max_steps = 500
        "#;

        let config = ReplConfig::from_toml(toml).unwrap();
        assert_eq!(config.security_level, SecurityLevel::Strict);
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.limits.max_steps, 500);
        assert_eq!(config.limits.wall_clock_ms, 30_000);
        assert!(config.capabilities.contains(Capability::Output));
        assert!(!config.capabilities.contains(Capability::ModelQuery));
    }

    #[test]
    fn repl_config_deserializes_from_yaml() {
        let yaml = r#"
security_level: none
denylist:
  - pattern: "rm -rf"
    reason: "destructive shell command"
"#;

        let config = ReplConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.security_level, SecurityLevel::None);
        assert_eq!(config.denylist.len(), 1);
        assert_eq!(config.denylist[0].pattern, "rm -rf");
        assert_eq!(config.max_iterations, 20);
    }

    #[test]
    fn load_picks_format_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(file, "max_iterations: 3").unwrap();
        let config = ReplConfig::load(file.path()).unwrap();
        assert_eq!(config.max_iterations, 3);

        let other = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(matches!(ReplConfig::load(other.path()), Err(Error::Config(_))));
    }

    #[test]
    fn zero_limits_are_errors() {
        let config = ReplConfig {
            max_iterations: 0,
            limits: ExecutionLimits {
                max_steps: 0,
                wall_clock_ms: 0,
                ..ExecutionLimits::default()
            },
            ..ReplConfig::default()
        };

        let result = config.validate();
        assert!(!result.is_valid());
        assert_eq!(result.errors.len(), 3);
        assert!(result.into_result().is_err());
    }

    #[test]
    fn empty_denylist_and_missing_output_are_warnings() {
        let config = ReplConfig {
            denylist: Vec::new(),
            capabilities: CapabilitySet::all().without(Capability::Output),
            ..ReplConfig::default()
        };

        let result = config.validate();
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 2);
        assert_eq!(result.into_result().unwrap().len(), 2);
    }
}
