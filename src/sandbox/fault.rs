//! Runtime faults raised by sandboxed code.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of a fault, named after the exception it models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    SyntaxError,
    NameError,
    TypeError,
    ValueError,
    KeyError,
    IndexError,
    ZeroDivisionError,
    AttributeError,
    ImportError,
    AssertionError,
    RuntimeError,
    RecursionError,
    OverflowError,
    ModelError,
    /// Raised by `raise Exception(...)`.
    Exception,
    /// Step budget exhausted.
    StepLimitExceeded,
    /// Wall-clock deadline passed.
    Timeout,
    /// Output or heap allocation bound exceeded.
    MemoryError,
}

impl FaultKind {
    /// Name as seen from sandboxed code.
    pub fn name(&self) -> &'static str {
        match self {
            FaultKind::SyntaxError => "SyntaxError",
            FaultKind::NameError => "NameError",
            FaultKind::TypeError => "TypeError",
            FaultKind::ValueError => "ValueError",
            FaultKind::KeyError => "KeyError",
            FaultKind::IndexError => "IndexError",
            FaultKind::ZeroDivisionError => "ZeroDivisionError",
            FaultKind::AttributeError => "AttributeError",
            FaultKind::ImportError => "ImportError",
            FaultKind::AssertionError => "AssertionError",
            FaultKind::RuntimeError => "RuntimeError",
            FaultKind::RecursionError => "RecursionError",
            FaultKind::OverflowError => "OverflowError",
            FaultKind::ModelError => "ModelError",
            FaultKind::Exception => "Exception",
            FaultKind::StepLimitExceeded => "StepLimitExceeded",
            FaultKind::Timeout => "Timeout",
            FaultKind::MemoryError => "MemoryError",
        }
    }

    /// Looks up a catchable kind by its sandbox name.
    pub fn from_name(name: &str) -> Option<FaultKind> {
        CATCHABLE.iter().copied().find(|k| k.name() == name)
    }

    /// Resource-bound faults cannot be caught by `try`/`except`.
    pub fn is_catchable(&self) -> bool {
        !matches!(
            self,
            FaultKind::StepLimitExceeded
                | FaultKind::Timeout
                | FaultKind::MemoryError
                | FaultKind::SyntaxError
        )
    }

    /// Returns true if an `except <handler>` clause catches `self`.
    pub fn caught_by(&self, handler: FaultKind) -> bool {
        if !self.is_catchable() {
            return false;
        }
        handler == *self || handler == FaultKind::Exception
    }
}

/// Kinds exposed as exception classes inside the sandbox.
pub const CATCHABLE: &[FaultKind] = &[
    FaultKind::Exception,
    FaultKind::NameError,
    FaultKind::TypeError,
    FaultKind::ValueError,
    FaultKind::KeyError,
    FaultKind::IndexError,
    FaultKind::ZeroDivisionError,
    FaultKind::AttributeError,
    FaultKind::ImportError,
    FaultKind::AssertionError,
    FaultKind::RuntimeError,
    FaultKind::RecursionError,
    FaultKind::OverflowError,
    FaultKind::ModelError,
];

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fault with its message and, when known, the source line.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    pub line: Option<usize>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    pub fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::SyntaxError,
            message: message.into(),
            line: Some(line),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(FaultKind::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(FaultKind::ValueError, message)
    }

    pub fn name_error(name: &str) -> Self {
        Self::new(FaultKind::NameError, format!("name '{}' is not defined", name))
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new(FaultKind::IndexError, message)
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new(FaultKind::ZeroDivisionError, message)
    }

    pub fn overflow() -> Self {
        Self::new(FaultKind::OverflowError, "integer overflow")
    }

    /// Attaches a line number if none is recorded yet.
    pub fn at_line(mut self, line: usize) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)?;
        } else {
            write!(f, "{}: {}", self.kind, self.message)?;
        }
        match self.line {
            Some(line) => write!(f, " (line {})", line),
            None => Ok(()),
        }
    }
}

impl std::error::Error for Fault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_faults_are_not_catchable() {
        assert!(!FaultKind::Timeout.caught_by(FaultKind::Exception));
        assert!(!FaultKind::StepLimitExceeded.caught_by(FaultKind::StepLimitExceeded));
        assert!(FaultKind::KeyError.caught_by(FaultKind::Exception));
        assert!(!FaultKind::KeyError.caught_by(FaultKind::ValueError));
    }

    #[test]
    fn display_includes_line_when_known() {
        let fault = Fault::name_error("x").at_line(3);
        assert_eq!(fault.to_string(), "NameError: name 'x' is not defined (line 3)");
        assert_eq!(FaultKind::from_name("KeyError"), Some(FaultKind::KeyError));
        assert_eq!(FaultKind::from_name("Timeout"), None);
        assert_eq!(Fault::new(FaultKind::ValueError, "").to_string(), "ValueError");
    }
}
