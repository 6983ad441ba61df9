//! Error types shared by the classifier, evaluator and variable store.

use thiserror::Error;

/// Broad category of a [`VariableError`], used by hosts to decide how to
/// surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed statement text or illegal identifier
    Parse,
    /// Unknown solution, variable or alias
    Reference,
    /// Non-numeric operand, disallowed identifier, arithmetic domain error
    Evaluation,
    /// Duplicate variable, alias or solution name
    NameCollision,
    /// Formula would close a circular dependency
    Cycle,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VariableError {
    #[error("Invalid statement: {0}")]
    InvalidStatement(String),

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Parse error at position {position}: {message}")]
    Syntax { message: String, position: usize },

    #[error("Solution '{0}' not found")]
    UnknownSolution(String),

    #[error("Variable '{variable}' not found in solution '{solution}'")]
    UnknownVariable { variable: String, solution: String },

    #[error("Cannot assign to '{variable}@{target}' from solution '{current}'")]
    ForeignTarget {
        variable: String,
        target: String,
        current: String,
    },

    #[error("Variable '{reference}' is not numeric: {value}")]
    NotNumeric { reference: String, value: String },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Unknown identifier: '{0}'")]
    UnknownIdentifier(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Name '{0}' is already taken")]
    NameCollision(String),

    #[error("Circular dependency: {}", .0.join(" → "))]
    CircularDependency(Vec<String>),

    #[error("Evaluation depth limit of {0} exceeded")]
    DepthExceeded(usize),

    #[error("Unsupported workspace format version {0}")]
    UnsupportedVersion(u32),

    #[error("No legacy ids left after #{0}")]
    IdsExhausted(u32),
}

impl VariableError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidStatement(_) | Self::InvalidName { .. } | Self::UnsupportedVersion(_) => {
                ErrorKind::Parse
            }
            Self::UnknownSolution(_) | Self::UnknownVariable { .. } | Self::ForeignTarget { .. } => {
                ErrorKind::Reference
            }
            Self::Syntax { .. }
            | Self::NotNumeric { .. }
            | Self::DivisionByZero
            | Self::UnknownFunction(_)
            | Self::UnknownIdentifier(_)
            | Self::InvalidArgument(_) => ErrorKind::Evaluation,
            Self::NameCollision(_) | Self::IdsExhausted(_) => ErrorKind::NameCollision,
            Self::CircularDependency(_) | Self::DepthExceeded(_) => ErrorKind::Cycle,
        }
    }

    pub(crate) fn invalid_name(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(VariableError::UnknownSolution("x".into()).kind(), ErrorKind::Reference);
        assert_eq!(VariableError::DivisionByZero.kind(), ErrorKind::Evaluation);
        assert_eq!(VariableError::NameCollision("a".into()).kind(), ErrorKind::NameCollision);
        assert_eq!(VariableError::invalid_name("a.b", "dot").kind(), ErrorKind::Parse);
        assert_eq!(VariableError::DepthExceeded(4).kind(), ErrorKind::Cycle);
        assert_eq!(VariableError::IdsExhausted(u32::MAX).kind(), ErrorKind::NameCollision);
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = VariableError::CircularDependency(vec!["a.X".into(), "b.Y".into(), "a.X".into()]);
        assert_eq!(err.to_string(), "Circular dependency: a.X → b.Y → a.X");
    }
}
