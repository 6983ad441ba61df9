//! Core types for the variable system.

use super::error::VariableError;
use super::evaluator::{evaluate_as, evaluate_variable};
use super::registry::Scope;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A literal value held by a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// What the user last assigned to a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Literal(Value),
    Formula(String),
}

/// Where a variable sits in its literal/formula lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableState {
    Literal,
    /// Formula whose most recent evaluation succeeded
    Valid,
    /// Formula whose most recent evaluation failed; the last good value is kept
    Error,
}

/// A named cell inside a solution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Variable name (case-sensitive, unique within its solution)
    pub name: String,
    /// Name of the owning solution
    pub solution: String,
    /// Numeric id for `#id` addressing, unique across the registry
    pub legacy_id: u32,
    /// Literal or formula text
    pub raw: RawValue,
    /// Result of the most recent successful formula evaluation
    pub last_value: f64,
    /// Error message if the most recent formula evaluation failed
    pub error: Option<String>,
}

impl Variable {
    /// Create a new variable holding a literal
    pub fn new(name: &str, solution: &str, legacy_id: u32, value: Value) -> Self {
        Self {
            name: name.to_string(),
            solution: solution.to_string(),
            legacy_id,
            raw: RawValue::Literal(value),
            last_value: 0.0,
            error: None,
        }
    }

    pub fn is_formula(&self) -> bool {
        matches!(self.raw, RawValue::Formula(_))
    }

    pub fn formula(&self) -> Option<&str> {
        match &self.raw {
            RawValue::Formula(text) => Some(text),
            RawValue::Literal(_) => None,
        }
    }

    pub fn state(&self) -> VariableState {
        match (&self.raw, &self.error) {
            (RawValue::Literal(_), _) => VariableState::Literal,
            (RawValue::Formula(_), None) => VariableState::Valid,
            (RawValue::Formula(_), Some(_)) => VariableState::Error,
        }
    }

    /// Store a literal, dropping any formula and error state.
    pub fn set_literal(&mut self, value: Value) {
        self.raw = RawValue::Literal(value);
        self.error = None;
    }

    /// Store a formula and evaluate it right away against `scope`.
    ///
    /// The formula is kept even when evaluation fails; the failure is
    /// recorded in [`Variable::error`] and returned.
    pub fn set_formula(&mut self, text: &str, scope: &Scope<'_>) -> Result<f64, VariableError> {
        let scope = scope.for_solution(&self.solution);
        let result = evaluate_as(&self.read_id(), text, &scope);
        self.store_formula(text, result)
    }

    /// Commit a formula together with the outcome of evaluating it.
    pub fn store_formula(
        &mut self,
        text: &str,
        result: Result<f64, VariableError>,
    ) -> Result<f64, VariableError> {
        self.raw = RawValue::Formula(text.to_string());
        self.apply(result)
    }

    /// Record an evaluation outcome without touching the formula text.
    pub(crate) fn apply(
        &mut self,
        result: Result<f64, VariableError>,
    ) -> Result<f64, VariableError> {
        match result {
            Ok(value) => {
                self.last_value = value;
                self.error = None;
                Ok(value)
            }
            Err(e) => {
                self.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Current value without recomputation.
    pub fn value(&self) -> Value {
        match &self.raw {
            RawValue::Literal(v) => v.clone(),
            RawValue::Formula(_) => Value::Number(self.last_value),
        }
    }

    /// Current value, re-evaluating a formula when a scope is supplied.
    ///
    /// On failure the error is recorded and the last good value returned.
    pub fn get_value(&mut self, scope: Option<&Scope<'_>>) -> Value {
        if let (Some(scope), true) = (scope, self.is_formula()) {
            let result = evaluate_variable(self, scope);
            // Failure is already captured on the variable.
            let _ = self.apply(result);
        }
        self.value()
    }

    /// `#id.name`
    pub fn legacy_reference(&self) -> String {
        format!("#{}.{}", self.legacy_id, self.name)
    }

    /// `name@solution`
    pub fn write_id(&self) -> String {
        format!("{}@{}", self.name, self.solution)
    }

    /// `name.solution`
    pub fn read_id(&self) -> String {
        format!("{}.{}", self.name, self.solution)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.raw {
            RawValue::Literal(v) => write!(f, "{} = {}", self.write_id(), v),
            RawValue::Formula(text) => {
                write!(f, "{} = {} → {}", self.write_id(), text, self.last_value)?;
                if let Some(err) = &self.error {
                    write!(f, " (error: {})", err)?;
                }
                Ok(())
            }
        }
    }
}
