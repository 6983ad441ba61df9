//! Statement classification.
//!
//! One line of user text becomes one of four statement shapes:
//!
//! | Text                               | Statement  |
//! |------------------------------------|------------|
//! | `length@box=600`                   | Assignment |
//! | `width@result=width.panel-2*t.edge`| Formula    |
//! | `a=volume.box`                     | Read       |
//! | `L=600`                            | Alias      |
//!
//! Classification is purely syntactic: nothing here checks that the named
//! solutions or variables exist.

use super::error::VariableError;
use super::evaluator::fold_constant;
use super::parser::parse_expression;
use super::types::Value;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static WRITE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([^@=\s]+)\s*@\s*([^@=\s]+)\s*=\s*(.+?)\s*$").expect("valid write pattern")
});

static READ_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([^=\s]+)\s*=\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\s*$")
        .expect("valid read pattern")
});

static ALIAS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([^=]+?)\s*=\s*(.+?)\s*$").expect("valid alias pattern"));

pub(crate) static REFERENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\b")
        .expect("valid reference pattern")
});

pub(crate) static LEGACY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"#(\d+)\.([A-Za-z_][A-Za-z0-9_]*)").expect("valid legacy pattern")
});

/// Right-hand side of an alias statement.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignedValue {
    Literal(Value),
    Formula {
        text: String,
        references: BTreeSet<String>,
    },
}

/// A classified line of user input.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `variable@solution=literal`
    Assignment {
        variable: String,
        solution: String,
        value: Value,
    },
    /// `variable@solution=expr`, where `expr` references other variables
    Formula {
        variable: String,
        solution: String,
        formula: String,
        references: BTreeSet<String>,
    },
    /// `target=variable.solution`
    Read {
        target: String,
        variable: String,
        solution: String,
    },
    /// `name=literal-or-expr` in the context of a current solution
    Alias { alias: String, value: AssignedValue },
}

/// Classify one line of text.
pub fn classify(text: &str) -> Result<Statement, VariableError> {
    let text = text.trim();

    if text.contains('@') {
        let caps = WRITE_RE
            .captures(text)
            .ok_or_else(|| VariableError::InvalidStatement(text.to_string()))?;
        let variable = &caps[1];
        let solution = &caps[2];
        let rhs = &caps[3];
        validate_name(variable)?;
        validate_name(solution)?;

        return Ok(if contains_references(rhs) {
            Statement::Formula {
                variable: variable.to_string(),
                solution: solution.to_string(),
                formula: rhs.to_string(),
                references: extract_references(rhs),
            }
        } else {
            Statement::Assignment {
                variable: variable.to_string(),
                solution: solution.to_string(),
                value: parse_literal(rhs),
            }
        });
    }

    if let Some(caps) = READ_RE.captures(text) {
        let target = &caps[1];
        validate_name(target)?;
        return Ok(Statement::Read {
            target: target.to_string(),
            variable: caps[2].to_string(),
            solution: caps[3].to_string(),
        });
    }

    if let Some(caps) = ALIAS_RE.captures(text) {
        let alias = &caps[1];
        let rhs = &caps[2];
        validate_name(alias)?;
        let value = if contains_references(rhs) {
            AssignedValue::Formula {
                text: rhs.to_string(),
                references: extract_references(rhs),
            }
        } else {
            AssignedValue::Literal(parse_literal(rhs))
        };
        return Ok(Statement::Alias {
            alias: alias.to_string(),
            value,
        });
    }

    Err(VariableError::InvalidStatement(text.to_string()))
}

/// All `variable.solution` references in `text`.
pub fn extract_references(text: &str) -> BTreeSet<String> {
    REFERENCE_RE
        .captures_iter(text)
        .map(|caps| format!("{}.{}", &caps[1], &caps[2]))
        .collect()
}

/// All `#id.name` tokens in `text`, as `(id, name)`.
pub fn legacy_tokens(text: &str) -> Vec<(u32, String)> {
    LEGACY_RE
        .captures_iter(text)
        .filter_map(|caps| Some((caps[1].parse().ok()?, caps[2].to_string())))
        .collect()
}

/// Whether `text` mentions any other variable, in dotted or legacy form.
pub fn contains_references(text: &str) -> bool {
    REFERENCE_RE.is_match(text) || LEGACY_RE.is_match(text)
}

/// Interpret reference-free text as a value.
///
/// Float literals become numbers; text that is a closed-grammar arithmetic
/// expression (`600*2`) folds to its result; anything else stays text.
pub fn parse_literal(text: &str) -> Value {
    let text = text.trim();
    if let Ok(n) = text.parse::<f64>() {
        if n.is_finite() {
            return Value::Number(n);
        }
    }
    parse_expression(text)
        .and_then(|expr| fold_constant(&expr))
        .map(Value::Number)
        .unwrap_or_else(|_| Value::Text(text.to_string()))
}

/// Check `name` against the identifier grammar used for solutions,
/// variables and aliases.
pub fn validate_name(name: &str) -> Result<(), VariableError> {
    let Some(first) = name.chars().next() else {
        return Err(VariableError::invalid_name(name, "name cannot be empty"));
    };
    if name.contains('@') || name.contains('.') {
        return Err(VariableError::invalid_name(name, "name cannot contain @ or ."));
    }
    if !first.is_ascii_alphanumeric() {
        return Err(VariableError::invalid_name(
            name,
            "name must start with a letter or digit",
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(VariableError::invalid_name(
            name,
            "name can only contain letters, digits and underscores",
        ));
    }
    Ok(())
}

pub fn is_valid_name(name: &str) -> bool {
    validate_name(name).is_ok()
}
