//! Solution variables module.
//!
//! Named values grouped into solutions, with:
//! - Four statement shapes (assignment, formula, read, alias)
//! - Formulas referencing variables of any solution (`name.solution`)
//! - Per-solution aliases and registry-wide `#id` addressing
//! - Dependency tracking and circular dependency detection
//! - JSON save and restore

pub mod types;
pub mod error;
pub mod statement;
pub mod parser;
pub mod evaluator;
pub mod dependency;
pub mod solution;
pub mod registry;
pub mod persist;


pub use types::{RawValue, Value, Variable, VariableState};
pub use error::{ErrorKind, VariableError};
pub use statement::{classify, extract_references, is_valid_name, validate_name, AssignedValue, Statement};
pub use parser::{parse_expression, Expr};
pub use evaluator::{evaluate, evaluate_variable, EvalContext};
pub use dependency::DependencyTracker;
pub use solution::{ExecContext, Outcome, Solution};
pub use registry::{LegacyIds, Registry, Scope, VariableInfo};
pub use persist::{SolutionRecord, StoredValue, VariableRecord, WorkspaceRecord};
