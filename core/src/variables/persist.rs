//! Save and restore solutions as JSON.
//!
//! A solution is stored with its variables keyed by write-id, each carrying
//! either a literal `value` or a `formula`. Solutions it was integrated from
//! are nested under `parent_solutions`. Dependency edges are not stored; they
//! are rebuilt from the formulas on restore.

use super::error::VariableError;
use super::registry::Registry;
use super::solution::{Solution, ALIAS_BACKING_PREFIX};
use super::statement::validate_name;
use super::types::{RawValue, Value, Variable};
use crate::config::EngineConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};
use uuid::Uuid;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredValue {
    Value(Value),
    Formula(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub name: String,
    #[serde(default)]
    pub legacy_id: u32,
    #[serde(flatten)]
    pub stored: StoredValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionRecord {
    pub name: String,
    pub solution_id: Uuid,
    #[serde(default)]
    pub legacy_solution_number: u32,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableRecord>,
    #[serde(default)]
    pub parent_solutions: Vec<SolutionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub version: u32,
    pub solutions: Vec<SolutionRecord>,
}

impl WorkspaceRecord {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl VariableRecord {
    fn from_variable(var: &Variable, aliases: Vec<String>) -> Self {
        let (stored, last_value) = match &var.raw {
            RawValue::Literal(value) => (StoredValue::Value(value.clone()), None),
            RawValue::Formula(text) => (StoredValue::Formula(text.clone()), Some(var.last_value)),
        };
        Self {
            name: var.name.clone(),
            legacy_id: var.legacy_id,
            stored,
            aliases,
            last_value,
        }
    }
}

impl Solution {
    /// Record of this solution alone; `parent_solutions` is left empty.
    pub fn to_record(&self) -> SolutionRecord {
        let variables = self
            .variables()
            .into_iter()
            .map(|var| {
                let aliases = self.aliases_of(&var.name).into_iter().map(String::from).collect();
                (var.write_id(), VariableRecord::from_variable(var, aliases))
            })
            .collect();

        SolutionRecord {
            name: self.name.clone(),
            solution_id: self.id,
            legacy_solution_number: self.number,
            variables,
            parent_solutions: Vec::new(),
        }
    }
}

impl Registry {
    /// Record of `name` with its parents nested.
    pub fn solution_record(&self, name: &str) -> Option<SolutionRecord> {
        self.record_with_parents(name, &mut HashSet::new())
    }

    fn record_with_parents(&self, name: &str, visiting: &mut HashSet<String>) -> Option<SolutionRecord> {
        let solution = self.solutions.get(name)?;
        if !visiting.insert(name.to_string()) {
            return None;
        }
        let mut record = solution.to_record();
        record.parent_solutions = solution
            .parents()
            .iter()
            .filter_map(|parent| self.record_with_parents(parent, visiting))
            .collect();
        visiting.remove(name);
        Some(record)
    }

    /// Every solution, in solution number order.
    pub fn to_record(&self) -> WorkspaceRecord {
        let mut solutions: Vec<&Solution> = self.solutions.values().collect();
        solutions.sort_by_key(|s| s.number);
        WorkspaceRecord {
            version: FORMAT_VERSION,
            solutions: solutions
                .into_iter()
                .filter_map(|s| self.solution_record(&s.name))
                .collect(),
        }
    }

    pub fn from_record(record: &WorkspaceRecord, config: EngineConfig) -> Result<Self, VariableError> {
        if record.version > FORMAT_VERSION {
            return Err(VariableError::UnsupportedVersion(record.version));
        }
        let mut registry = Self::with_config(config);
        let mut restored = Vec::new();
        for solution in &record.solutions {
            registry.restore_tree(solution, &mut restored)?;
        }
        registry.link_restored(&restored)?;
        info!(
            "Loaded workspace with {} solutions and {} formulas",
            registry.len(),
            registry.tracker.len()
        );
        Ok(registry)
    }

    /// Register a saved solution (and any parents not yet present).
    /// Returns the names of the solutions that were added.
    ///
    /// The restore is staged on a copy of the registry, so a failure leaves
    /// this one untouched.
    pub fn restore(&mut self, record: &SolutionRecord) -> Result<Vec<String>, VariableError> {
        let mut staged = self.clone();
        let mut restored = Vec::new();
        staged.restore_tree(record, &mut restored)?;
        staged.link_restored(&restored)?;
        *self = staged;
        Ok(restored)
    }

    fn restore_tree(&mut self, record: &SolutionRecord, restored: &mut Vec<String>) -> Result<(), VariableError> {
        if let Some(existing) = self.solutions.get(&record.name) {
            // Already restored as someone's parent.
            if existing.id == record.solution_id {
                return Ok(());
            }
            return Err(VariableError::NameCollision(format!(
                "solution '{}' already exists",
                record.name
            )));
        }
        validate_name(&record.name)?;

        for parent in &record.parent_solutions {
            self.restore_tree(parent, restored)?;
        }

        let wanted = record.legacy_solution_number;
        let number = if wanted > 0 && !self.numbers.contains_key(&wanted) {
            wanted
        } else {
            let number = self.allocate_number();
            if wanted > 0 {
                warn!(
                    "Solution number {} of '{}' is taken, using {}",
                    wanted, record.name, number
                );
            }
            number
        };

        let mut solution = Solution::with_id(&record.name, record.solution_id, number);
        for parent in &record.parent_solutions {
            solution.add_parent(&parent.name);
        }

        let mut variables: Vec<&VariableRecord> = record.variables.values().collect();
        variables.sort_by_key(|v| v.legacy_id);
        let mut taken = HashSet::new();

        for saved in variables {
            if !saved.name.starts_with(ALIAS_BACKING_PREFIX) {
                validate_name(&saved.name)?;
            }
            if solution.variable(&saved.name).is_some() {
                return Err(VariableError::NameCollision(format!(
                    "'{}' appears twice in solution '{}'",
                    saved.name, record.name
                )));
            }

            let legacy_id = if saved.legacy_id > 0
                && !taken.contains(&saved.legacy_id)
                && !self.legacy_id_in_use(saved.legacy_id)
            {
                self.legacy_ids.reserve(saved.legacy_id);
                saved.legacy_id
            } else {
                let id = self.legacy_ids.allocate()?;
                if saved.legacy_id > 0 {
                    warn!(
                        "Legacy id #{} of {}@{} is taken, using #{}",
                        saved.legacy_id, saved.name, record.name, id
                    );
                }
                id
            };
            taken.insert(legacy_id);

            let mut var = Variable::new(&saved.name, &record.name, legacy_id, Value::Number(0.0));
            match &saved.stored {
                StoredValue::Value(value) => var.set_literal(value.clone()),
                StoredValue::Formula(text) => {
                    var.raw = RawValue::Formula(text.clone());
                    var.last_value = saved.last_value.unwrap_or(0.0);
                }
            }
            solution.insert_variable(var);
        }

        for saved in record.variables.values() {
            for alias in &saved.aliases {
                solution.set_alias(alias, &saved.name)?;
            }
        }

        info!("Restored solution '{}' (#{})", record.name, number);
        self.insert_solution(solution);
        restored.push(record.name.clone());
        Ok(())
    }

    fn legacy_id_in_use(&self, id: u32) -> bool {
        self.solutions.values().any(|s| s.by_legacy_id(id).is_some())
    }

    /// Rebuild dependency edges for freshly restored solutions, then
    /// re-evaluate their formulas. Saved formulas that form a cycle are
    /// rejected.
    fn link_restored(&mut self, names: &[String]) -> Result<(), VariableError> {
        for name in names {
            let edges = self.with_detached(name, |s, ctx| Ok(s.formula_dependencies(&ctx.scope)))?;
            for (read_id, dependencies) in edges {
                if let Some(path) = self.tracker.cycle_path(&read_id, &dependencies) {
                    warn!("Restored formula {} is part of a cycle: {}", read_id, path.join(" → "));
                    return Err(VariableError::CircularDependency(path));
                }
                self.tracker.record(&read_id, dependencies);
            }
        }
        for name in names {
            let failures = self.with_detached(name, |s, ctx| Ok(s.refresh_all(&ctx.scope)))?;
            for (read_id, err) in failures {
                warn!("Restored formula {} failed to evaluate: {}", read_id, err);
            }
        }
        Ok(())
    }
}
