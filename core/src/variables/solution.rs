//! Solutions: named groups of variables, and the statement write path.

use super::dependency::DependencyTracker;
use super::error::VariableError;
use super::evaluator::{evaluate_as, evaluate_variable, translate_legacy};
use super::registry::{LegacyIds, Scope};
use super::statement::{
    classify, extract_references, validate_name, AssignedValue, Statement, LEGACY_RE,
};
use super::types::{RawValue, Value, Variable};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

static LEGACY_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#(\d+)(?:\.([A-Za-z0-9_]+))?$").expect("valid legacy address pattern")
});

/// Prefix for variables created to back an alias assigned before any
/// variable of that name existed.
pub const ALIAS_BACKING_PREFIX: &str = "_alias_";

/// Registry state a statement may touch besides its own solution.
pub struct ExecContext<'a> {
    /// Every other solution
    pub scope: Scope<'a>,
    pub tracker: &'a mut DependencyTracker,
    pub legacy_ids: &'a mut LegacyIds,
}

/// What a successfully executed statement did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A literal was stored
    Assigned { read_id: String, value: Value },
    /// A formula was stored and evaluated
    Computed { read_id: String, value: f64 },
    /// A value was copied into `target`
    Read { target: String, value: Value },
}

impl Outcome {
    pub fn read_id(&self) -> &str {
        match self {
            Self::Assigned { read_id, .. } | Self::Computed { read_id, .. } => read_id,
            Self::Read { target, .. } => target,
        }
    }

    pub fn value(&self) -> Value {
        match self {
            Self::Assigned { value, .. } | Self::Read { value, .. } => value.clone(),
            Self::Computed { value, .. } => Value::Number(*value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Solution {
    pub name: String,
    /// Stable identity, kept across save and load
    pub id: Uuid,
    /// Legacy solution number, unique in the registry
    pub number: u32,
    variables: HashMap<String, Variable>,
    /// alias → variable name
    aliases: HashMap<String, String>,
    parents: Vec<String>,
}

impl Solution {
    pub fn new(name: &str, number: u32) -> Self {
        Self::with_id(name, Uuid::new_v4(), number)
    }

    pub fn with_id(name: &str, id: Uuid, number: u32) -> Self {
        Self {
            name: name.to_string(),
            id,
            number,
            variables: HashMap::new(),
            aliases: HashMap::new(),
            parents: Vec::new(),
        }
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    /// Variable by name, falling back to aliases.
    pub fn lookup(&self, name: &str) -> Option<&Variable> {
        self.variables
            .get(name)
            .or_else(|| self.alias_target(name).and_then(|v| self.variables.get(v)))
    }

    pub fn by_legacy_id(&self, id: u32) -> Option<&Variable> {
        self.variables.values().find(|v| v.legacy_id == id)
    }

    pub fn alias_target(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }

    /// Aliases pointing at `name`, sorted.
    pub fn aliases_of(&self, name: &str) -> Vec<&str> {
        let mut aliases: Vec<&str> = self
            .aliases
            .iter()
            .filter(|(_, target)| *target == name)
            .map(|(alias, _)| alias.as_str())
            .collect();
        aliases.sort_unstable();
        aliases
    }

    pub fn aliases(&self) -> &HashMap<String, String> {
        &self.aliases
    }

    /// Variables in legacy id order.
    pub fn variables(&self) -> Vec<&Variable> {
        let mut vars: Vec<&Variable> = self.variables.values().collect();
        vars.sort_by_key(|v| v.legacy_id);
        vars
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    pub fn add_parent(&mut self, name: &str) {
        if !self.parents.iter().any(|p| p == name) {
            self.parents.push(name.to_string());
        }
    }

    fn name_taken(&self, name: &str) -> bool {
        self.variables.contains_key(name) || self.aliases.contains_key(name)
    }

    /// Create a literal variable with a freshly allocated legacy id.
    pub fn create_variable(
        &mut self,
        name: &str,
        value: Value,
        ids: &mut LegacyIds,
    ) -> Result<&mut Variable, VariableError> {
        validate_name(name)?;
        if self.name_taken(name) {
            return Err(VariableError::NameCollision(format!(
                "'{}' already exists in solution '{}'",
                name, self.name
            )));
        }
        let legacy_id = ids.allocate()?;
        Ok(self.insert_variable(Variable::new(name, &self.name, legacy_id, value)))
    }

    /// Variable `name`, created empty if missing. No name checks.
    fn ensure_variable(&mut self, name: &str, ids: &mut LegacyIds) -> Result<&mut Variable, VariableError> {
        match self.variables.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let legacy_id = ids.allocate()?;
                Ok(entry.insert(Variable::new(name, &self.name, legacy_id, Value::Number(0.0))))
            }
        }
    }

    /// Insert without name checks; callers have validated already.
    pub(crate) fn insert_variable(&mut self, variable: Variable) -> &mut Variable {
        let name = variable.name.clone();
        self.variables.entry(name).or_insert(variable)
    }

    pub fn set_alias(&mut self, alias: &str, variable: &str) -> Result<(), VariableError> {
        validate_name(alias)?;
        if !self.variables.contains_key(variable) {
            return Err(VariableError::UnknownVariable {
                variable: variable.to_string(),
                solution: self.name.clone(),
            });
        }
        if self.name_taken(alias) {
            return Err(VariableError::NameCollision(format!(
                "alias '{}' already exists in solution '{}'",
                alias, self.name
            )));
        }
        self.aliases.insert(alias.to_string(), variable.to_string());
        Ok(())
    }

    /// Find a variable by bare name, alias, `#id`, `#id.name`,
    /// `name@solution` or `name.solution` (this solution only).
    pub fn resolve(&self, reference: &str) -> Option<&Variable> {
        let reference = reference.trim();

        if let Some(caps) = LEGACY_ADDRESS_RE.captures(reference) {
            let var = self.by_legacy_id(caps[1].parse().ok()?)?;
            return match caps.get(2) {
                None => Some(var),
                Some(name) if name.as_str() == var.name => Some(var),
                Some(name) if self.alias_target(name.as_str()) == Some(var.name.as_str()) => {
                    Some(var)
                }
                Some(_) => None,
            };
        }

        if let Some((name, solution)) = reference
            .split_once('@')
            .or_else(|| reference.split_once('.'))
        {
            return if solution == self.name {
                self.lookup(name)
            } else {
                None
            };
        }

        self.lookup(reference)
    }

    /// Classify and apply one statement with this solution as current.
    pub fn execute(&mut self, text: &str, ctx: &mut ExecContext<'_>) -> Result<Outcome, VariableError> {
        let statement = classify(text)?;
        debug!("Executing {:?} in solution '{}'", statement, self.name);

        match statement {
            Statement::Assignment {
                variable,
                solution,
                value,
            } => {
                self.check_target(&variable, &solution)?;
                let target = self.canonical_name(&variable);
                self.assign_literal(&target, value, ctx)
            }
            Statement::Formula {
                variable,
                solution,
                formula,
                ..
            } => {
                self.check_target(&variable, &solution)?;
                let target = self.canonical_name(&variable);
                self.assign_formula(&target, &formula, None, ctx)
            }
            Statement::Read {
                target,
                variable,
                solution,
            } => self.read_into(&target, &variable, &solution, ctx),
            Statement::Alias { alias, value } => self.assign_alias(&alias, value, ctx),
        }
    }

    fn check_target(&self, variable: &str, solution: &str) -> Result<(), VariableError> {
        if solution == self.name {
            Ok(())
        } else {
            Err(VariableError::ForeignTarget {
                variable: variable.to_string(),
                target: solution.to_string(),
                current: self.name.clone(),
            })
        }
    }

    /// Variable name behind `name`, which may be an alias.
    fn canonical_name(&self, name: &str) -> String {
        self.lookup(name)
            .map(|v| v.name.clone())
            .unwrap_or_else(|| name.to_string())
    }

    fn assign_literal(
        &mut self,
        name: &str,
        value: Value,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Outcome, VariableError> {
        let var = self.ensure_variable(name, ctx.legacy_ids)?;
        var.set_literal(value.clone());
        let read_id = var.read_id();
        ctx.tracker.remove(&read_id);
        Ok(Outcome::Assigned { read_id, value })
    }

    /// Evaluate-then-commit. A cycle is rejected before anything changes;
    /// an evaluation failure is committed (formula, edges, error) and returned.
    ///
    /// `alias` is a new alias about to point at `name`. Formulas that already
    /// reference it will depend on `name` too, so they take part in the cycle check.
    fn assign_formula(
        &mut self,
        name: &str,
        formula: &str,
        alias: Option<&str>,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Outcome, VariableError> {
        let read_id = format!("{}.{}", name, self.name);

        let (dependencies, result) = {
            let scope = ctx.scope.with_current(self);
            let dependencies = self.dependencies_of(formula, &scope);
            let cycle = ctx.tracker.cycle_path(&read_id, &dependencies).or_else(|| {
                alias.and_then(|alias| {
                    let alias_id = format!("{}.{}", alias, self.name);
                    ctx.tracker.merge_cycle(&alias_id, &read_id, &dependencies)
                })
            });
            if let Some(path) = cycle {
                warn!("Rejected formula for {}: cycle {}", read_id, path.join(" → "));
                return Err(VariableError::CircularDependency(path));
            }
            (dependencies, evaluate_as(&read_id, formula, &scope))
        };

        let var = self.ensure_variable(name, ctx.legacy_ids)?;
        ctx.tracker.record(&read_id, dependencies);
        let value = var.store_formula(formula, result)?;
        Ok(Outcome::Computed { read_id, value })
    }

    /// Canonical read-ids a formula written in this solution depends on.
    /// Aliases of this solution are mapped to the variables behind them.
    pub(crate) fn dependencies_of(&self, formula: &str, scope: &Scope<'_>) -> BTreeSet<String> {
        let text = if scope.legacy_syntax() && LEGACY_RE.is_match(formula) {
            translate_legacy(formula, scope)
        } else {
            formula.to_string()
        };
        extract_references(&text)
            .into_iter()
            .map(|reference| match reference.split_once('.') {
                Some((name, solution)) if solution == self.name => self
                    .lookup(name)
                    .map(Variable::read_id)
                    .unwrap_or(reference),
                _ => reference,
            })
            .collect()
    }

    fn read_into(
        &mut self,
        target: &str,
        variable: &str,
        solution: &str,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Outcome, VariableError> {
        let value = {
            let scope = ctx.scope.with_current(self);
            let source = scope
                .find(solution)
                .ok_or_else(|| VariableError::UnknownSolution(solution.to_string()))?;
            let var = if solution == self.name {
                source.lookup(variable)
            } else {
                source.variable(variable)
            }
            .ok_or_else(|| VariableError::UnknownVariable {
                variable: variable.to_string(),
                solution: solution.to_string(),
            })?;
            match &var.raw {
                RawValue::Literal(value) => value.clone(),
                RawValue::Formula(_) => Value::Number(evaluate_variable(var, &scope)?),
            }
        };

        let name = self.canonical_name(target);
        let outcome = self.assign_literal(&name, value.clone(), ctx)?;
        Ok(Outcome::Read {
            target: outcome.read_id().to_string(),
            value,
        })
    }

    fn assign_alias(
        &mut self,
        alias: &str,
        value: AssignedValue,
        ctx: &mut ExecContext<'_>,
    ) -> Result<Outcome, VariableError> {
        let (target, is_new) = match self.lookup(alias) {
            Some(var) => (var.name.clone(), false),
            None => (format!("{}{}", ALIAS_BACKING_PREFIX, alias), true),
        };

        let new_alias = is_new.then_some(alias);
        let result = match value {
            AssignedValue::Literal(value) => self.assign_literal(&target, value, ctx),
            AssignedValue::Formula { text, .. } => {
                self.assign_formula(&target, &text, new_alias, ctx)
            }
        };

        // A failed evaluation still created the backing variable.
        if is_new && self.variables.contains_key(&target) {
            ctx.tracker.merge(
                &format!("{}.{}", alias, self.name),
                &format!("{}.{}", target, self.name),
            );
            self.aliases.insert(alias.to_string(), target);
        }
        result
    }

    /// Current value of `name`, re-evaluating its formula first.
    ///
    /// Evaluation failures are recorded on the variable; the last good value
    /// is returned.
    pub fn refresh(&mut self, name: &str, scope: &Scope<'_>) -> Result<Value, VariableError> {
        let result = {
            let scope = scope.with_current(self);
            let var = self.lookup(name).ok_or_else(|| VariableError::UnknownVariable {
                variable: name.to_string(),
                solution: self.name.clone(),
            })?;
            if !var.is_formula() {
                return Ok(var.value());
            }
            (var.name.clone(), evaluate_variable(var, &scope))
        };

        let (var_name, outcome) = result;
        let var = self
            .variables
            .get_mut(&var_name)
            .ok_or_else(|| VariableError::UnknownVariable {
                variable: var_name.clone(),
                solution: self.name.clone(),
            })?;
        // Failure is already captured on the variable.
        let _ = var.apply(outcome);
        Ok(var.value())
    }

    /// Re-evaluate every formula in legacy id order. Returns the failures.
    pub fn refresh_all(&mut self, scope: &Scope<'_>) -> Vec<(String, VariableError)> {
        let formulas: Vec<String> = self
            .variables()
            .into_iter()
            .filter(|v| v.is_formula())
            .map(|v| v.name.clone())
            .collect();

        let mut failures = Vec::new();
        for name in formulas {
            let result = {
                let scope = scope.with_current(self);
                self.variables
                    .get(&name)
                    .map(|var| evaluate_variable(var, &scope))
            };
            if let (Some(result), Some(var)) = (result, self.variables.get_mut(&name)) {
                if let Err(e) = var.apply(result) {
                    failures.push((var.read_id(), e));
                }
            }
        }
        failures
    }

    /// Dependency sets of every formula, computed against `scope`.
    pub(crate) fn formula_dependencies(&self, scope: &Scope<'_>) -> Vec<(String, BTreeSet<String>)> {
        let scope = scope.with_current(self);
        self.variables()
            .into_iter()
            .filter_map(|var| {
                var.formula()
                    .map(|f| (var.read_id(), self.dependencies_of(f, &scope)))
            })
            .collect()
    }
}

impl fmt::Display for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Solution '{}' (#{})", self.name, self.number)?;
        if !self.parents.is_empty() {
            writeln!(f, "Parents: {}", self.parents.join(", "))?;
        }
        writeln!(f, "Variables ({}):", self.variables.len())?;
        for var in self.variables() {
            write!(f, "  [#{}] {}", var.legacy_id, var)?;
            let aliases = self.aliases_of(&var.name);
            if !aliases.is_empty() {
                write!(f, "  (aliases: {})", aliases.join(", "))?;
            }
            writeln!(f)?;
        }
        if !self.aliases.is_empty() {
            let mut aliases: Vec<_> = self.aliases.iter().collect();
            aliases.sort();
            writeln!(f, "Aliases ({}):", aliases.len())?;
            for (alias, target) in aliases {
                writeln!(f, "  {} → {}", alias, target)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::error::ErrorKind;
    use crate::variables::Registry;

    fn panel() -> Registry {
        let mut registry = Registry::new();
        registry.create_solution("panel").unwrap();
        registry
    }

    #[test]
    fn test_create_variable_rejects_collisions() {
        let mut ids = LegacyIds::default();
        let mut solution = Solution::new("panel", 1);
        solution.create_variable("length", Value::Number(600.0), &mut ids).unwrap();
        solution.set_alias("L", "length").unwrap();

        let err = solution.create_variable("length", Value::Number(1.0), &mut ids).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NameCollision);
        let err = solution.create_variable("L", Value::Number(1.0), &mut ids).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NameCollision);
        let err = solution.set_alias("length", "length").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NameCollision);
        assert!(solution.set_alias("W", "width").is_err());
        assert!(solution.create_variable("a.b", Value::Number(1.0), &mut ids).is_err());
    }

    #[test]
    fn test_resolve_all_addresses() {
        let mut ids = LegacyIds::default();
        let mut solution = Solution::new("panel", 1);
        let id = solution
            .create_variable("length", Value::Number(600.0), &mut ids)
            .unwrap()
            .legacy_id;
        solution.set_alias("L", "length").unwrap();

        let by_id = format!("#{}", id);
        let by_id_name = format!("#{}.length", id);
        let by_id_alias = format!("#{}.L", id);
        for reference in [
            "length",
            "L",
            "length@panel",
            "length.panel",
            "L.panel",
            by_id.as_str(),
            by_id_name.as_str(),
            by_id_alias.as_str(),
        ] {
            assert_eq!(
                solution.resolve(reference).map(|v| v.name.as_str()),
                Some("length"),
                "{}",
                reference
            );
        }
        assert!(solution.resolve("length@edge").is_none());
        assert!(solution.resolve(&format!("#{}.width", id)).is_none());
        assert!(solution.resolve("#999").is_none());
    }

    #[test]
    fn test_alias_statement_creates_backing_variable() {
        let mut registry = panel();
        registry.execute_in("panel", "L=600").unwrap();

        let solution = registry.solution("panel").unwrap();
        assert_eq!(solution.alias_target("L"), Some("_alias_L"));
        assert_eq!(solution.lookup("L").unwrap().value(), Value::Number(600.0));
    }

    #[test]
    fn test_alias_statement_reassigns_existing() {
        let mut registry = panel();
        registry.execute("length@panel=600").unwrap();
        registry.set_alias("panel", "L", "length").unwrap();
        registry.execute_in("panel", "L=800").unwrap();

        assert_eq!(
            registry.cached_value("panel", "length"),
            Some(Value::Number(800.0))
        );
        assert_eq!(registry.solution("panel").unwrap().len(), 1);
    }

    #[test]
    fn test_write_through_alias_target() {
        let mut registry = panel();
        registry.execute("length@panel=600").unwrap();
        registry.set_alias("panel", "L", "length").unwrap();
        registry.execute("L@panel=700").unwrap();
        assert_eq!(
            registry.cached_value("panel", "length"),
            Some(Value::Number(700.0))
        );
    }

    #[test]
    fn test_foreign_target_rejected() {
        let mut registry = panel();
        registry.create_solution("edge").unwrap();
        let err = registry.execute_in("panel", "x@edge=1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reference);
        assert!(registry.solution("edge").unwrap().is_empty());
        assert!(registry.solution("panel").unwrap().is_empty());
    }

    #[test]
    fn test_read_statement_copies_value() {
        let mut registry = panel();
        registry.create_solution("box").unwrap();
        registry.execute("volume@box=42").unwrap();

        let outcome = registry.execute_in("panel", "a=volume.box").unwrap();
        assert_eq!(
            outcome,
            Outcome::Read {
                target: "a.panel".into(),
                value: Value::Number(42.0),
            }
        );
        registry.execute("volume@box=43").unwrap();
        assert_eq!(registry.cached_value("panel", "a"), Some(Value::Number(42.0)));
    }

    #[test]
    fn test_read_missing_source() {
        let mut registry = panel();
        let err = registry.execute_in("panel", "a=volume.box").unwrap_err();
        assert_eq!(err, VariableError::UnknownSolution("box".into()));
        assert!(registry.solution("panel").unwrap().is_empty());
    }

    #[test]
    fn test_formula_error_is_recorded() {
        let mut registry = panel();
        registry.execute("x@panel=5").unwrap();
        registry.execute("y@panel=x.panel*2").unwrap();

        let err = registry.execute("y@panel=x.panel/0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Evaluation);

        let y = registry.find_variable("y@panel").unwrap();
        assert_eq!(y.formula(), Some("x.panel/0"));
        assert_eq!(y.value(), Value::Number(10.0));
        assert!(y.error.is_some());
        assert!(registry.dependencies("y.panel").contains("x.panel"));
    }

    #[test]
    fn test_self_reference_rejected_without_mutation() {
        let mut registry = panel();
        registry.execute("x@panel=5").unwrap();
        let err = registry.execute("x@panel=x.panel+1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cycle);
        assert_eq!(registry.cached_value("panel", "x"), Some(Value::Number(5.0)));
        assert!(registry.dependencies("x.panel").is_empty());
    }

    #[test]
    fn test_alias_reference_records_canonical_edge() {
        let mut registry = panel();
        registry.execute("length@panel=600").unwrap();
        registry.set_alias("panel", "L", "length").unwrap();
        registry.execute("half@panel=L.panel/2").unwrap();

        assert_eq!(registry.cached_value("panel", "half"), Some(Value::Number(300.0)));
        assert!(registry.dependents("length.panel").contains("half.panel"));
    }

    #[test]
    fn test_literal_drops_edges() {
        let mut registry = panel();
        registry.execute("x@panel=5").unwrap();
        registry.execute("y@panel=x.panel").unwrap();
        registry.execute("y@panel=1").unwrap();
        assert!(registry.dependents("x.panel").is_empty());
    }

    #[test]
    fn test_display_lists_variables() {
        let mut registry = panel();
        registry.execute("length@panel=600").unwrap();
        registry.set_alias("panel", "L", "length").unwrap();
        let text = registry.solution("panel").unwrap().to_string();
        assert!(text.contains("Solution 'panel' (#1)"));
        assert!(text.contains("length@panel = 600"));
        assert!(text.contains("L → length"));
    }
}
