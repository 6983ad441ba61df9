//! Solution registry: every solution known to a session, plus the state
//! shared between them (dependency graph, legacy id allocator, config).

use super::dependency::DependencyTracker;
use super::error::VariableError;
use super::solution::{ExecContext, Outcome, Solution};
use super::statement::{classify, validate_name, Statement};
use super::types::{Value, Variable};
use crate::config::EngineConfig;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::info;

/// Read-only view over a set of solutions, used while evaluating formulas.
///
/// `current` overlays a solution that has been taken out of the registry for
/// mutation, so it stays visible to lookups. `home` is the solution a formula
/// belongs to; it decides where aliases and legacy ids resolve first.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    current: Option<&'a Solution>,
    solutions: &'a HashMap<String, Solution>,
    home: Option<&'a str>,
    max_depth: usize,
    legacy_syntax: bool,
}

impl<'a> Scope<'a> {
    pub fn new(solutions: &'a HashMap<String, Solution>, config: &EngineConfig) -> Self {
        Self {
            current: None,
            solutions,
            home: None,
            max_depth: config.max_depth,
            legacy_syntax: config.legacy_syntax,
        }
    }

    /// Same scope with `current` visible and used as home.
    pub fn with_current<'b>(&self, current: &'b Solution) -> Scope<'b>
    where
        'a: 'b,
    {
        Scope {
            current: Some(current),
            solutions: self.solutions,
            home: Some(current.name.as_str()),
            max_depth: self.max_depth,
            legacy_syntax: self.legacy_syntax,
        }
    }

    /// Same scope evaluating on behalf of solution `home`.
    pub fn for_solution<'b>(&self, home: &'b str) -> Scope<'b>
    where
        'a: 'b,
    {
        Scope {
            current: self.current,
            solutions: self.solutions,
            home: Some(home),
            max_depth: self.max_depth,
            legacy_syntax: self.legacy_syntax,
        }
    }

    pub fn find(&self, name: &str) -> Option<&'a Solution> {
        match self.current {
            Some(current) if current.name == name => Some(current),
            _ => self.solutions.get(name),
        }
    }

    pub fn home(&self) -> Option<&'a str> {
        self.home
    }

    /// Every visible solution, the overlay first.
    pub fn solutions(&self) -> impl Iterator<Item = &'a Solution> + 'a {
        let current = self.current;
        let map = self.solutions;
        current.into_iter().chain(
            map.values()
                .filter(move |s| current.map_or(true, |c| c.name != s.name)),
        )
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn legacy_syntax(&self) -> bool {
        self.legacy_syntax
    }

    /// Whether `name` is an alias of `var` in the variable's own solution.
    pub fn is_alias_of(&self, var: &Variable, name: &str) -> bool {
        self.find(&var.solution)
            .and_then(|s| s.alias_target(name))
            .is_some_and(|target| target == var.name)
    }
}

/// Registry-wide allocator for `#id` numbers.
#[derive(Debug, Clone, Default)]
pub struct LegacyIds {
    last: u32,
}

impl LegacyIds {
    pub fn allocate(&mut self) -> Result<u32, VariableError> {
        self.last = self
            .last
            .checked_add(1)
            .ok_or(VariableError::IdsExhausted(self.last))?;
        Ok(self.last)
    }

    /// Mark `id` as taken so it is never handed out again.
    pub fn reserve(&mut self, id: u32) {
        self.last = self.last.max(id);
    }
}

/// One row of the introspection listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableInfo {
    pub name: String,
    pub solution: String,
    pub legacy_id: u32,
    pub legacy_reference: String,
    pub write_id: String,
    pub read_id: String,
    pub aliases: Vec<String>,
    pub is_formula: bool,
    pub formula: Option<String>,
    pub value: Value,
    pub error: Option<String>,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Registry {
    pub(crate) solutions: HashMap<String, Solution>,
    pub(crate) numbers: HashMap<u32, String>,
    pub(crate) tracker: DependencyTracker,
    pub(crate) legacy_ids: LegacyIds,
    pub(crate) next_number: u32,
    config: EngineConfig,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            solutions: HashMap::new(),
            numbers: HashMap::new(),
            tracker: DependencyTracker::new(),
            legacy_ids: LegacyIds::default(),
            next_number: 1,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Forget every solution, edge and id. Configuration is kept.
    pub fn reset(&mut self) {
        info!("Resetting registry ({} solutions)", self.solutions.len());
        *self = Self::with_config(self.config.clone());
    }

    pub fn create_solution(&mut self, name: &str) -> Result<&mut Solution, VariableError> {
        validate_name(name)?;
        if self.solutions.contains_key(name) {
            return Err(VariableError::NameCollision(format!(
                "solution '{}' already exists",
                name
            )));
        }
        let number = self.allocate_number();
        self.insert_solution(Solution::new(name, number));
        info!("Created solution '{}' (#{})", name, number);
        self.solution_mut(name)
    }

    /// Create a solution integrated from existing ones.
    pub fn create_derived_solution(
        &mut self,
        name: &str,
        parents: &[&str],
    ) -> Result<&mut Solution, VariableError> {
        if let Some(missing) = parents.iter().find(|p| !self.solutions.contains_key(**p)) {
            return Err(VariableError::UnknownSolution(missing.to_string()));
        }
        let solution = self.create_solution(name)?;
        for parent in parents {
            solution.add_parent(parent);
        }
        Ok(solution)
    }

    pub(crate) fn allocate_number(&mut self) -> u32 {
        while self.numbers.contains_key(&self.next_number) {
            self.next_number += 1;
        }
        let number = self.next_number;
        self.next_number += 1;
        number
    }

    pub(crate) fn insert_solution(&mut self, solution: Solution) {
        self.numbers.insert(solution.number, solution.name.clone());
        self.solutions.insert(solution.name.clone(), solution);
    }

    pub fn solution(&self, name: &str) -> Option<&Solution> {
        self.solutions.get(name)
    }

    pub fn solution_mut(&mut self, name: &str) -> Result<&mut Solution, VariableError> {
        self.solutions
            .get_mut(name)
            .ok_or_else(|| VariableError::UnknownSolution(name.to_string()))
    }

    pub fn solution_by_number(&self, number: u32) -> Option<&Solution> {
        self.numbers.get(&number).and_then(|name| self.solutions.get(name))
    }

    pub fn solutions(&self) -> impl Iterator<Item = &Solution> {
        self.solutions.values()
    }

    /// Solution names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.solutions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.solutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solutions.is_empty()
    }

    pub fn scope(&self) -> Scope<'_> {
        Scope::new(&self.solutions, &self.config)
    }

    pub fn tracker(&self) -> &DependencyTracker {
        &self.tracker
    }

    /// Run `f` on solution `name` while it is detached from the map, with
    /// every other solution visible through the context.
    pub(crate) fn with_detached<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Solution, &mut ExecContext<'_>) -> Result<R, VariableError>,
    ) -> Result<R, VariableError> {
        let mut solution = self
            .solutions
            .remove(name)
            .ok_or_else(|| VariableError::UnknownSolution(name.to_string()))?;

        let result = {
            let mut ctx = ExecContext {
                scope: Scope::new(&self.solutions, &self.config),
                tracker: &mut self.tracker,
                legacy_ids: &mut self.legacy_ids,
            };
            f(&mut solution, &mut ctx)
        };

        self.solutions.insert(name.to_string(), solution);
        result
    }

    /// Execute a statement that names its own target (`name@solution=...`).
    pub fn execute(&mut self, text: &str) -> Result<Outcome, VariableError> {
        let solution = match classify(text)? {
            Statement::Assignment { solution, .. } | Statement::Formula { solution, .. } => {
                solution
            }
            Statement::Read { .. } | Statement::Alias { .. } => {
                return Err(VariableError::InvalidStatement(format!(
                    "'{}' needs a current solution",
                    text.trim()
                )))
            }
        };
        self.execute_in(&solution, text)
    }

    /// Execute a statement with `solution` as the current solution.
    pub fn execute_in(&mut self, solution: &str, text: &str) -> Result<Outcome, VariableError> {
        self.with_detached(solution, |s, ctx| s.execute(text, ctx))
    }

    /// Create a literal variable and return its read-id.
    pub fn create_variable(
        &mut self,
        solution: &str,
        name: &str,
        value: Value,
    ) -> Result<String, VariableError> {
        let ids = &mut self.legacy_ids;
        let target = self
            .solutions
            .get_mut(solution)
            .ok_or_else(|| VariableError::UnknownSolution(solution.to_string()))?;
        target.create_variable(name, value, ids).map(|v| v.read_id())
    }

    /// Point `alias` at `variable` in `solution`. Formulas of that solution
    /// that already referenced the alias now depend on `variable`.
    pub fn set_alias(&mut self, solution: &str, alias: &str, variable: &str) -> Result<(), VariableError> {
        let alias_id = format!("{}.{}", alias, solution);
        let target_id = format!("{}.{}", variable, solution);
        if let Some(path) =
            self.tracker
                .merge_cycle(&alias_id, &target_id, self.tracker.dependencies(&target_id))
        {
            return Err(VariableError::CircularDependency(path));
        }
        self.solution_mut(solution)?.set_alias(alias, variable)?;
        self.tracker.merge(&alias_id, &target_id);
        Ok(())
    }

    /// Current value of `name` (variable or alias) in `solution`, re-evaluating
    /// a formula first. Evaluation failures are recorded on the variable and
    /// the last good value is returned.
    pub fn value(&mut self, solution: &str, name: &str) -> Result<Value, VariableError> {
        self.with_detached(solution, |s, ctx| s.refresh(name, &ctx.scope))
    }

    /// Value as of the last evaluation, without recomputing anything.
    pub fn cached_value(&self, solution: &str, name: &str) -> Option<Value> {
        self.solutions.get(solution)?.lookup(name).map(Variable::value)
    }

    /// Re-evaluate every formula. Returns the failures by read-id.
    pub fn refresh_all(&mut self) -> Vec<(String, VariableError)> {
        let names: Vec<String> = self.solutions.keys().cloned().collect();
        let mut failures = Vec::new();
        for name in names {
            if let Ok(mut errors) = self.with_detached(&name, |s, ctx| Ok(s.refresh_all(&ctx.scope))) {
                failures.append(&mut errors);
            }
        }
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        failures
    }

    /// Re-evaluate everything downstream of `read_id`, in dependency order.
    /// Returns the read-ids that were refreshed.
    pub fn refresh_impacted(&mut self, read_id: &str) -> Vec<String> {
        let impacted = self.tracker.impacted(read_id);
        for id in &impacted {
            if let Some((name, solution)) = id.split_once('.') {
                // Failures stay recorded on the variable.
                let _ = self.value(solution, name);
            }
        }
        impacted
    }

    /// Look a variable up by `#id`, `#id.name`, `name@solution` or
    /// `name.solution`.
    pub fn find_variable(&self, reference: &str) -> Option<&Variable> {
        let reference = reference.trim();
        if reference.starts_with('#') {
            return self.solutions.values().find_map(|s| s.resolve(reference));
        }
        let (name, solution) = reference
            .split_once('@')
            .or_else(|| reference.split_once('.'))?;
        self.solutions.get(solution)?.variable(name)
    }

    pub fn dependencies(&self, read_id: &str) -> &BTreeSet<String> {
        self.tracker.dependencies(read_id)
    }

    pub fn dependents(&self, read_id: &str) -> &BTreeSet<String> {
        self.tracker.dependents(read_id)
    }

    pub fn impacted(&self, read_id: &str) -> Vec<String> {
        self.tracker.impacted(read_id)
    }

    /// Every variable with its addresses, value and edges, ordered by
    /// solution name and then legacy id.
    pub fn variables_info(&self) -> Vec<VariableInfo> {
        let mut infos = Vec::new();
        for name in self.names() {
            let Some(solution) = self.solutions.get(name) else {
                continue;
            };
            for var in solution.variables() {
                let read_id = var.read_id();
                infos.push(VariableInfo {
                    name: var.name.clone(),
                    solution: var.solution.clone(),
                    legacy_id: var.legacy_id,
                    legacy_reference: var.legacy_reference(),
                    write_id: var.write_id(),
                    aliases: solution.aliases_of(&var.name).into_iter().map(String::from).collect(),
                    is_formula: var.is_formula(),
                    formula: var.formula().map(String::from),
                    value: var.value(),
                    error: var.error.clone(),
                    dependencies: self.tracker.dependencies(&read_id).iter().cloned().collect(),
                    dependents: self.tracker.dependents(&read_id).iter().cloned().collect(),
                    read_id,
                });
            }
        }
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::error::ErrorKind;

    #[test]
    fn test_create_solution() {
        let mut registry = Registry::new();
        let panel = registry.create_solution("panel").unwrap();
        assert_eq!(panel.number, 1);
        registry.create_solution("edge").unwrap();

        assert_eq!(registry.names(), vec!["edge", "panel"]);
        assert_eq!(registry.solution_by_number(2).unwrap().name, "edge");
    }

    #[test]
    fn test_duplicate_solution_rejected() {
        let mut registry = Registry::new();
        registry.create_solution("panel").unwrap();
        let err = registry.create_solution("panel").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NameCollision);
        assert!(registry.create_solution("bad.name").is_err());
    }

    #[test]
    fn test_derived_solution_needs_parents() {
        let mut registry = Registry::new();
        registry.create_solution("panel").unwrap();
        assert!(registry.create_derived_solution("result", &["panel", "edge"]).is_err());
        assert!(registry.solution("result").is_none());

        registry.create_solution("edge").unwrap();
        let result = registry.create_derived_solution("result", &["panel", "edge"]).unwrap();
        assert_eq!(result.parents(), ["panel".to_string(), "edge".to_string()]);
    }

    #[test]
    fn test_execute_routes_to_named_solution() {
        let mut registry = Registry::new();
        registry.create_solution("panel").unwrap();
        registry.execute("length@panel=600").unwrap();
        assert_eq!(
            registry.cached_value("panel", "length"),
            Some(Value::Number(600.0))
        );

        let err = registry.execute("length@nowhere=1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reference);
        assert!(registry.execute("L=600").is_err());
    }

    #[test]
    fn test_legacy_ids_are_global() {
        let mut registry = Registry::new();
        registry.create_solution("a").unwrap();
        registry.create_solution("b").unwrap();
        registry.execute("x@a=1").unwrap();
        registry.execute("x@b=2").unwrap();

        let a = registry.find_variable("x@a").unwrap().legacy_id;
        let b = registry.find_variable("x.b").unwrap().legacy_id;
        assert_ne!(a, b);
        assert_eq!(registry.find_variable(&format!("#{}", b)).unwrap().solution, "b");
    }

    #[test]
    fn test_legacy_ids_run_out() {
        let mut ids = LegacyIds::default();
        ids.reserve(u32::MAX - 1);
        assert_eq!(ids.allocate(), Ok(u32::MAX));
        assert_eq!(ids.allocate(), Err(VariableError::IdsExhausted(u32::MAX)));
    }

    #[test]
    fn test_scope_overlay() {
        let mut registry = Registry::new();
        registry.create_solution("a").unwrap();
        let detached = Solution::new("b", 9);
        let scope = registry.scope();
        let overlay = scope.with_current(&detached);

        assert!(scope.find("b").is_none());
        assert_eq!(overlay.find("b").unwrap().number, 9);
        assert_eq!(overlay.home(), Some("b"));
        assert_eq!(overlay.solutions().count(), 2);
    }

    #[test]
    fn test_reset() {
        let mut registry = Registry::with_config(EngineConfig {
            max_depth: 8,
            ..EngineConfig::default()
        });
        registry.create_solution("a").unwrap();
        registry.execute("x@a=1").unwrap();
        registry.reset();

        assert!(registry.is_empty());
        assert_eq!(registry.config().max_depth, 8);
        assert_eq!(registry.create_solution("a").unwrap().number, 1);
        registry.execute("x@a=1").unwrap();
        assert_eq!(registry.find_variable("x@a").unwrap().legacy_id, 1);
    }

    #[test]
    fn test_variables_info() {
        let mut registry = Registry::new();
        registry.create_solution("panel").unwrap();
        registry.execute("length@panel=600").unwrap();
        registry.execute("double@panel=length.panel*2").unwrap();
        registry.set_alias("panel", "L", "length").unwrap();

        let infos = registry.variables_info();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, "length");
        assert_eq!(infos[0].aliases, vec!["L"]);
        assert_eq!(infos[0].dependents, vec!["double.panel"]);
        assert_eq!(infos[1].value, Value::Number(1200.0));
        assert_eq!(infos[1].dependencies, vec!["length.panel"]);
    }
}
