//! Dependency graph between formula variables.
//!
//! Nodes are read-ids (`name.solution`). An edge `dependent → dependency`
//! means the dependent's formula references the dependency. Edges are kept in
//! both directions so "what does X use" and "who uses Y" are both map lookups.

use std::collections::{BTreeSet, HashMap, HashSet};

static NO_EDGES: BTreeSet<String> = BTreeSet::new();

#[derive(Debug, Clone, Default)]
pub struct DependencyTracker {
    forward: HashMap<String, BTreeSet<String>>,
    reverse: HashMap<String, BTreeSet<String>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the dependency set of `dependent`.
    pub fn record(&mut self, dependent: &str, dependencies: BTreeSet<String>) {
        if let Some(old) = self.forward.remove(dependent) {
            for dep in old {
                if let Some(users) = self.reverse.get_mut(&dep) {
                    users.remove(dependent);
                    if users.is_empty() {
                        self.reverse.remove(&dep);
                    }
                }
            }
        }

        if dependencies.is_empty() {
            return;
        }
        for dep in &dependencies {
            self.reverse
                .entry(dep.clone())
                .or_default()
                .insert(dependent.to_string());
        }
        self.forward.insert(dependent.to_string(), dependencies);
    }

    /// Drop every outgoing edge of `dependent` (it no longer has a formula).
    pub fn remove(&mut self, dependent: &str) {
        self.record(dependent, BTreeSet::new());
    }

    pub fn dependencies(&self, id: &str) -> &BTreeSet<String> {
        self.forward.get(id).unwrap_or(&NO_EDGES)
    }

    pub fn dependents(&self, id: &str) -> &BTreeSet<String> {
        self.reverse.get(id).unwrap_or(&NO_EDGES)
    }

    /// Would giving `start` the dependencies `proposed` close a cycle?
    pub fn has_cycle(&self, start: &str, proposed: &BTreeSet<String>) -> bool {
        self.cycle_path(start, proposed).is_some()
    }

    /// The cycle `start → … → start` that `proposed` would create, if any.
    pub fn cycle_path(&self, start: &str, proposed: &BTreeSet<String>) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = vec![start.to_string()];
        for dep in proposed {
            if self.visit(start, dep, &mut visited, &mut path) {
                return Some(path);
            }
        }
        None
    }

    fn visit(
        &self,
        start: &str,
        node: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(node.to_string());
        if node == start {
            return true;
        }
        if visited.insert(node.to_string()) {
            for dep in self.dependencies(node) {
                if self.visit(start, dep, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// Every variable that transitively depends on `id`, ordered so that each
    /// entry comes after everything it depends on.
    pub fn impacted(&self, id: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        self.collect_dependents(id, &mut visited, &mut order);
        order.pop(); // `id` itself finishes last
        order.reverse();
        order
    }

    fn collect_dependents(&self, node: &str, visited: &mut HashSet<String>, order: &mut Vec<String>) {
        if !visited.insert(node.to_string()) {
            return;
        }
        for user in self.dependents(node) {
            self.collect_dependents(user, visited, order);
        }
        order.push(node.to_string());
    }

    /// Dependents of `alias` that live in the alias's own solution. Aliases
    /// are local, so only these resolve through it.
    fn local_dependents<'s>(&'s self, alias: &'s str) -> impl Iterator<Item = &'s String> + 's {
        let solution = alias.split_once('.').map(|(_, s)| s);
        self.dependents(alias)
            .iter()
            .filter(move |user| user.split_once('.').map(|(_, s)| s) == solution)
    }

    /// The cycle that pointing `alias` at `target` would close, given that
    /// `target` depends on `proposed`.
    ///
    /// Formulas written against `alias` before it existed hold edges to the
    /// alias read-id. Once the alias resolves they depend on `target`.
    pub fn merge_cycle(
        &self,
        alias: &str,
        target: &str,
        proposed: &BTreeSet<String>,
    ) -> Option<Vec<String>> {
        for user in self.local_dependents(alias) {
            if user == target {
                return Some(vec![target.to_string(), target.to_string()]);
            }
            if let Some(path) = self.cycle_path(user, proposed) {
                let mut cycle = vec![target.to_string()];
                cycle.extend(path.into_iter().skip(1));
                cycle.push(target.to_string());
                return Some(cycle);
            }
        }
        None
    }

    /// Move the local edges into `alias` over to `target`.
    pub fn merge(&mut self, alias: &str, target: &str) {
        let users: Vec<String> = self.local_dependents(alias).cloned().collect();
        for user in users {
            if let Some(deps) = self.forward.get_mut(&user) {
                deps.remove(alias);
                deps.insert(target.to_string());
            }
            if let Some(old) = self.reverse.get_mut(alias) {
                old.remove(&user);
                if old.is_empty() {
                    self.reverse.remove(alias);
                }
            }
            self.reverse
                .entry(target.to_string())
                .or_default()
                .insert(user);
        }
    }

    /// Number of variables with recorded dependencies.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_record_and_reverse_lookup() {
        let mut tracker = DependencyTracker::new();
        tracker.record("width.result", set(&["width.panel", "thickness.edge"]));
        tracker.record("area.result", set(&["width.panel"]));

        assert_eq!(tracker.dependencies("width.result"), &set(&["thickness.edge", "width.panel"]));
        assert_eq!(tracker.dependents("width.panel"), &set(&["area.result", "width.result"]));
        assert!(tracker.dependents("nothing.here").is_empty());
    }

    #[test]
    fn test_record_overwrites_stale_edges() {
        let mut tracker = DependencyTracker::new();
        tracker.record("a.X", set(&["b.Y"]));
        tracker.record("a.X", set(&["c.Z"]));

        assert!(tracker.dependents("b.Y").is_empty());
        assert_eq!(tracker.dependents("c.Z"), &set(&["a.X"]));

        tracker.remove("a.X");
        assert!(tracker.is_empty());
        assert!(tracker.dependents("c.Z").is_empty());
    }

    #[test]
    fn test_cycle_detection() {
        let mut tracker = DependencyTracker::new();
        tracker.record("b.Y", set(&["a.X"]));

        assert!(tracker.has_cycle("a.X", &set(&["b.Y"])));
        assert_eq!(
            tracker.cycle_path("a.X", &set(&["b.Y"])).unwrap(),
            vec!["a.X", "b.Y", "a.X"]
        );
        assert!(!tracker.has_cycle("c.Z", &set(&["b.Y"])));
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let tracker = DependencyTracker::new();
        assert!(tracker.has_cycle("a.X", &set(&["a.X"])));
    }

    #[test]
    fn test_long_cycle() {
        let mut tracker = DependencyTracker::new();
        tracker.record("b.S", set(&["a.S"]));
        tracker.record("c.S", set(&["b.S"]));
        tracker.record("d.S", set(&["c.S", "x.S"]));
        assert!(tracker.has_cycle("a.S", &set(&["d.S"])));
        assert!(!tracker.has_cycle("x.S", &set(&["a.S"])));
    }

    #[test]
    fn test_merge_moves_local_edges() {
        let mut tracker = DependencyTracker::new();
        tracker.record("a.X", set(&["L.X"]));
        tracker.record("b.Y", set(&["L.X"]));
        tracker.merge("L.X", "length.X");

        assert_eq!(tracker.dependencies("a.X"), &set(&["length.X"]));
        assert_eq!(tracker.dependents("length.X"), &set(&["a.X"]));
        // Aliases are not visible from Y.
        assert_eq!(tracker.dependents("L.X"), &set(&["b.Y"]));
    }

    #[test]
    fn test_merge_cycle() {
        let mut tracker = DependencyTracker::new();
        tracker.record("a.X", set(&["L.X"]));

        assert_eq!(
            tracker.merge_cycle("L.X", "_alias_L.X", &set(&["a.X"])).unwrap(),
            vec!["_alias_L.X", "a.X", "_alias_L.X"]
        );
        assert!(tracker.merge_cycle("L.X", "_alias_L.X", &set(&["c.X"])).is_none());

        tracker.record("length.X", set(&["L.X"]));
        assert_eq!(
            tracker.merge_cycle("L.X", "length.X", &BTreeSet::new()).unwrap(),
            vec!["length.X", "length.X"]
        );
    }

    #[test]
    fn test_impacted_in_refresh_order() {
        let mut tracker = DependencyTracker::new();
        tracker.record("b.S", set(&["a.S"]));
        tracker.record("c.S", set(&["b.S", "a.S"]));
        tracker.record("d.S", set(&["c.S"]));

        let order = tracker.impacted("a.S");
        assert_eq!(order.len(), 3);
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("b.S") < pos("c.S"));
        assert!(pos("c.S") < pos("d.S"));
    }
}
