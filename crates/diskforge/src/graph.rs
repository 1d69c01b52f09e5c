//! Build graph of compilation units.
//!
//! Units reference their dependencies by name only; a unit never owns a
//! dependency, it just requires the dependency's artifact to exist. Cycles,
//! duplicate names and dangling references are rejected when the graph is
//! constructed, so every graph that exists has a valid build order.

use crate::error::{BuildError, Result, Stage};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Compiled library artifact (`--crate-type lib`).
    Library,
    /// Relocatable object handed to the linker (`--emit obj`).
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationUnit {
    pub name: String,
    pub source: PathBuf,
    pub deps: Vec<String>,
    pub kind: UnitKind,
    /// Extra compiler flags for this unit only.
    pub flags: Vec<String>,
}

impl CompilationUnit {
    pub fn library(name: &str, source: impl Into<PathBuf>) -> Self {
        CompilationUnit {
            name: name.to_string(),
            source: source.into(),
            deps: Vec::new(),
            kind: UnitKind::Library,
            flags: Vec::new(),
        }
    }

    #[must_use]
    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.deps.extend(deps.iter().map(ToString::to_string));
        self
    }
}

#[derive(Debug, Clone)]
pub struct BuildGraph {
    units: Vec<CompilationUnit>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Active,
    Done,
}

impl BuildGraph {
    /// Validate `units` and compute their build order.
    ///
    /// The order is deterministic: units are visited in declaration order and
    /// each unit's dependencies in the order they were listed.
    pub fn new(stage: Stage, units: Vec<CompilationUnit>) -> Result<Self> {
        let mut index = HashMap::with_capacity(units.len());
        for (i, unit) in units.iter().enumerate() {
            if index.insert(unit.name.clone(), i).is_some() {
                return Err(BuildError::DuplicateUnit {
                    stage,
                    unit: unit.name.clone(),
                });
            }
        }

        for unit in &units {
            if let Some(missing) = unit.deps.iter().find(|d| !index.contains_key(*d)) {
                return Err(BuildError::UnknownDependency {
                    stage,
                    unit: unit.name.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let mut marks = vec![Mark::Unvisited; units.len()];
        let mut stack = Vec::new();
        let mut order = Vec::with_capacity(units.len());
        for i in 0..units.len() {
            visit(i, &units, &index, &mut marks, &mut stack, &mut order)
                .map_err(|cycle| BuildError::CyclicDependency { stage, cycle })?;
        }

        Ok(BuildGraph {
            units,
            index,
            order,
        })
    }

    /// Units in build order (every unit after all of its dependencies).
    pub fn order(&self) -> impl Iterator<Item = &CompilationUnit> {
        self.order.iter().map(|&i| &self.units[i])
    }

    pub fn unit(&self, name: &str) -> Option<&CompilationUnit> {
        self.index.get(name).map(|&i| &self.units[i])
    }

    pub(crate) fn len(&self) -> usize {
        self.units.len()
    }

    /// Every unit `name` depends on, directly or not, in build order.
    pub fn transitive_deps(&self, name: &str) -> Vec<&CompilationUnit> {
        let mut closure = BTreeSet::new();
        let mut pending: Vec<&str> = self
            .unit(name)
            .map(|u| u.deps.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(dep) = pending.pop() {
            if closure.insert(dep) {
                if let Some(unit) = self.unit(dep) {
                    pending.extend(unit.deps.iter().map(String::as_str));
                }
            }
        }
        self.order()
            .filter(|u| closure.contains(u.name.as_str()))
            .collect()
    }
}

fn visit(
    i: usize,
    units: &[CompilationUnit],
    index: &HashMap<String, usize>,
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
    order: &mut Vec<usize>,
) -> std::result::Result<(), Vec<String>> {
    match marks[i] {
        Mark::Done => return Ok(()),
        Mark::Active => {
            let start = stack.iter().position(|&s| s == i).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..]
                .iter()
                .map(|&s| units[s].name.clone())
                .collect();
            cycle.push(units[i].name.clone());
            return Err(cycle);
        }
        Mark::Unvisited => {}
    }

    marks[i] = Mark::Active;
    stack.push(i);
    for dep in &units[i].deps {
        visit(index[dep], units, index, marks, stack, order)?;
    }
    stack.pop();
    marks[i] = Mark::Done;
    order.push(i);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(graph: &BuildGraph) -> Vec<&str> {
        graph.order().map(|u| u.name.as_str()).collect()
    }

    #[test]
    fn test_dependencies_come_first() {
        // Declared in reverse to make sure order does not come from declaration.
        let graph = BuildGraph::new(
            Stage::Runtime,
            vec![
                CompilationUnit::library("collections", "c.rs")
                    .depends_on(&["core", "alloc", "alloc_system"]),
                CompilationUnit::library("alloc_system", "s.rs").depends_on(&["core"]),
                CompilationUnit::library("alloc", "a.rs").depends_on(&["core"]),
                CompilationUnit::library("core", "k.rs"),
            ],
        )
        .unwrap();

        assert_eq!(
            names(&graph),
            vec!["core", "alloc", "alloc_system", "collections"]
        );
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = BuildGraph::new(
            Stage::Runtime,
            vec![
                CompilationUnit::library("a", "a.rs").depends_on(&["b"]),
                CompilationUnit::library("b", "b.rs").depends_on(&["c"]),
                CompilationUnit::library("c", "c.rs").depends_on(&["a"]),
            ],
        )
        .unwrap_err();

        assert!(matches!(
            err,
            BuildError::CyclicDependency { ref cycle, .. } if *cycle == ["a", "b", "c", "a"]
        ));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = BuildGraph::new(
            Stage::Runtime,
            vec![CompilationUnit::library("a", "a.rs").depends_on(&["a"])],
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::CyclicDependency { .. }));
    }

    #[test]
    fn test_unknown_and_duplicate_units() {
        let err = BuildGraph::new(
            Stage::Runtime,
            vec![CompilationUnit::library("a", "a.rs").depends_on(&["ghost"])],
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::UnknownDependency { ref dependency, .. } if dependency == "ghost"));

        let err = BuildGraph::new(
            Stage::Runtime,
            vec![
                CompilationUnit::library("a", "a.rs"),
                CompilationUnit::library("a", "b.rs"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::DuplicateUnit { .. }));
    }

    #[test]
    fn test_transitive_deps_in_build_order() {
        let graph = BuildGraph::new(
            Stage::Runtime,
            vec![
                CompilationUnit::library("core", "k.rs"),
                CompilationUnit::library("alloc", "a.rs").depends_on(&["core"]),
                CompilationUnit::library("top", "t.rs").depends_on(&["alloc"]),
            ],
        )
        .unwrap();
        let deps: Vec<_> = graph
            .transitive_deps("top")
            .into_iter()
            .map(|u| u.name.as_str())
            .collect();
        assert_eq!(deps, vec!["core", "alloc"]);
        assert!(graph.transitive_deps("core").is_empty());
    }
}
