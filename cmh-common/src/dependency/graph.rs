// cmh-common/src/dependency/graph.rs
//! Resolved modules arranged as an arena-backed DAG.
//!
//! Nodes live in a `Vec` and edges are index pairs, so mutually referring
//! modules never form ownership cycles. Construction rejects duplicates,
//! dangling edges and cycles, and records a dependency-first order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use semver::Version;
use tracing::{debug, error};

use crate::error::{CmhError, Result};
use crate::model::{ModuleDescriptor, ParameterValue};

/// One module with its chosen version and effective parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModule {
    pub name: String,
    pub version: Version,
    /// Declared defaults merged with explicit values.
    pub parameters: BTreeMap<String, ParameterValue>,
    pub dependencies: BTreeSet<String>,
    pub descriptor: Arc<ModuleDescriptor>,
}

impl ResolvedModule {
    pub fn new(descriptor: Arc<ModuleDescriptor>, version: Version) -> Self {
        Self {
            name: descriptor.name.clone(),
            version,
            parameters: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            descriptor,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into());
        self
    }
}

impl fmt::Display for ResolvedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<ResolvedModule>,
    index: HashMap<String, usize>,
    /// (dependent, dependency)
    edges: Vec<(usize, usize)>,
    adjacency: Vec<Vec<usize>>,
    /// Dependency-first.
    order: Vec<usize>,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedModule> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[ResolvedModule] {
        &self.nodes
    }

    /// Every module after all of its dependencies.
    pub fn topological_order(&self) -> impl Iterator<Item = &ResolvedModule> + '_ {
        self.order.iter().map(|&i| &self.nodes[i])
    }

    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.edges
            .iter()
            .map(|&(from, to)| (self.nodes[from].name.as_str(), self.nodes[to].name.as_str()))
    }

    pub fn dependencies_of(&self, name: &str) -> Vec<&ResolvedModule> {
        self.index
            .get(name)
            .map(|&i| self.adjacency[i].iter().map(|&d| &self.nodes[d]).collect())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, name: &str) -> Vec<&ResolvedModule> {
        let Some(&target) = self.index.get(name) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .filter(|&&(_, to)| to == target)
            .map(|&(from, _)| &self.nodes[from])
            .collect()
    }

    /// Groups nodes so that every dependency sits in an earlier level.
    /// Nodes of one level do not depend on each other.
    pub fn levels(&self) -> Vec<Vec<&ResolvedModule>> {
        let mut level_of = vec![0usize; self.nodes.len()];
        let mut levels: Vec<Vec<&ResolvedModule>> = Vec::new();
        for &node in &self.order {
            let level = self.adjacency[node]
                .iter()
                .map(|&d| level_of[d] + 1)
                .max()
                .unwrap_or(0);
            level_of[node] = level;
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(&self.nodes[node]);
        }
        levels
    }
}

pub struct GraphBuilder;

impl GraphBuilder {
    /// Assembles resolved modules into a validated DAG.
    pub fn build(modules: Vec<ResolvedModule>) -> Result<DependencyGraph> {
        let mut index = HashMap::with_capacity(modules.len());
        for (i, module) in modules.iter().enumerate() {
            if index.insert(module.name.clone(), i).is_some() {
                error!("Module '{}' was resolved twice.", module.name);
                return Err(CmhError::DuplicateModule(module.name.clone()));
            }
        }

        let mut edges = Vec::new();
        let mut adjacency = vec![Vec::new(); modules.len()];
        for (i, module) in modules.iter().enumerate() {
            for dependency in &module.dependencies {
                let Some(&target) = index.get(dependency) else {
                    return Err(CmhError::MissingDependency {
                        module: module.name.clone(),
                        dependency: dependency.clone(),
                    });
                };
                edges.push((i, target));
                adjacency[i].push(target);
            }
        }

        let mut graph = DependencyGraph {
            nodes: modules,
            index,
            edges,
            adjacency,
            order: Vec::new(),
        };

        let mut marks = vec![Mark::Unvisited; graph.nodes.len()];
        let mut order = Vec::with_capacity(graph.nodes.len());
        for node in 0..graph.nodes.len() {
            graph.visit(node, &mut marks, &mut order)?;
        }
        graph.order = order;

        debug!(
            "Dependency graph built: {} nodes, {} edges, order {:?}",
            graph.nodes.len(),
            graph.edges.len(),
            graph.order.iter().map(|&i| graph.nodes[i].name.as_str()).collect::<Vec<_>>()
        );
        Ok(graph)
    }
}

impl DependencyGraph {
    /// Depth-first post-order from `root` with an explicit frame stack, so
    /// path length is bounded by memory rather than the thread stack.
    fn visit(&self, root: usize, marks: &mut [Mark], order: &mut Vec<usize>) -> Result<()> {
        if marks[root] != Mark::Unvisited {
            return Ok(());
        }
        marks[root] = Mark::InProgress;
        // (node, index of the next dependency to look at)
        let mut frames: Vec<(usize, usize)> = vec![(root, 0)];

        while let Some(frame) = frames.last_mut() {
            let (node, next) = *frame;
            let Some(&dependency) = self.adjacency[node].get(next) else {
                frames.pop();
                marks[node] = Mark::Done;
                order.push(node);
                continue;
            };
            frame.1 += 1;

            match marks[dependency] {
                Mark::Done => {}
                Mark::InProgress => {
                    let start = frames
                        .iter()
                        .position(|&(n, _)| n == dependency)
                        .unwrap_or(0);
                    let mut path: Vec<String> = frames[start..]
                        .iter()
                        .map(|&(n, _)| self.nodes[n].name.clone())
                        .collect();
                    path.push(self.nodes[dependency].name.clone());
                    error!("Dependency cycle detected: {}", path.join(" -> "));
                    return Err(CmhError::Cycle { path });
                }
                Mark::Unvisited => {
                    marks[dependency] = Mark::InProgress;
                    frames.push((dependency, 0));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, deps: &[&str]) -> ResolvedModule {
        let descriptor = Arc::new(ModuleDescriptor::new(name, vec![Version::new(1, 0, 0)]));
        deps.iter().fold(
            ResolvedModule::new(descriptor, Version::new(1, 0, 0)),
            |m, d| m.with_dependency(*d),
        )
    }

    fn position(order: &[&str], name: &str) -> usize {
        order.iter().position(|n| *n == name).unwrap()
    }

    #[test]
    fn acyclic_graph_is_ordered_dependencies_first() {
        let graph = GraphBuilder::build(vec![
            node("app", &["fmt", "spdlog"]),
            node("spdlog", &["fmt"]),
            node("fmt", &[]),
        ])
        .unwrap();

        let order: Vec<&str> = graph.topological_order().map(|m| m.name.as_str()).collect();
        assert_eq!(order.len(), 3);
        for (from, to) in graph.edges() {
            assert!(position(&order, to) < position(&order, from), "{to} must precede {from}");
        }
        assert_eq!(graph.dependents_of("fmt").len(), 2);
        assert_eq!(graph.dependencies_of("app").len(), 2);
    }

    #[test]
    fn cycle_reports_the_full_path() {
        let err = GraphBuilder::build(vec![node("A", &["B"]), node("B", &["C"]), node("C", &["A"])])
            .unwrap_err();
        match err {
            CmhError::Cycle { path } => assert_eq!(path, vec!["A", "B", "C", "A"]),
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn cycle_below_an_acyclic_prefix_excludes_the_prefix() {
        let err = GraphBuilder::build(vec![
            node("root", &["x"]),
            node("x", &["y"]),
            node("y", &["x"]),
        ])
        .unwrap_err();
        assert!(matches!(err, CmhError::Cycle { path } if path == vec!["x", "y", "x"]));
    }

    #[test]
    fn duplicate_and_dangling_nodes_are_rejected() {
        assert!(matches!(
            GraphBuilder::build(vec![node("a", &[]), node("a", &[])]),
            Err(CmhError::DuplicateModule(name)) if name == "a"
        ));
        assert!(matches!(
            GraphBuilder::build(vec![node("a", &["ghost"])]),
            Err(CmhError::MissingDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn levels_group_independent_nodes() {
        let graph = GraphBuilder::build(vec![
            node("app", &["left", "right"]),
            node("left", &["base"]),
            node("right", &["base"]),
            node("base", &[]),
        ])
        .unwrap();
        let levels: Vec<Vec<&str>> = graph
            .levels()
            .into_iter()
            .map(|l| l.into_iter().map(|m| m.name.as_str()).collect())
            .collect();
        assert_eq!(levels, vec![vec!["base"], vec!["left", "right"], vec!["app"]]);
    }

    #[test]
    fn very_long_chain_does_not_exhaust_the_stack() {
        const N: usize = 50_000;
        let mut modules: Vec<ResolvedModule> = (0..N)
            .map(|i| {
                let name = format!("m{i}");
                if i + 1 < N {
                    node(&name, &[&format!("m{}", i + 1)])
                } else {
                    node(&name, &[])
                }
            })
            .collect();
        modules.reverse();
        let graph = GraphBuilder::build(modules).unwrap();
        let order: Vec<&str> = graph.topological_order().map(|m| m.name.as_str()).collect();
        assert_eq!(order.len(), N);
        assert_eq!(order[0], format!("m{}", N - 1));
        assert_eq!(order[N - 1], "m0");
        assert_eq!(graph.levels().len(), N);
    }

    #[test]
    fn cycle_at_the_end_of_a_long_chain_is_reported() {
        const N: usize = 20_000;
        let mut modules: Vec<ResolvedModule> = (0..N)
            .map(|i| node(&format!("m{i}"), &[&format!("m{}", i + 1)]))
            .collect();
        modules.push(node(&format!("m{N}"), &[&format!("m{}", N - 1)]));
        let err = GraphBuilder::build(modules).unwrap_err();
        match err {
            CmhError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 3);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }
}
