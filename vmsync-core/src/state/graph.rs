//! Property Dependency Graph
//!
//! Derived properties (such as a `FullName` computed from `FirstName` and
//! `LastName`) must be reported as changed whenever one of their inputs
//! changes. View-model authors declare these inputs explicitly through
//! [`PropertyDescriptor::depends_on`]; this module turns those declarations
//! into a directed graph.
//!
//! # Algorithm
//!
//! When a source property changes:
//!
//! 1. Walk the graph breadth-first from the source to collect every
//!    transitive dependent.
//! 2. Sort the collected properties topologically (Kahn's algorithm) so a
//!    derived property is always reported after the properties it reads.
//!
//! Dependency cycles are a declaration mistake, but they must not make a
//! property disappear from the dirty set. Properties left over after the
//! topological pass (the ones on a cycle) are appended in discovery order.

use std::collections::VecDeque;

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;

use super::PropertyDescriptor;

/// Edges of one property in the graph.
#[derive(Debug, Default)]
struct Node {
    /// Properties this one is computed from.
    dependencies: IndexSet<String>,
    /// Properties computed from this one.
    dependents: IndexSet<String>,
}

/// Dependency graph over the properties of one view-model type.
///
/// Insertion-ordered maps keep traversal deterministic, so two instances of
/// the same type always report derived properties in the same order.
#[derive(Debug, Default)]
pub struct PropertyGraph {
    nodes: IndexMap<String, Node>,
}

impl PropertyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from a view model's property table.
    pub fn from_descriptors(table: &[PropertyDescriptor]) -> Self {
        let mut graph = Self::new();
        for descriptor in table {
            graph.add_property(descriptor.name);
        }
        for descriptor in table {
            for dependency in descriptor.depends_on {
                graph.add_edge(dependency, descriptor.name);
            }
        }
        graph
    }

    /// Add a property with no edges. No-op if it already exists.
    pub fn add_property(&mut self, name: &str) {
        if !self.nodes.contains_key(name) {
            self.nodes.insert(name.to_owned(), Node::default());
        }
    }

    /// Add an edge: `dependent` is computed from `dependency`.
    ///
    /// Both ends are added to the graph if they are not already present.
    pub fn add_edge(&mut self, dependency: &str, dependent: &str) {
        self.add_property(dependency);
        self.add_property(dependent);

        if let Some(node) = self.nodes.get_mut(dependency) {
            node.dependents.insert(dependent.to_owned());
        }
        if let Some(node) = self.nodes.get_mut(dependent) {
            node.dependencies.insert(dependency.to_owned());
        }
    }

    /// Every property that transitively depends on `source`, dependencies
    /// before dependents. The source itself is not included.
    pub fn dependents_of(&self, source: &str) -> SmallVec<[&str; 4]> {
        let mut visited: IndexSet<&str> = IndexSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        if let Some(node) = self.nodes.get(source) {
            queue.extend(node.dependents.iter().map(String::as_str));
        }

        while let Some(name) = queue.pop_front() {
            if name == source || !visited.insert(name) {
                continue;
            }
            if let Some(node) = self.nodes.get(name) {
                queue.extend(node.dependents.iter().map(String::as_str));
            }
        }

        self.topological_sort(&visited)
    }

    /// Order `names` so that dependencies come before dependents.
    fn topological_sort<'a>(&'a self, names: &IndexSet<&'a str>) -> SmallVec<[&'a str; 4]> {
        let mut in_degree: IndexMap<&str, usize> = IndexMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut result: SmallVec<[&str; 4]> = SmallVec::new();

        // Only edges inside the affected set count.
        for &name in names {
            let degree = self
                .nodes
                .get(name)
                .map(|node| {
                    node.dependencies
                        .iter()
                        .filter(|dep| names.contains(dep.as_str()))
                        .count()
                })
                .unwrap_or(0);
            in_degree.insert(name, degree);
            if degree == 0 {
                queue.push_back(name);
            }
        }

        while let Some(name) = queue.pop_front() {
            result.push(name);

            if let Some(node) = self.nodes.get(name) {
                for dependent in &node.dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(dependent.as_str());
                        }
                    }
                }
            }
        }

        // Anything left is on a cycle.
        if result.len() < names.len() {
            for &name in names {
                if !result.contains(&name) {
                    result.push(name);
                }
            }
        }

        result
    }

    /// Number of properties in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
