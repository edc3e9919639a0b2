//! Dependency ordering of calculated indicators.
//!
//! Calculated indicators may reference other calculated indicators, so they
//! must be compiled dependencies-first. The graph holds one node per
//! calculated indicator and an edge `dependency -> dependent` for every
//! calculated ID a formula mentions; raw IDs are not nodes.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;

use crate::formula::tokenize;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cyclic dependency between calculated indicators: {}", format_cycles(.cycles))]
    CyclicDependency { cycles: Vec<Vec<String>> },
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|cycle| cycle.join(" -> "))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Calculated-indicator dependency graph.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,

    /// Index: indicator ID → NodeIndex
    node_index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph from calculated-indicator formulas keyed by ID.
    pub fn from_formulas<S: AsRef<str>>(formulas: &BTreeMap<String, S>) -> Self {
        let mut graph = DependencyGraph::default();
        for id in formulas.keys() {
            graph.add_node(id);
        }

        for (id, formula) in formulas {
            for token in tokenize(formula.as_ref()) {
                if formulas.contains_key(&token) {
                    let from = graph.node_index[&token];
                    let to = graph.node_index[id];
                    graph.graph.update_edge(from, to, ());
                }
            }
        }
        graph
    }

    fn add_node(&mut self, id: &str) -> NodeIndex {
        if let Some(&idx) = self.node_index.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(id.to_string());
        self.node_index.insert(id.to_string(), idx);
        idx
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Calculated indicators that `id` references directly.
    pub fn dependencies(&self, id: &str) -> BTreeSet<&str> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Calculated indicators that reference `id` directly.
    pub fn dependents(&self, id: &str) -> BTreeSet<&str> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> BTreeSet<&str> {
        let Some(&idx) = self.node_index.get(id) else {
            return BTreeSet::new();
        };
        self.graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].as_str())
            .collect()
    }

    /// Find every dependency cycle.
    ///
    /// A strongly connected component is a cycle when it has more than one
    /// node, or a single node referencing itself. Each cycle is sorted, and
    /// the list of cycles is sorted, so the report is stable across runs.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut cycles: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                if scc.len() == 1 {
                    let idx = scc[0];
                    self.graph.edges_connecting(idx, idx).next().is_some()
                } else {
                    true
                }
            })
            .map(|scc| {
                let mut cycle: Vec<String> =
                    scc.into_iter().map(|idx| self.graph[idx].clone()).collect();
                cycle.sort();
                cycle
            })
            .collect();
        cycles.sort();
        cycles
    }

    /// Dependencies-first order of every calculated indicator.
    ///
    /// Kahn's algorithm; among indicators that are ready at the same time the
    /// smallest ID goes first, so equal inputs always give equal orders.
    pub fn topological_order(&self) -> GraphResult<Vec<String>> {
        let cycles = self.detect_cycles();
        if !cycles.is_empty() {
            return Err(GraphError::CyclicDependency { cycles });
        }

        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let degree = self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count();
                (idx, degree)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(&str, NodeIndex)>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&idx, _)| Reverse((self.graph[idx].as_str(), idx)))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((id, idx))) = ready.pop() {
            order.push(id.to_string());
            for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((self.graph[dependent].as_str(), dependent)));
                    }
                }
            }
        }

        Ok(order)
    }
}

/// Order calculated indicators so that every indicator comes after the
/// calculated indicators its formula references.
pub fn sort_calculated_indicators<S: AsRef<str>>(
    formulas: &BTreeMap<String, S>,
) -> GraphResult<Vec<String>> {
    DependencyGraph::from_formulas(formulas).topological_order()
}
