//! Dependency-graph validation.
//!
//! Models `depends_on` edges as a `petgraph` directed graph; a topological
//! sort doubles as cycle detection and reports the step where the cycle was
//! found.

use std::collections::HashMap;

use gork_types::workflow::WorkflowStep;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::WorkflowError;

/// Verify the `depends_on` graph is acyclic and every reference resolves.
pub fn ensure_acyclic(steps: &[WorkflowStep]) -> Result<(), WorkflowError> {
    let name_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<_> = steps.iter().map(|s| graph.add_node(s.name.as_str())).collect();

    for step in steps {
        let to = name_to_idx[step.name.as_str()];
        for dep in &step.depends_on {
            let from = name_to_idx.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                }
            })?;
            graph.add_edge(nodes[*from], nodes[to], ());
        }
    }

    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| WorkflowError::Cycle(graph[cycle.node_id()].to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
