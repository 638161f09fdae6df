//! Pure-function DAG validator.
//!
//! `validate` never mutates its input and never fails — it always returns a
//! report. Structural errors (duplicate ids, dangling edges, wrong start/end
//! counts, fork/join arity) short-circuit the cycle and reachability passes,
//! since those passes assume a well-formed graph and would otherwise produce
//! misleading cascading errors.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::{NodeType, WorkflowDefinition};

/// Outcome of validating a [`WorkflowDefinition`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate a workflow definition, returning every finding (never just the
/// first).
pub fn validate(def: &WorkflowDefinition) -> ValidationReport {
    let mut errors = Vec::new();

    if def.nodes.is_empty() {
        errors.push("definition has no nodes".to_string());
        return ValidationReport { errors };
    }

    let mut structural_errors = Vec::new();

    // Duplicate node/edge ids.
    let mut seen_nodes = HashSet::new();
    for node in &def.nodes {
        if !seen_nodes.insert(node.id.as_str()) {
            structural_errors.push(format!("duplicate node id: {}", node.id));
        }
    }
    let mut seen_edges = HashSet::new();
    for edge in &def.edges {
        if !seen_edges.insert(edge.id.as_str()) {
            structural_errors.push(format!("duplicate edge id: {}", edge.id));
        }
    }

    // Start/end counts.
    let start_count = def
        .nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Start)
        .count();
    if start_count != 1 {
        structural_errors.push(format!(
            "expected exactly one start node, found {start_count}"
        ));
    }
    let end_count = def
        .nodes
        .iter()
        .filter(|n| n.node_type == NodeType::End)
        .count();
    if end_count == 0 {
        structural_errors.push("expected at least one end node, found 0".to_string());
    }

    // Edge endpoints must reference defined nodes.
    let node_ids: HashSet<&str> = def.nodes.iter().map(|n| n.id.as_str()).collect();
    for edge in &def.edges {
        if !node_ids.contains(edge.source.as_str()) {
            structural_errors.push(format!(
                "edge {} references unknown source node {}",
                edge.id, edge.source
            ));
        }
        if !node_ids.contains(edge.target.as_str()) {
            structural_errors.push(format!(
                "edge {} references unknown target node {}",
                edge.id, edge.target
            ));
        }
    }

    // fork: >=2 out-edges, join: >=2 in-edges.
    for node in &def.nodes {
        match node.node_type {
            NodeType::Fork => {
                let out = def.out_edges(&node.id).count();
                if out < 2 {
                    structural_errors.push(format!(
                        "fork node {} must have at least 2 outgoing edges, found {out}",
                        node.id
                    ));
                }
            }
            NodeType::Join => {
                let in_count = def.in_edges(&node.id).count();
                if in_count < 2 {
                    structural_errors.push(format!(
                        "join node {} must have at least 2 incoming edges, found {in_count}",
                        node.id
                    ));
                }
            }
            _ => {}
        }
    }

    if !structural_errors.is_empty() {
        errors.extend(structural_errors);
        return ValidationReport { errors };
    }

    // Cycle detection via Kahn's algorithm.
    let mut in_degree: HashMap<&str, usize> = def.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    for edge in &def.edges {
        *in_degree.entry(edge.target.as_str()).or_insert(0) += 1;
    }
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut peeled = 0usize;
    let mut working_degree = in_degree.clone();
    while let Some(node_id) = queue.pop_front() {
        peeled += 1;
        for edge in def.out_edges(node_id) {
            if let Some(deg) = working_degree.get_mut(edge.target.as_str()) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(edge.target.as_str());
                }
            }
        }
    }
    if peeled != def.nodes.len() {
        errors.push("definition contains a cycle".to_string());
        // A cyclic graph makes reachability analysis meaningless too.
        return ValidationReport { errors };
    }

    // Reachability from start via BFS.
    if let Some(start) = def.start_node() {
        let mut reachable = HashSet::new();
        reachable.insert(start.id.as_str());
        let mut queue = VecDeque::new();
        queue.push_back(start.id.as_str());
        while let Some(node_id) = queue.pop_front() {
            for edge in def.out_edges(node_id) {
                if reachable.insert(edge.target.as_str()) {
                    queue.push_back(edge.target.as_str());
                }
            }
        }
        for node in &def.nodes {
            if !reachable.contains(node.id.as_str()) {
                errors.push(format!("node {} is not reachable from start", node.id));
            }
        }
    }

    ValidationReport { errors }
}
