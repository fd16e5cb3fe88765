//! Graph validation and execution planning
//!
//! The analyzer validates a node/edge set, detects cycles by depth-first
//! traversal, and layers the graph with Kahn's algorithm so that layer `k`
//! contains exactly those nodes whose dependencies all sit in layers `< k`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::debug;

use crate::error::{ErrorKind, ExecutionError};
use crate::graph::{Edge, GraphError, Node};

/// Derived per-node adjacency, alive only during planning and scheduling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphNode {
    /// Ids of predecessor nodes
    pub dependencies: SmallVec<[String; 4]>,

    /// Ids of successor nodes
    pub dependents: SmallVec<[String; 4]>,

    /// 0-based topological layer
    pub level: usize,
}

/// Layered execution plan produced by the analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Layer `k` holds the ids whose dependencies are all in layers `< k`
    pub layers: Vec<Vec<String>>,

    /// Derived adjacency keyed by node id
    pub nodes: HashMap<String, GraphNode>,

    /// Number of planned nodes
    pub total_nodes: usize,

    /// Width of the widest layer
    pub max_parallelism: usize,

    /// Coarse wall-clock estimate assuming per-type node costs
    pub estimated_duration: Duration,
}

impl ExecutionPlan {
    /// Dependencies of a node, empty for unknown ids
    pub fn dependencies_of(&self, node_id: &str) -> &[String] {
        self.nodes
            .get(node_id)
            .map(|n| n.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Dependents of a node, empty for unknown ids
    pub fn dependents_of(&self, node_id: &str) -> &[String] {
        self.nodes
            .get(node_id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Topological layer of a node
    pub fn level_of(&self, node_id: &str) -> Option<usize> {
        self.nodes.get(node_id).map(|n| n.level)
    }
}

/// Result of analyzing a node/edge set
#[derive(Debug)]
pub struct AnalysisReport {
    /// Whether the graph is executable
    pub valid: bool,

    /// All validation problems found
    pub errors: Vec<ExecutionError>,

    /// The plan, present iff the graph is executable
    pub plan: Option<ExecutionPlan>,

    /// Every distinct cycle found, each as a closed id path
    pub cycles: Vec<Vec<String>>,
}

/// Validates graphs and produces layered execution plans
pub struct GraphAnalyzer;

impl GraphAnalyzer {
    /// Analyze a node/edge set
    ///
    /// Duplicate node ids reject the graph outright. Dangling edge endpoints
    /// are reported individually and analysis proceeds on the induced
    /// subgraph. Any cycle (self-loops included) makes the graph invalid and
    /// suppresses the plan.
    pub fn analyze(nodes: &[Node], edges: &[Edge]) -> AnalysisReport {
        let mut errors = Vec::new();

        // Duplicate ids poison every later step, so they reject immediately.
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for node in nodes {
            if !seen.insert(node.id.as_str()) {
                duplicates.push(node.id.clone());
            }
        }
        if !duplicates.is_empty() {
            for id in duplicates {
                errors.push(ExecutionError::new(
                    ErrorKind::Validation,
                    GraphError::DuplicateNode(id).to_string(),
                ));
            }
            return AnalysisReport {
                valid: false,
                errors,
                plan: None,
                cycles: Vec::new(),
            };
        }

        // Induced subgraph: edges whose endpoints both exist.
        let mut usable_edges: Vec<&Edge> = Vec::with_capacity(edges.len());
        for edge in edges {
            let mut dangling = false;
            if !seen.contains(edge.source.as_str()) {
                errors.push(ExecutionError::new(
                    ErrorKind::Validation,
                    format!("edge '{}' references missing source '{}'", edge.id, edge.source),
                ));
                dangling = true;
            }
            if !seen.contains(edge.target.as_str()) {
                errors.push(ExecutionError::new(
                    ErrorKind::Validation,
                    format!("edge '{}' references missing target '{}'", edge.id, edge.target),
                ));
                dangling = true;
            }
            if !dangling {
                usable_edges.push(edge);
            }
        }

        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut node_map: HashMap<&str, NodeIndex> = HashMap::new();
        for node in nodes {
            let idx = graph.add_node(node.id.clone());
            node_map.insert(node.id.as_str(), idx);
        }
        for edge in &usable_edges {
            graph.add_edge(node_map[edge.source.as_str()], node_map[edge.target.as_str()], ());
        }

        let cycles = find_cycles(&graph, nodes, &node_map);
        if !cycles.is_empty() {
            for cycle in &cycles {
                errors.push(ExecutionError::new(
                    ErrorKind::Validation,
                    GraphError::CycleDetected(cycle.join(" -> ")).to_string(),
                ));
            }
            return AnalysisReport {
                valid: false,
                errors,
                plan: None,
                cycles,
            };
        }

        match build_plan(nodes, &usable_edges) {
            Ok(plan) => {
                debug!(
                    total = plan.total_nodes,
                    layers = plan.layers.len(),
                    width = plan.max_parallelism,
                    "graph analysis complete"
                );
                AnalysisReport {
                    valid: true,
                    errors,
                    plan: Some(plan),
                    cycles: Vec::new(),
                }
            }
            Err(internal) => {
                errors.push(internal);
                AnalysisReport {
                    valid: false,
                    errors,
                    plan: None,
                    cycles: Vec::new(),
                }
            }
        }
    }
}

/// Find every distinct cycle via DFS with an on-stack set
///
/// When a node is re-encountered on the stack, the cycle is the current DFS
/// path sliced from the first occurrence of the offending id, closed with it.
fn find_cycles(
    graph: &DiGraph<String, ()>,
    nodes: &[Node],
    node_map: &HashMap<&str, NodeIndex>,
) -> Vec<Vec<String>> {
    let mut visited: HashSet<NodeIndex> = HashSet::new();
    let mut cycles: Vec<Vec<String>> = Vec::new();
    let mut normalized: HashSet<Vec<String>> = HashSet::new();

    for node in nodes {
        let start = node_map[node.id.as_str()];
        if visited.contains(&start) {
            continue;
        }
        let mut on_stack: HashSet<NodeIndex> = HashSet::new();
        let mut path: Vec<NodeIndex> = Vec::new();
        dfs(graph, start, &mut visited, &mut on_stack, &mut path, &mut |cycle_path| {
            let ids: Vec<String> = cycle_path.iter().map(|i| graph[*i].clone()).collect();
            if normalized.insert(normalize_cycle(&ids)) {
                cycles.push(ids);
            }
        });
    }

    cycles
}

fn dfs(
    graph: &DiGraph<String, ()>,
    current: NodeIndex,
    visited: &mut HashSet<NodeIndex>,
    on_stack: &mut HashSet<NodeIndex>,
    path: &mut Vec<NodeIndex>,
    record: &mut impl FnMut(&[NodeIndex]),
) {
    visited.insert(current);
    on_stack.insert(current);
    path.push(current);

    let neighbors: Vec<NodeIndex> = graph.neighbors(current).collect();
    for next in neighbors {
        if on_stack.contains(&next) {
            let first = path.iter().position(|i| *i == next).unwrap_or(0);
            let mut cycle: Vec<NodeIndex> = path[first..].to_vec();
            cycle.push(next);
            record(&cycle);
        } else if !visited.contains(&next) {
            dfs(graph, next, visited, on_stack, path, record);
        }
    }

    path.pop();
    on_stack.remove(&current);
}

/// Rotate a closed cycle path so the smallest id leads, for deduplication
fn normalize_cycle(cycle: &[String]) -> Vec<String> {
    let open = &cycle[..cycle.len() - 1];
    let pivot = open
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut rotated: Vec<String> = Vec::with_capacity(open.len());
    for i in 0..open.len() {
        rotated.push(open[(pivot + i) % open.len()].clone());
    }
    rotated
}

/// Layer the acyclic graph with Kahn's algorithm
fn build_plan(nodes: &[Node], edges: &[&Edge]) -> Result<ExecutionPlan, ExecutionError> {
    let mut graph_nodes: HashMap<String, GraphNode> = nodes
        .iter()
        .map(|n| (n.id.clone(), GraphNode::default()))
        .collect();

    // Dedup parallel edges so in-degrees count distinct predecessors.
    let mut linked: HashSet<(&str, &str)> = HashSet::new();
    for edge in edges {
        if !linked.insert((edge.source.as_str(), edge.target.as_str())) {
            continue;
        }
        graph_nodes
            .get_mut(&edge.target)
            .expect("edge endpoints verified")
            .dependencies
            .push(edge.source.clone());
        graph_nodes
            .get_mut(&edge.source)
            .expect("edge endpoints verified")
            .dependents
            .push(edge.target.clone());
    }

    let mut in_degree: HashMap<String, usize> = HashMap::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for node in nodes {
        let degree = graph_nodes[&node.id].dependencies.len();
        in_degree.insert(node.id.clone(), degree);
        if degree == 0 {
            queue.push_back(node.id.clone());
        }
    }

    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut placed = 0usize;
    while !queue.is_empty() {
        let batch = queue.len();
        let mut layer = Vec::with_capacity(batch);
        for _ in 0..batch {
            let id = queue.pop_front().expect("batch size checked");
            graph_nodes.get_mut(&id).expect("planned node").level = layers.len();
            placed += 1;
            let dependents: Vec<String> = graph_nodes[&id].dependents.iter().cloned().collect();
            for dep in dependents {
                let degree = in_degree.get_mut(&dep).expect("planned node");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dep);
                }
            }
            layer.push(id);
        }
        layers.push(layer);
    }

    if placed != nodes.len() {
        // Cycle detection should have caught this; reaching here is a defect.
        return Err(ExecutionError::new(
            ErrorKind::Fatal,
            format!(
                "internal: layering placed {} of {} nodes despite passing cycle detection",
                placed,
                nodes.len()
            ),
        ));
    }

    let max_parallelism = layers.iter().map(Vec::len).max().unwrap_or(0);
    let types: HashMap<&str, &str> =
        nodes.iter().map(|n| (n.id.as_str(), n.node_type.as_str())).collect();
    let estimated_duration = layers
        .iter()
        .map(|layer| {
            layer
                .iter()
                .map(|id| node_cost(types.get(id.as_str()).copied().unwrap_or("")))
                .max()
                .unwrap_or(Duration::ZERO)
        })
        .sum();

    Ok(ExecutionPlan {
        layers,
        nodes: graph_nodes,
        total_nodes: nodes.len(),
        max_parallelism,
        estimated_duration,
    })
}

/// Coarse per-type node cost used for plan estimates
fn node_cost(node_type: &str) -> Duration {
    match node_type {
        "script" => Duration::from_millis(1000),
        "file" => Duration::from_millis(200),
        "memo" => Duration::from_millis(50),
        "connector" => Duration::from_millis(10),
        _ => Duration::from_millis(100),
    }
}
