//! Resolves the catalog into the dependency graph the scheduler runs on.
//!
//! Nodes are ports, edges point dependency → dependent. The resolver owns
//! everything that can be decided before the first worker starts: unknown
//! origins, cycle detection, the transitive fan-out metric used for dispatch
//! ordering and the dependency closure of a requested build list.

use crate::{
    catalog::Catalog,
    error::{DsynthError, Result},
    port::{Origin, Port},
};
use std::collections::{HashMap, HashSet, VecDeque};

/// Node handle into a [`Graph`].
pub type NodeIdx = usize;

/// Dependency relationships between all ports of a campaign.
#[derive(Clone, Debug, Default)]
pub struct GraphEdges {
    /// `deps[n]` are the nodes `n` depends on.
    deps: Vec<Vec<NodeIdx>>,
    /// `dependents[n]` are the nodes that depend on `n`.
    dependents: Vec<Vec<NodeIdx>>,
}

impl GraphEdges {
    pub fn deps_of(&self, node: NodeIdx) -> &[NodeIdx] {
        &self.deps[node]
    }

    pub fn dependents_of(&self, node: NodeIdx) -> &[NodeIdx] {
        &self.dependents[node]
    }

    /// Number of direct dependencies of `node`.
    pub fn dep_count(&self, node: NodeIdx) -> usize {
        self.deps[node].len()
    }

    /// All nodes reachable from `node` following dependent edges.
    pub fn transitive_dependents(&self, node: NodeIdx) -> HashSet<NodeIdx> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeIdx> = self.dependents[node].iter().copied().collect();
        while let Some(n) = queue.pop_front() {
            if seen.insert(n) {
                queue.extend(self.dependents[n].iter().copied());
            }
        }
        seen
    }
}

/// The resolved, validated dependency DAG.
#[derive(Clone, Debug)]
pub struct Graph {
    nodes: Vec<Port>,
    indices: HashMap<Origin, NodeIdx>,
    edges: GraphEdges,
}

impl Graph {
    /// Resolves a catalog into a graph, rejecting unknown origins and cycles.
    pub fn resolve(catalog: &Catalog) -> Result<Self> {
        let nodes: Vec<Port> = catalog.ports.iter().map(|rec| rec.to_port()).collect();
        let mut indices = HashMap::with_capacity(nodes.len());
        for (idx, port) in nodes.iter().enumerate() {
            if indices.insert(port.origin.clone(), idx).is_some() {
                return Err(DsynthError::Dag(format!(
                    "origin {} appears more than once in the catalog",
                    port.origin
                )));
            }
        }

        let mut deps: Vec<Vec<NodeIdx>> = vec![Vec::new(); nodes.len()];
        let mut dependents: Vec<Vec<NodeIdx>> = vec![Vec::new(); nodes.len()];
        for (idx, rec) in catalog.ports.iter().enumerate() {
            for dep in rec.all_deps() {
                let dep_idx = *indices.get(&dep).ok_or_else(|| {
                    DsynthError::Dag(format!("{} depends on unknown origin {}", rec.origin, dep))
                })?;
                if dep_idx == idx {
                    return Err(DsynthError::Dag(format!("{} depends on itself", rec.origin)));
                }
                deps[idx].push(dep_idx);
                dependents[dep_idx].push(idx);
            }
        }

        let graph = Self { nodes, indices, edges: GraphEdges { deps, dependents } };
        graph.ensure_acyclic()?;
        Ok(graph)
    }

    pub fn node(&self, idx: NodeIdx) -> &Port {
        &self.nodes[idx]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn lookup(&self, origin: &Origin) -> Option<NodeIdx> {
        self.indices.get(origin).copied()
    }

    pub fn edges(&self) -> &GraphEdges {
        &self.edges
    }

    pub fn ports(&self) -> impl Iterator<Item = (NodeIdx, &Port)> {
        self.nodes.iter().enumerate()
    }

    /// The dependency closure of the requested origins: every requested node
    /// plus everything it transitively depends on.
    pub fn build_set(&self, requested: &[Origin]) -> Result<HashSet<NodeIdx>> {
        let mut selected = HashSet::new();
        let mut queue = VecDeque::new();
        for origin in requested {
            let idx = self
                .lookup(origin)
                .ok_or_else(|| DsynthError::Dag(format!("requested unknown origin {origin}")))?;
            if selected.insert(idx) {
                queue.push_back(idx);
            }
        }
        while let Some(n) = queue.pop_front() {
            for &dep in self.edges.deps_of(n) {
                if selected.insert(dep) {
                    queue.push_back(dep);
                }
            }
        }
        Ok(selected)
    }

    /// Transitive dependent count per node.
    ///
    /// Dispatching high fan-out ports first unblocks the most downstream
    /// work; this is the primary dispatch-ordering key.
    pub fn fan_out(&self) -> Vec<usize> {
        (0..self.nodes.len()).map(|n| self.edges.transitive_dependents(n).len()).collect()
    }

    /// Tarjan SCC over the dependency edges. Any component with more than one
    /// node is a cycle; self-edges are rejected during resolve.
    fn ensure_acyclic(&self) -> Result<()> {
        let n = self.nodes.len();
        let mut index = vec![usize::MAX; n];
        let mut lowlink = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<NodeIdx> = Vec::new();
        let mut next_index = 0usize;
        let mut cycles: Vec<Vec<NodeIdx>> = Vec::new();

        // Iterative Tarjan; the call stack tracks (node, next-child-position).
        for start in 0..n {
            if index[start] != usize::MAX {
                continue;
            }
            let mut call: Vec<(NodeIdx, usize)> = vec![(start, 0)];
            while let Some((v, child)) = call.pop() {
                if child == 0 {
                    index[v] = next_index;
                    lowlink[v] = next_index;
                    next_index += 1;
                    stack.push(v);
                    on_stack[v] = true;
                }
                if child < self.edges.deps[v].len() {
                    let w = self.edges.deps[v][child];
                    call.push((v, child + 1));
                    if index[w] == usize::MAX {
                        call.push((w, 0));
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                } else {
                    if lowlink[v] == index[v] {
                        let mut component = Vec::new();
                        loop {
                            let w = stack.pop().unwrap();
                            on_stack[w] = false;
                            component.push(w);
                            if w == v {
                                break;
                            }
                        }
                        if component.len() > 1 {
                            cycles.push(component);
                        }
                    }
                    if let Some(&(parent, _)) = call.last() {
                        lowlink[parent] = lowlink[parent].min(lowlink[v]);
                    }
                }
            }
        }

        if cycles.is_empty() {
            return Ok(());
        }
        let mut desc = String::from("dependency cycle detected: ");
        for (i, component) in cycles.iter().enumerate() {
            if i > 0 {
                desc.push_str("; ");
            }
            let mut origins: Vec<String> =
                component.iter().map(|&n| self.nodes[n].origin.to_string()).collect();
            origins.sort();
            desc.push_str(&origins.join(" <-> "));
        }
        Err(DsynthError::Dag(desc))
    }
}
