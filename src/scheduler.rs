//! Dependency-driven dispatch of ports to worker slots.
//!
//! The scheduler owns the DAG state behind a single mutex; workers pull work
//! through [`Scheduler::acquire`] and report results through
//! [`Scheduler::complete`]. A condition variable wakes sleeping workers when
//! the ready queue refills or shutdown is requested. The scheduler never
//! pushes work.
//!
//! Dispatch order among ready ports: transitive dependent count descending,
//! then estimated build cost descending, then origin lexicographic. Any
//! topologically valid order would be correct; this one unblocks the most
//! downstream work first.

use crate::{
    error::{DsynthError, Result},
    port::{Origin, Port, PortState},
    resolver::{Graph, NodeIdx},
    stores::PackageStore,
};
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Condvar, Mutex,
    },
};

/// Result of one build attempt, as reported by a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed(String),
}

/// A port handed to a worker slot.
#[derive(Clone, Debug)]
pub struct Assignment {
    pub node: NodeIdx,
    pub port: Port,
}

/// Aggregate campaign counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub selected: usize,
    pub done: usize,
    /// Subset of `done` satisfied by packages found at init.
    pub prebuilt: usize,
    pub failed: usize,
    pub skipped: usize,
    pub ignored: usize,
}

impl Counts {
    pub fn terminal(&self) -> usize {
        self.done + self.failed + self.skipped + self.ignored
    }
}

#[derive(Debug, Eq, PartialEq)]
struct ReadyEntry {
    fan_out: usize,
    cost: u64,
    origin: Origin,
    node: NodeIdx,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher fan-out wins, then higher cost, then the
        // lexicographically smaller origin.
        self.fan_out
            .cmp(&other.fan_out)
            .then(self.cost.cmp(&other.cost))
            .then_with(|| other.origin.cmp(&self.origin))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct State {
    states: Vec<PortState>,
    pending_deps: Vec<usize>,
    selected: Vec<bool>,
    ready: BinaryHeap<ReadyEntry>,
    running: HashSet<NodeIdx>,
    running_pkgnames: HashSet<String>,
    /// First reason a port became Failed/Skipped/Ignored.
    reasons: HashMap<NodeIdx, String>,
    counts: Counts,
    shutdown: bool,
}

impl State {
    fn is_drained(&self) -> bool {
        self.running.is_empty() && self.counts.terminal() == self.counts.selected
    }
}

fn push_ready(graph: &Graph, fan_out: &[usize], st: &mut State, node: NodeIdx) {
    let port = graph.node(node);
    st.ready.push(ReadyEntry {
        fan_out: fan_out[node],
        cost: port.build_cost.unwrap_or(0),
        origin: port.origin.clone(),
        node,
    });
}

/// Breadth-first walk marking every reachable dependent Skipped with the
/// first failed/ignored ancestor as reason. Skipped is sticky.
fn skip_dependents(graph: &Graph, st: &mut State, node: NodeIdx, ancestor: &Origin) {
    let mut queue: VecDeque<NodeIdx> = graph.edges().dependents_of(node).iter().copied().collect();
    while let Some(n) = queue.pop_front() {
        if !st.selected[n] {
            continue;
        }
        match st.states[n] {
            PortState::Pending | PortState::Ready => {}
            _ => continue,
        }
        st.states[n] = PortState::Skipped;
        st.counts.skipped += 1;
        st.reasons.entry(n).or_insert_with(|| format!("dependency {ancestor} not available"));
        queue.extend(graph.edges().dependents_of(n).iter().copied());
    }
    // Drop skipped entries that already sat in the ready heap.
    let mut kept = BinaryHeap::with_capacity(st.ready.len());
    let mut entries = std::mem::take(&mut st.ready);
    for entry in entries.drain() {
        if st.states[entry.node] == PortState::Ready {
            kept.push(entry);
        }
    }
    st.ready = kept;
}

/// Owns the DAG and the ready queue; shared by all worker threads.
pub struct Scheduler {
    graph: Graph,
    fan_out: Vec<usize>,
    keep_going: bool,
    state: Mutex<State>,
    work_available: Condvar,
    shutdown_flag: AtomicBool,
}

impl Scheduler {
    /// Builds the initial Ready set for the requested origins (the whole
    /// catalog when `requested` is empty).
    ///
    /// Packages already present in the repository satisfy their port without
    /// a build: the port is marked Done up front. Catalog-ignored ports are
    /// terminal at init and skip their dependents. Two selected ports
    /// resolving to the same package name is a catalog defect and is
    /// rejected here rather than raced at publish time.
    pub fn init(
        graph: Graph,
        requested: &[Origin],
        packages: &PackageStore,
        keep_going: bool,
    ) -> Result<Self> {
        let node_count = graph.node_count();
        let selected_set = if requested.is_empty() {
            (0..node_count).collect::<HashSet<_>>()
        } else {
            graph.build_set(requested)?
        };

        let mut pkgnames: HashMap<String, NodeIdx> = HashMap::new();
        for &node in &selected_set {
            let port = graph.node(node);
            if let Some(&other) = pkgnames.get(&port.pkgname()) {
                return Err(DsynthError::Dag(format!(
                    "{} and {} both produce package {}",
                    graph.node(other).origin,
                    port.origin,
                    port.pkgname()
                )));
            }
            pkgnames.insert(port.pkgname(), node);
        }

        let mut selected = vec![false; node_count];
        let mut pending_deps = vec![0usize; node_count];
        for &node in &selected_set {
            selected[node] = true;
            pending_deps[node] = graph.edges().dep_count(node);
        }

        let mut st = State {
            states: vec![PortState::Pending; node_count],
            pending_deps,
            selected,
            ready: BinaryHeap::new(),
            running: HashSet::new(),
            running_pkgnames: HashSet::new(),
            reasons: HashMap::new(),
            counts: Counts { selected: selected_set.len(), ..Default::default() },
            shutdown: false,
        };
        let fan_out = graph.fan_out();

        // Packages surviving from a prior run count as Done immediately.
        for node in 0..node_count {
            if !st.selected[node] {
                continue;
            }
            let port = graph.node(node);
            if packages.contains(port) {
                debug!("{} satisfied by existing {}", port.origin, port.pkgfile());
                st.states[node] = PortState::Done;
                st.counts.done += 1;
                st.counts.prebuilt += 1;
                for &dependent in graph.edges().dependents_of(node) {
                    if st.selected[dependent] {
                        st.pending_deps[dependent] -= 1;
                    }
                }
            }
        }

        // Catalog-ignored ports never build and poison their dependents.
        for node in 0..node_count {
            if !st.selected[node] || st.states[node] != PortState::Pending {
                continue;
            }
            let port = graph.node(node);
            if let Some(reason) = &port.ignore {
                st.states[node] = PortState::Ignored;
                st.counts.ignored += 1;
                st.reasons.insert(node, reason.clone());
                let origin = port.origin.clone();
                skip_dependents(&graph, &mut st, node, &origin);
            }
        }

        for node in 0..node_count {
            if st.selected[node]
                && st.states[node] == PortState::Pending
                && st.pending_deps[node] == 0
            {
                st.states[node] = PortState::Ready;
                push_ready(&graph, &fan_out, &mut st, node);
            }
        }

        Ok(Self {
            graph,
            fan_out,
            keep_going,
            state: Mutex::new(st),
            work_available: Condvar::new(),
            shutdown_flag: AtomicBool::new(false),
        })
    }

    /// Blocks until a ready port is available and hands it out, or returns
    /// `None` once the DAG is drained or shutdown was requested.
    pub fn acquire(&self, slot: usize) -> Option<Assignment> {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.shutdown {
                return None;
            }
            if let Some(entry) = st.ready.pop() {
                let node = entry.node;
                st.states[node] = PortState::Running;
                st.running.insert(node);
                let port = self.graph.node(node).clone();
                let inserted = st.running_pkgnames.insert(port.pkgname());
                debug_assert!(inserted, "two running ports share pkgname {}", port.pkgname());
                trace!(slot, origin = %port.origin, "dispatch");
                return Some(Assignment { node, port });
            }
            if st.is_drained() {
                // Wake the other waiters so they observe the drain too.
                self.work_available.notify_all();
                return None;
            }
            st = self.work_available.wait(st).unwrap();
        }
    }

    /// Records the outcome of a build attempt.
    ///
    /// `Done` may ready direct dependents; `Failed` transitively skips every
    /// reachable dependent.
    pub fn complete(&self, node: NodeIdx, outcome: Outcome) {
        let mut st = self.state.lock().unwrap();
        let port = self.graph.node(node);
        debug_assert_eq!(st.states[node], PortState::Running);
        st.running.remove(&node);
        st.running_pkgnames.remove(&port.pkgname());

        match outcome {
            Outcome::Done => {
                debug!(origin = %port.origin, "done");
                st.states[node] = PortState::Done;
                st.counts.done += 1;
                for &dependent in self.graph.edges().dependents_of(node) {
                    if !st.selected[dependent] || st.states[dependent] != PortState::Pending {
                        continue;
                    }
                    st.pending_deps[dependent] -= 1;
                    if st.pending_deps[dependent] == 0 {
                        st.states[dependent] = PortState::Ready;
                        push_ready(&self.graph, &self.fan_out, &mut st, dependent);
                    }
                }
            }
            Outcome::Failed(reason) => {
                warn!(origin = %port.origin, %reason, "failed");
                st.states[node] = PortState::Failed;
                st.counts.failed += 1;
                st.reasons.insert(node, reason);
                let origin = port.origin.clone();
                skip_dependents(&self.graph, &mut st, node, &origin);
                if !self.keep_going {
                    st.shutdown = true;
                    self.shutdown_flag.store(true, AtomicOrdering::SeqCst);
                }
            }
        }
        self.work_available.notify_all();
    }

    /// Returns a port to the ready queue untouched.
    ///
    /// Used when a slot fails to mount: the build never started, so another
    /// slot may pick the port up.
    pub fn release(&self, node: NodeIdx) {
        let mut st = self.state.lock().unwrap();
        debug_assert_eq!(st.states[node], PortState::Running);
        let port = self.graph.node(node);
        st.running.remove(&node);
        st.running_pkgnames.remove(&port.pkgname());
        st.states[node] = PortState::Ready;
        push_ready(&self.graph, &self.fan_out, &mut st, node);
        self.work_available.notify_all();
    }

    /// True when every selected port is terminal and no worker is running.
    pub fn drained(&self) -> bool {
        self.state.lock().unwrap().is_drained()
    }

    /// Stop handing out work; blocked and future `acquire` calls return
    /// `None`.
    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, AtomicOrdering::SeqCst);
        let mut st = self.state.lock().unwrap();
        st.shutdown = true;
        self.work_available.notify_all();
    }

    /// Cheap shutdown probe for the build child poll loop.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_flag.load(AtomicOrdering::SeqCst)
    }

    /// The raw flag, polled between child reaps without taking the mutex.
    pub fn shutdown_flag(&self) -> &AtomicBool {
        &self.shutdown_flag
    }

    pub fn counts(&self) -> Counts {
        self.state.lock().unwrap().counts
    }

    /// Final per-port states with the recorded reason, for the summary.
    pub fn snapshot(&self) -> Vec<(Origin, PortState, Option<String>)> {
        let st = self.state.lock().unwrap();
        let mut out: Vec<_> = self
            .graph
            .ports()
            .filter(|(node, _)| st.selected[*node])
            .map(|(node, port)| {
                (port.origin.clone(), st.states[node], st.reasons.get(&node).cloned())
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// State of a single port, if it is part of the campaign.
    pub fn port_state(&self, origin: &Origin) -> Option<PortState> {
        let node = self.graph.lookup(origin)?;
        let st = self.state.lock().unwrap();
        st.selected[node].then(|| st.states[node])
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("counts", &self.counts()).finish()
    }
}
