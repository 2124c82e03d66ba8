// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

mod context;
mod entry;
mod node;

pub use crate::context::{Context, Stats};
pub use crate::entry::Entry;
use crate::entry::{Generation, NodeResult, RunToken};
pub use crate::node::{CompoundNode, EntryId, Node, NodeError};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::hash::BuildHasherDefault;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{self, AtomicU32};
use std::sync::Arc;

use fnv::FnvHasher;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use petgraph::graph::EdgeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use task_executor::Executor;
use workunit_store::RunId;

type Fnv = BuildHasherDefault<FnvHasher>;

type PGraph<N> = StableDiGraph<Entry<N>, (), u32>;

/// The maximum number of times that a root Node is retried after being invalidated.
const MAX_INVALIDATION_ATTEMPTS: usize = 8;

/// The maximum number of times that a cycle through dirty Nodes is cleared before it is reported.
const MAX_DIRTY_CYCLE_ATTEMPTS: usize = 10;

#[derive(Debug, Eq, PartialEq)]
pub struct InvalidationResult {
    pub cleared: usize,
    pub dirtied: usize,
}

type Nodes<N> = HashMap<N, EntryId, Fnv>;

struct InnerGraph<N: Node> {
    nodes: Nodes<N>,
    pg: PGraph<N>,
    /// A draining Graph refuses to create or request Nodes: Nodes which are already running
    /// continue until they request a dependency.
    draining: bool,
}

impl<N: Node> InnerGraph<N> {
    fn entry_id(&self, node: &N) -> Option<&EntryId> {
        self.nodes.get(node)
    }

    fn entry_for_id(&self, id: EntryId) -> Option<&Entry<N>> {
        self.pg.node_weight(id)
    }

    fn ensure_entry(&mut self, node: N) -> EntryId {
        if let Some(&id) = self.nodes.get(&node) {
            return id;
        }

        let id = self.pg.add_node(Entry::new(node.clone()));
        self.nodes.insert(node, id);
        id
    }

    ///
    /// Returns the path which would form a cycle if an edge were added from src to dst, or None if
    /// no cycle would be created. The path begins and ends with src.
    ///
    /// This optimizes for the case of no cycles: computing the path itself is expensive.
    ///
    fn report_cycle(&self, src_id: EntryId, dst_id: EntryId) -> Option<Vec<Entry<N>>> {
        if src_id == dst_id {
            let entry = self.entry_for_id(src_id)?;
            return Some(vec![entry.clone(), entry.clone()]);
        }
        if !self.detect_cycle(src_id, dst_id) {
            return None;
        }
        let (_cost, path) =
            petgraph::algo::astar(&self.pg, dst_id, |id| id == src_id, |_| 1, |_| 0)?;
        std::iter::once(src_id)
            .chain(path)
            .map(|id| self.entry_for_id(id).cloned())
            .collect()
    }

    ///
    /// True if there is an existing path from dst to src.
    ///
    fn detect_cycle(&self, src_id: EntryId, dst_id: EntryId) -> bool {
        // Search either forward from the dst, or backward from the src, whichever starts narrower.
        let out_from_dst = self.pg.neighbors(dst_id).count();
        let in_to_src = self
            .pg
            .neighbors_directed(src_id, Direction::Incoming)
            .count();
        let (root, needle, direction) = if out_from_dst < in_to_src {
            (dst_id, src_id, Direction::Outgoing)
        } else {
            (src_id, dst_id, Direction::Incoming)
        };

        self.walk(VecDeque::from([root]), direction)
            .any(|id| id == needle)
    }

    ///
    /// Begins a Walk from the given roots, which visits every Node reachable from the roots in the
    /// given direction (in no particular order).
    ///
    fn walk(&self, roots: VecDeque<EntryId>, direction: Direction) -> Walk<'_, N> {
        Walk {
            graph: self,
            direction,
            deque: roots,
            walked: HashSet::default(),
        }
    }

    fn clear(&mut self) {
        for &id in self.nodes.values() {
            if let Some(entry) = self.pg.node_weight(id) {
                entry.clear();
            }
        }
    }

    ///
    /// Clears the values of all "invalidation root" Nodes matching the predicate, and dirties
    /// their transitive dependents.
    ///
    fn invalidate_from_roots<P: Fn(&N) -> bool>(
        &mut self,
        log_dirtied: bool,
        predicate: P,
    ) -> InvalidationResult {
        let root_ids: HashSet<EntryId, Fnv> = self
            .nodes
            .iter()
            .filter_map(|(node, &entry_id)| predicate(node).then_some(entry_id))
            .collect();
        let transitive_ids: Vec<EntryId> = self
            .walk(root_ids.iter().cloned().collect(), Direction::Incoming)
            .filter(|id| !root_ids.contains(id))
            .collect();

        let invalidation_result = InvalidationResult {
            cleared: root_ids.len(),
            dirtied: transitive_ids.len(),
        };

        // Clear roots, and remove their outbound edges.
        for id in &root_ids {
            if let Some(entry) = self.pg.node_weight(*id) {
                entry.clear();
            }
        }
        self.pg.retain_edges(|pg, edge| {
            pg.edge_endpoints(edge)
                .map(|(src, _)| !root_ids.contains(&src))
                .unwrap_or(true)
        });

        // Dirty transitive entries, but keep their outbound edges: edges are only removed once a
        // Node fails to clean and re-runs (see `Graph::clear_deps`).
        for id in &transitive_ids {
            if let Some(entry) = self.pg.node_weight(*id) {
                if log_dirtied {
                    info!("Dirtying {}", entry.node());
                }
                entry.dirty();
            }
        }

        invalidation_result
    }

    fn visualize(&self, roots: &[N], path: &Path, context: &Context<N>) -> io::Result<()> {
        let file = File::create(path)?;
        let mut f = BufWriter::new(file);

        f.write_all(b"digraph plans {\n")?;
        f.write_all(b"  node[colorscheme=set312];\n")?;
        f.write_all(b"  concentrate=true;\n")?;
        f.write_all(b"  rankdir=TB;\n")?;

        let root_entries = roots
            .iter()
            .filter_map(|n| self.entry_id(n))
            .cloned()
            .collect();

        for id in self.walk(root_entries, Direction::Outgoing) {
            let Some(entry) = self.entry_for_id(id) else {
                continue;
            };
            let node_str = escape_dot(&entry.node().to_string());
            let color = match entry.state_name(context) {
                "completed" => "1",
                "failed" => "4",
                "dirty" => "2",
                _ => "9",
            };

            writeln!(f, "  \"{node_str}\" [style=filled, fillcolor={color}];")?;

            for dep_id in self.pg.neighbors(id) {
                if let Some(dep_entry) = self.entry_for_id(dep_id) {
                    let dep_str = escape_dot(&dep_entry.node().to_string());
                    writeln!(f, "    \"{node_str}\" -> \"{dep_str}\"")?;
                }
            }
        }

        f.write_all(b"}\n")?;
        Ok(())
    }
}

fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

///
/// A DAG (enforced on mutation) of Entries, which memoizes the results of Nodes.
///
#[derive(Clone)]
pub struct Graph<N: Node> {
    run_id_generator: Arc<AtomicU32>,
    executor: Executor,
    inner: Arc<Mutex<InnerGraph<N>>>,
}

impl<N: Node> Graph<N> {
    pub fn new(executor: Executor) -> Graph<N> {
        let inner = InnerGraph {
            nodes: HashMap::default(),
            pg: StableDiGraph::default(),
            draining: false,
        };
        Graph {
            run_id_generator: Arc::new(AtomicU32::new(0)),
            executor,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn generate_run_id(&self) -> RunId {
        RunId(self.run_id_generator.fetch_add(1, atomic::Ordering::SeqCst))
    }

    ///
    /// Creates a Context for requests against this Graph, using a new RunId.
    ///
    pub fn context(&self, context: N::Context) -> Context<N> {
        Context::new(self.clone(), context, self.generate_run_id())
    }

    ///
    /// Creates a Context for requests against this Graph, using an existing RunId (generally
    /// one shared with other Contexts for the same Session).
    ///
    pub fn context_with_run_id(&self, context: N::Context, run_id: RunId) -> Context<N> {
        Context::new(self.clone(), context, run_id)
    }

    ///
    /// Requests the given dst Node, recording it as a dependency of `src_id` (if any), and
    /// starting it if it has not already started.
    ///
    async fn get_inner(
        &self,
        src_id: Option<EntryId>,
        context: &Context<N>,
        dst_node: N,
    ) -> NodeResult<N> {
        let (entry, entry_id) = {
            let mut inner = self.inner.lock();
            if inner.draining {
                return Err(N::Error::invalidated());
            }

            let dst_id = inner.ensure_entry(dst_node);
            if let Some(src_id) = src_id {
                if let Some(cycle_path) = Self::cycle_check(&mut inner, src_id, dst_id, context) {
                    let path = cycle_path.iter().map(|e| e.node()).collect::<Vec<_>>();
                    return Err(N::cyclic_error(&path));
                }
                trace!("Adding dependency from {:?} to {:?}", src_id, dst_id);
                inner.pg.update_edge(src_id, dst_id, ());
            }

            let Some(entry) = inner.entry_for_id(dst_id).cloned() else {
                return Err(N::Error::generic(format!(
                    "Entry {dst_id:?} was missing from the Graph."
                )));
            };
            (entry, dst_id)
        };

        let (result, generation, uncacheable) = entry.get_node_result(context, entry_id).await;
        if src_id.is_some() {
            context.dep_record(entry_id, generation, uncacheable)?;
        }
        result
    }

    ///
    /// Checks whether adding an edge from src to dst would create a cycle, and returns the cycle
    /// if so.
    ///
    /// A cycle may pass through dirty Nodes whose edges are stale (for example, from a previous run
    /// in which A depended on B, while now B depends on A). Those Nodes are cleared (which removes
    /// their edges), and the check is retried a bounded number of times.
    ///
    fn cycle_check(
        inner: &mut InnerGraph<N>,
        src_id: EntryId,
        dst_id: EntryId,
        context: &Context<N>,
    ) -> Option<Vec<Entry<N>>> {
        let mut attempts = 0;
        loop {
            let cycle_path = inner.report_cycle(src_id, dst_id)?;

            let dirty_nodes: HashSet<N> = cycle_path
                .iter()
                .filter(|e| !e.is_clean(context))
                .map(|e| e.node().clone())
                .collect();
            if dirty_nodes.is_empty() {
                // A real cycle. Only logged at debug, because the error is rendered to the user.
                debug!(
                    "Detected cycle considering adding edge from {:?} to {:?}; existing path: {:?}",
                    inner.entry_for_id(src_id),
                    inner.entry_for_id(dst_id),
                    cycle_path
                );
                return Some(cycle_path);
            }

            attempts += 1;
            if attempts > MAX_DIRTY_CYCLE_ATTEMPTS {
                warn!(
                    "Couldn't remove cycle containing dirty nodes after {attempts} attempts; nodes in cycle: {cycle_path:?}"
                );
                return Some(cycle_path);
            }
            inner.invalidate_from_roots(false, |node| dirty_nodes.contains(node));
        }
    }

    ///
    /// Requests the given root Node, and returns its result.
    ///
    /// If the Node is invalidated while running, it is retried a bounded number of times.
    ///
    pub async fn create(&self, node: N, context: &Context<N>) -> NodeResult<N> {
        let mut attempts = 0;
        loop {
            match self.get_inner(None, context, node.clone()).await {
                Err(e) if e == N::Error::invalidated() => {
                    attempts += 1;
                    if attempts >= MAX_INVALIDATION_ATTEMPTS || self.inner.lock().draining {
                        return Err(e);
                    }
                    debug!("Root {node} was invalidated while running: retrying ({attempts}).");
                }
                res => return res,
            }
        }
    }

    ///
    /// Returns the result of the given Node if it has completed, and is valid for the given
    /// Context. Never starts the Node.
    ///
    pub fn peek(&self, node: N, context: &Context<N>) -> Option<NodeResult<N>> {
        let inner = self.inner.lock();
        let entry_id = inner.entry_id(&node)?;
        inner.entry_for_id(*entry_id)?.peek(context)
    }

    ///
    /// Re-requests each previously consumed dependency of a dirty Node (in the order they were
    /// first requested), and returns true if none of their Generations have changed.
    ///
    async fn attempt_cleaning(
        &self,
        entry_id: EntryId,
        previous_dep_generations: &[(EntryId, Generation)],
        context: &Context<N>,
    ) -> bool {
        for &(dep_id, previous_generation) in previous_dep_generations {
            let dep_entry = self.inner.lock().entry_for_id(dep_id).cloned();
            let Some(dep_entry) = dep_entry else {
                return false;
            };
            let (result, generation, uncacheable) =
                dep_entry.get_node_result(context, dep_id).await;
            if generation != previous_generation
                || matches!(result, Err(ref e) if *e == N::Error::invalidated())
            {
                trace!("Dependency {:?} of {:?} changed.", dep_id, entry_id);
                return false;
            }
            if context.dep_record(dep_id, generation, uncacheable).is_err() {
                return false;
            }
        }
        true
    }

    ///
    /// Clears the dependency edges of the given EntryId, if the RunToken still matches.
    ///
    fn clear_deps(&self, entry_id: EntryId, run_token: RunToken) {
        let mut inner = self.inner.lock();
        if inner.entry_for_id(entry_id).is_none() {
            return;
        }
        let edges: Vec<EdgeIndex<u32>> = inner
            .pg
            .edges_directed(entry_id, Direction::Outgoing)
            .map(|edge| edge.id())
            .collect();
        trace!(
            "Clearing {} dependencies of {:?} for run {:?}.",
            edges.len(),
            entry_id,
            run_token
        );
        for edge in edges {
            inner.pg.remove_edge(edge);
        }
    }

    ///
    /// Clears the state of all Nodes in the Graph, causing them to re-run.
    ///
    pub fn clear(&self) {
        self.inner.lock().clear()
    }

    ///
    /// Clears the Nodes matching the predicate, and dirties all of their transitive dependents.
    ///
    pub fn invalidate_from_roots<P: Fn(&N) -> bool>(
        &self,
        log_dirtied: bool,
        predicate: P,
    ) -> InvalidationResult {
        self.inner
            .lock()
            .invalidate_from_roots(log_dirtied, predicate)
    }

    ///
    /// Writes a GraphViz rendering of the Nodes reachable from the given roots to the given path.
    ///
    pub fn visualize(&self, roots: &[N], path: &Path, context: &Context<N>) -> io::Result<()> {
        self.inner.lock().visualize(roots, path, context)
    }

    ///
    /// Marks this Graph with the given draining status. Fails if the Graph already has the given
    /// status.
    ///
    pub fn mark_draining(&self, draining: bool) -> Result<(), ()> {
        let mut inner = self.inner.lock();
        if inner.draining == draining {
            Err(())
        } else {
            inner.draining = draining;
            Ok(())
        }
    }

    #[cfg(test)]
    fn entry_state(&self, node: &N, context: &Context<N>) -> Option<&'static str> {
        let inner = self.inner.lock();
        let entry_id = inner.entry_id(node)?;
        Some(inner.entry_for_id(*entry_id)?.state_name(context))
    }

    #[cfg(test)]
    fn dependencies_of(&self, node: &N) -> Vec<N> {
        let inner = self.inner.lock();
        let Some(&entry_id) = inner.entry_id(node) else {
            return vec![];
        };
        inner
            .pg
            .neighbors(entry_id)
            .filter_map(|id| inner.entry_for_id(id).map(|e| e.node().clone()))
            .collect()
    }
}

///
/// The state of a walk through the Graph, which borrows the Graph for its lifetime.
///
struct Walk<'a, N: Node> {
    graph: &'a InnerGraph<N>,
    direction: Direction,
    deque: VecDeque<EntryId>,
    walked: HashSet<EntryId, Fnv>,
}

impl<'a, N: Node + 'a> Iterator for Walk<'a, N> {
    type Item = EntryId;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.deque.pop_front() {
            if !self.walked.insert(id) {
                continue;
            }

            self.deque
                .extend(self.graph.pg.neighbors_directed(id, self.direction));
            return Some(id);
        }

        None
    }
}
