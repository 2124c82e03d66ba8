// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use workunit_store::RunId;

use crate::entry::Generation;
use crate::node::{CompoundNode, EntryId, Node, NodeError};
use crate::Graph;

///
/// State shared by every Context created for one request.
///
struct Request<N: Node> {
    graph: Graph<N>,
    context: N::Context,
    run_id: AtomicU32,
    stats: Stats,
}

///
/// What a running Node has observed of its dependencies.
///
#[derive(Default)]
pub(crate) struct RecordedDeps {
    pub(crate) generations: Vec<(EntryId, Generation)>,
    pub(crate) has_uncacheable_deps: bool,
}

///
/// Records the dependencies of one running Node. Becomes closed when the Node completes, after
/// which no further dependencies may be recorded.
///
#[derive(Clone, Default)]
struct DepRecorder(Arc<Mutex<Option<RecordedDeps>>>);

impl DepRecorder {
    fn open() -> Self {
        DepRecorder(Arc::new(Mutex::new(Some(RecordedDeps::default()))))
    }

    fn record(&self, dep_id: EntryId, generation: Generation, uncacheable: bool) -> bool {
        match self.0.lock().as_mut() {
            Some(deps) => {
                deps.generations.push((dep_id, generation));
                deps.has_uncacheable_deps |= uncacheable;
                true
            }
            None => false,
        }
    }

    fn close(&self) -> Option<RecordedDeps> {
        self.0.lock().take()
    }
}

///
/// The handle through which a running Node requests its dependencies.
///
/// A Context without an EntryId belongs to an external caller: its requests are roots, and are
/// not recorded as anyone's dependencies.
///
#[derive(Clone)]
pub struct Context<N: Node> {
    entry_id: Option<EntryId>,
    deps: DepRecorder,
    request: Arc<Request<N>>,
}

impl<N: Node> Context<N> {
    pub(crate) fn new(graph: Graph<N>, context: N::Context, run_id: RunId) -> Self {
        Self {
            entry_id: None,
            deps: DepRecorder::default(),
            request: Arc::new(Request {
                graph,
                context,
                run_id: AtomicU32::new(run_id.0),
                stats: Stats::default(),
            }),
        }
    }

    ///
    /// Requests the value of the given Node, recording it as a dependency of the Node that owns
    /// this Context.
    ///
    pub async fn get<CN: CompoundNode<N>>(&self, node: CN) -> Result<CN::Item, N::Error> {
        let output = self
            .request
            .graph
            .get_inner(self.entry_id, self, node.into())
            .await?;
        output.try_into().map_err(|_| {
            N::Error::generic(format!(
                "{} produced an output of the wrong type.",
                std::any::type_name::<CN>()
            ))
        })
    }

    pub fn run_id(&self) -> RunId {
        RunId(self.request.run_id.load(Ordering::SeqCst))
    }

    ///
    /// Moves every Context of this request to a fresh RunId.
    ///
    pub fn new_run_id(&self) {
        let run_id = self.request.graph.generate_run_id();
        self.request.run_id.store(run_id.0, Ordering::SeqCst);
    }

    pub fn context(&self) -> &N::Context {
        &self.request.context
    }

    pub fn graph(&self) -> &Graph<N> {
        &self.request.graph
    }

    pub fn stats(&self) -> &Stats {
        &self.request.stats
    }

    pub(crate) fn entry_id(&self) -> Option<EntryId> {
        self.entry_id
    }

    pub(crate) fn dep_record(
        &self,
        dep_id: EntryId,
        generation: Generation,
        uncacheable: bool,
    ) -> Result<(), N::Error> {
        if self.deps.record(dep_id, generation, uncacheable) {
            Ok(())
        } else {
            // Work spawned in the background by a Node can outlive it.
            Err(N::Error::generic(format!(
                "Could not request additional dependencies for {:?}: the Node has completed.",
                self.entry_id
            )))
        }
    }

    ///
    /// Closes the dependency record of the Node which owns this Context.
    ///
    pub(crate) fn complete(&self, node: &N) -> RecordedDeps {
        self.deps
            .close()
            .unwrap_or_else(|| panic!("Node {node} was completed multiple times."))
    }

    ///
    /// A Context for the Node with the given EntryId, sharing this Context's request.
    ///
    pub(crate) fn clone_for(&self, entry_id: EntryId) -> Self {
        Self {
            entry_id: Some(entry_id),
            deps: DepRecorder::open(),
            request: self.request.clone(),
        }
    }
}

impl<N: Node> Deref for Context<N> {
    type Target = N::Context;

    fn deref(&self) -> &Self::Target {
        self.context()
    }
}

///
/// Counts of the work done on behalf of one request.
///
#[derive(Default, Debug)]
pub struct Stats {
    pub ran: AtomicUsize,
    pub cleaning_succeeded: AtomicUsize,
    pub cleaning_failed: AtomicUsize,
}
