// Copyright 2020 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::{Arc, Weak};

use async_latch::AsyncLatch;
use indexmap::IndexSet;
use lazy_static::lazy_static;
use log::debug;
use parking_lot::Mutex;
use workunit_store::{Level, RunId, Workunit, WorkunitStore};

use crate::context::Core;
use crate::nodes::{NodeKey, Root};
use crate::scheduler::Scheduler;
use crate::values::Value;

lazy_static! {
    // A collection of all live Sessions. Completed Sessions (i.e., those for which the Weak
    // reference is dead) are removed from this collection on a best effort basis.
    static ref SESSIONS: Mutex<Vec<Weak<InnerSession>>> = Mutex::default();
}

fn sessions_add(session: &Arc<InnerSession>) {
    let mut sessions = SESSIONS.lock();
    sessions.retain(|weak_session| weak_session.upgrade().is_some());
    sessions.push(Arc::downgrade(session));
}

///
/// Cancel all live Sessions.
///
/// Sessions are generally cancelled one at a time when their callers go away. But if the process
/// receives a signal, it might use this method to attempt to cancel ongoing work before exiting.
///
pub fn sessions_cancel() {
    let sessions = {
        let sessions = SESSIONS.lock();
        sessions
            .iter()
            .filter_map(|weak_session| weak_session.upgrade())
            .collect::<Vec<_>>()
    };
    debug!("Cancelling {} live sessions.", sessions.len());
    for session in sessions {
        session.cancel();
    }
}

///
/// A Session represents a related series of requests on an underlying Scheduler, and is a useful
/// scope for metrics.
///
/// Sessions are expected to be used by multiple threads, so they use internal mutability in order
/// to avoid exposing locks to callers.
///
struct InnerSession {
    // Whether or not this Session has been cancelled. If a Session has been cancelled, all work
    // that it started should attempt to exit in an orderly fashion.
    cancelled: AsyncLatch,
    // The Core that this Session is running on.
    core: Arc<Core>,
    // The total size of the graph at Session-creation time.
    preceding_graph_size: usize,
    // The set of roots that have been requested within this session.
    roots: Mutex<IndexSet<Root>>,
    // A place to store info about workunits.
    workunit_store: WorkunitStore,
    // The unique id for this Session: used for metrics gathering purposes.
    build_id: String,
    // Per-Session values that have been set for this session.
    session_values: Mutex<Value>,
    // An id used to control the visibility of uncacheable rules. Generally this is identical for an
    // entire Session, but in some cases (in particular, a loop of runs) the caller wants to retain
    // the same Session while still observing new values for uncacheable rules.
    run_id: Mutex<RunId>,
}

impl InnerSession {
    fn cancel(&self) {
        self.cancelled.trigger();
    }
}

#[derive(Clone)]
pub struct Session(Arc<InnerSession>);

impl Session {
    pub fn new(
        scheduler: &Scheduler,
        build_id: String,
        session_values: Value,
        cancelled: AsyncLatch,
    ) -> Session {
        let core = scheduler.core.clone();
        let workunit_store = WorkunitStore::new(
            core.options.log_starting_workunits,
            core.options.workunit_level,
        );
        let inner_session = Arc::new(InnerSession {
            cancelled,
            preceding_graph_size: core.graph.len(),
            roots: Mutex::default(),
            workunit_store,
            build_id,
            session_values: Mutex::new(session_values),
            run_id: Mutex::new(core.graph.generate_run_id()),
            core,
        });
        sessions_add(&inner_session);
        Session(inner_session)
    }

    ///
    /// Creates a shallow clone of this Session which is independently cancellable, but which shares
    /// metrics, identity, and state with the original.
    ///
    /// Useful when executing background work "on behalf of a Session" which should not be torn
    /// down when a client disconnects.
    ///
    pub fn isolated_shallow_clone(&self, build_id: String) -> Session {
        let inner_session = Arc::new(InnerSession {
            cancelled: AsyncLatch::new(),
            core: self.0.core.clone(),
            preceding_graph_size: self.0.preceding_graph_size,
            roots: Mutex::new(self.0.roots.lock().clone()),
            workunit_store: self.0.workunit_store.clone(),
            build_id,
            session_values: Mutex::new(self.session_values()),
            run_id: Mutex::new(self.run_id()),
        });
        sessions_add(&inner_session);
        Session(inner_session)
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.0.core
    }

    ///
    /// Cancels this Session: running requests observe the cancellation and exit, and later requests
    /// exit immediately.
    ///
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.poll_triggered()
    }

    ///
    /// Returns only if this Session has been cancelled.
    ///
    pub async fn cancelled(&self) {
        self.0.cancelled.triggered().await;
    }

    pub fn roots_extend(&self, new_roots: impl IntoIterator<Item = Root>) {
        let mut roots = self.0.roots.lock();
        roots.extend(new_roots);
    }

    pub fn root_nodes(&self) -> Vec<NodeKey> {
        let roots = self.0.roots.lock();
        roots.iter().map(|r| r.clone().into()).collect()
    }

    pub fn session_values(&self) -> Value {
        self.0.session_values.lock().clone()
    }

    pub fn preceding_graph_size(&self) -> usize {
        self.0.preceding_graph_size
    }

    pub fn workunit_store(&self) -> WorkunitStore {
        self.0.workunit_store.clone()
    }

    ///
    /// Returns the workunits which have started and completed since the last poll, up to the
    /// given level of verbosity.
    ///
    pub fn poll_workunits(&self, max_log_verbosity: Level) -> (Vec<Workunit>, Vec<Workunit>) {
        self.0.workunit_store.latest_workunits(max_log_verbosity)
    }

    pub fn build_id(&self) -> &String {
        &self.0.build_id
    }

    pub fn run_id(&self) -> RunId {
        let run_id = self.0.run_id.lock();
        *run_id
    }

    pub fn new_run_id(&self) {
        let mut run_id = self.0.run_id.lock();
        *run_id = self.0.core.graph.generate_run_id();
    }
}
