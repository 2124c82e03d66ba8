// Copyright 2017 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, FutureExt};
use log::{debug, info};
use rule_graph::DependencyKey;
use watch::{Invalidatable, InvalidateCaller};
use workunit_store::{scope_task_workunit_store_handle, WorkunitStoreHandle};

use crate::context::{Context, Core, SessionCore};
use crate::nodes::{NodeKey, NodeResult};
use crate::session::Session;
use crate::values::{Params, TypeId, Value};

pub use crate::nodes::Root;

///
/// A set of Root requests, and the options that apply to their execution.
///
#[derive(Default)]
pub struct ExecutionRequest {
    // Set of roots for an execution, in the order they were declared.
    pub roots: Vec<Root>,
    // An optional timeout for the entire request, after which it exits with
    // `ExecutionTermination::PollTimeout`.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new() -> ExecutionRequest {
        Self::default()
    }

    ///
    /// Roots are limited to `Select`, which is known to produce a Value. This method
    /// exists to satisfy Graph APIs which need instances of the NodeKey enum.
    ///
    fn root_nodes(&self) -> Vec<NodeKey> {
        self.roots.iter().map(|r| r.clone().into()).collect()
    }
}

///
/// The reason that an execution exited before all of its roots had completed.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecutionTermination {
    // Raised as a vanilla keyboard interrupt when the Session is cancelled.
    KeyboardInterrupt,
    // An execution did not complete within its timeout.
    PollTimeout,
    // No clear reason: possibly a panic on a background thread.
    Fatal(String),
}

///
/// Represents the state of an execution of a Graph.
///
pub struct Scheduler {
    pub core: Arc<Core>,
}

impl Scheduler {
    pub fn new(core: Core) -> Scheduler {
        Scheduler {
            core: Arc::new(core),
        }
    }

    ///
    /// Invalidate the invalidation roots represented by the given Paths (relative to the build
    /// root), along with their parent directories.
    ///
    pub fn invalidate_files(&self, paths: &HashSet<PathBuf>) -> usize {
        let paths_with_parents = paths
            .iter()
            .flat_map(|path| path.parent().map(Path::to_path_buf).into_iter())
            .chain(paths.iter().cloned())
            .collect::<HashSet<_>>();
        self.core
            .graph
            .invalidate(&paths_with_parents, InvalidateCaller::External)
    }

    ///
    /// Invalidate all filesystem dependencies in the graph.
    ///
    pub fn invalidate_all_files(&self) -> usize {
        self.core.graph.invalidate_all(InvalidateCaller::External)
    }

    ///
    /// Clear all entries in the graph.
    ///
    pub fn invalidate_all(&self) {
        self.core.graph.clear();
    }

    ///
    /// Returns the given paths which match the invalidation globs.
    ///
    pub fn matching_invalidation_globs(&self, paths: &HashSet<PathBuf>) -> Vec<PathBuf> {
        self.core.graph.matching_invalidation_globs(paths)
    }

    ///
    /// Returns true if a path matching the invalidation globs has been invalidated since this
    /// Scheduler was created.
    ///
    pub fn invalidation_globs_triggered(&self) -> bool {
        self.core
            .graph
            .invalidation_globs_triggered()
            .poll_triggered()
    }

    ///
    /// Renders the Nodes reachable from the roots of the given Session in GraphViz DOT format to
    /// the given path.
    ///
    pub fn visualize(&self, session: &Session, path: &Path) -> io::Result<()> {
        let context = self.context(session);
        self.core
            .graph
            .visualize(&session.root_nodes(), path, &context)
    }

    ///
    /// Renders the solved RuleGraph in GraphViz DOT format to the given path.
    ///
    pub fn visualize_rule_graph(&self, path: &Path) -> io::Result<()> {
        let mut f = std::fs::File::create(path)?;
        self.core.rule_graph().visualize(&mut f)
    }

    pub fn add_root_select(
        &self,
        request: &mut ExecutionRequest,
        params: Vec<Value>,
        product: TypeId,
    ) -> Result<(), String> {
        let keys = params
            .into_iter()
            .map(|value| self.core.interns.key_insert(value))
            .collect::<Vec<_>>();
        let params = Params::new(keys)?;
        let (_, edges) = self
            .core
            .rule_graph()
            .find_root(params.type_ids(), product)?;
        request
            .roots
            .push(Root::new(params, &DependencyKey::new(product), &edges)?);
        Ok(())
    }

    ///
    /// Return the metrics that were recorded for the given Session, along with the counts of Nodes.
    ///
    pub fn metrics(&self, session: &Session) -> HashMap<&'static str, u64> {
        let mut m = session.workunit_store().get_metrics();
        m.insert(
            "preceding_graph_size",
            session.preceding_graph_size() as u64,
        );
        m.insert("resulting_graph_size", self.core.graph.len() as u64);
        m
    }

    pub fn graph_len(&self) -> usize {
        self.core.graph.len()
    }

    fn context(&self, session: &Session) -> Context {
        self.core
            .graph
            .context_with_run_id(SessionCore::new(session.clone()), session.run_id())
    }

    ///
    /// Compute the results for roots in the given request.
    ///
    async fn execute_helper(
        &self,
        request: &ExecutionRequest,
        session: &Session,
    ) -> Vec<NodeResult<Value>> {
        let context = self.context(session);
        let roots = request.root_nodes();
        debug!("Launching {} roots.", roots.len());
        future::join_all(
            roots
                .into_iter()
                .map(|root| {
                    let context = context.clone();
                    let graph = self.core.graph.clone();
                    async move {
                        let res = graph.create(root.clone(), &context).await;
                        debug!("Root {root} completed.");
                        res.map(|output| {
                            Value::try_from(output)
                                .unwrap_or_else(|_| panic!("A Root produced a non-Value: {root}"))
                        })
                    }
                })
                .collect::<Vec<_>>(),
        )
        .await
    }

    ///
    /// Compute the results for roots in the given request, exiting early if the Session is
    /// cancelled or the request's timeout elapses.
    ///
    pub async fn run(
        &self,
        request: &ExecutionRequest,
        session: &Session,
    ) -> Result<Vec<NodeResult<Value>>, ExecutionTermination> {
        // Record the roots of this request in the Session.
        session.roots_extend(request.roots.iter().cloned());

        let workunit_store_handle = WorkunitStoreHandle {
            store: session.workunit_store(),
            parent_id: None,
        };
        let execution =
            scope_task_workunit_store_handle(Some(workunit_store_handle), async move {
                self.execute_helper(request, session).await
            })
            .boxed();
        let timeout = match request.timeout {
            Some(timeout) => tokio::time::sleep(timeout).boxed(),
            None => future::pending::<()>().boxed(),
        };

        // Cancellation is polled first, so that a cancelled Session never observes results.
        tokio::select! {
            biased;

            _ = session.cancelled() => {
                // Dropping the execution drops our interest in its Nodes.
                info!("Execution was cancelled.");
                Err(ExecutionTermination::KeyboardInterrupt)
            }
            _ = timeout => Err(ExecutionTermination::PollTimeout),
            results = execution => Ok(results),
        }
    }

    ///
    /// Compute the results for roots in the given request, blocking the calling thread.
    ///
    /// Must not be called from within the Executor's Runtime.
    ///
    pub fn execute(
        &self,
        request: &ExecutionRequest,
        session: &Session,
    ) -> Result<Vec<NodeResult<Value>>, ExecutionTermination> {
        if !self.core.is_valid() {
            return Err(ExecutionTermination::Fatal(
                "The filesystem watcher exited, and the Scheduler must be restarted.".to_owned(),
            ));
        }
        self.core.executor.block_on(self.run(request, session))
    }

    ///
    /// Refuses new work, and waits up to `timeout` for running work to complete.
    ///
    pub fn shutdown(&self, timeout: Duration) {
        if self.core.graph.mark_draining(true).is_err() {
            debug!("The Scheduler was already shutting down.");
        }
        self.core.executor.shutdown(timeout);
    }
}
