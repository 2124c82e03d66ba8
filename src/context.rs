// Copyright 2017 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_latch::AsyncLatch;
use glob::Pattern;
use graph::Graph;
use log::{debug, Level};
use rule_graph::RuleGraph;
use task_executor::Executor;
use tokio::sync::Semaphore;
use watch::{Invalidatable, InvalidateCaller, InvalidationWatcher};

use crate::interning::Interns;
use crate::nodes::NodeKey;
use crate::rules::RuleIndex;
use crate::session::Session;
use crate::tasks::Rule;

pub type Context = graph::Context<NodeKey>;

///
/// Options which control the execution of a Scheduler.
///
#[derive(Clone, Debug)]
pub struct ExecutionOptions {
    /// The maximum number of processes to run concurrently.
    pub process_parallelism: usize,
    /// Whether to watch the filesystem for changes to paths that have been read.
    pub watch_filesystem: bool,
    /// Globs (relative to the build root) which signal that the caller should restart when a
    /// matching path changes.
    pub invalidation_globs: Vec<String>,
    pub workunit_level: Level,
    pub log_starting_workunits: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            process_parallelism: 16,
            watch_filesystem: false,
            invalidation_globs: vec![],
            workunit_level: Level::Info,
            log_starting_workunits: false,
        }
    }
}

///
/// The core context shared (via Arc) between the Scheduler and the Context objects of
/// all running Nodes.
///
pub struct Core {
    pub graph: Arc<InvalidatableGraph>,
    pub rule_index: RuleIndex,
    pub executor: Executor,
    pub interns: Interns,
    pub build_root: PathBuf,
    pub watcher: Option<Arc<InvalidationWatcher>>,
    pub process_semaphore: Semaphore,
    pub options: ExecutionOptions,
}

impl Core {
    pub fn new(
        executor: Executor,
        rule_index: RuleIndex,
        build_root: PathBuf,
        options: ExecutionOptions,
    ) -> Result<Core, String> {
        if options.process_parallelism == 0 {
            return Err("The `process_parallelism` option must be at least 1.".to_owned());
        }

        let invalidation_globs = options
            .invalidation_globs
            .iter()
            .map(|glob| {
                Pattern::new(glob).map_err(|e| format!("Invalid invalidation glob `{glob}`: {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let graph = Arc::new(InvalidatableGraph {
            graph: Graph::new(executor.clone()),
            invalidation_globs,
            invalidation_globs_triggered: AsyncLatch::new(),
        });

        // These callbacks depend on the Graph, so the watcher is created after it.
        let watcher = if options.watch_filesystem {
            let w = InvalidationWatcher::new(executor.clone(), build_root.clone())?;
            w.start(&graph)?;
            Some(w)
        } else {
            None
        };

        Ok(Core {
            graph,
            rule_index,
            executor,
            interns: Interns::new(),
            build_root,
            watcher,
            process_semaphore: Semaphore::new(options.process_parallelism),
            options,
        })
    }

    pub fn rule_graph(&self) -> &RuleGraph<Rule> {
        self.rule_index.rule_graph()
    }

    ///
    /// Whether the Core's watcher (if any) is still running.
    ///
    pub fn is_valid(&self) -> bool {
        match self.watcher {
            Some(ref watcher) => watcher.is_valid(),
            None => true,
        }
    }
}

///
/// The Graph, along with the invalidation globs that cause a restart when a path which matches
/// them is invalidated.
///
pub struct InvalidatableGraph {
    graph: Graph<NodeKey>,
    invalidation_globs: Vec<Pattern>,
    invalidation_globs_triggered: AsyncLatch,
}

impl InvalidatableGraph {
    ///
    /// The subset of the given paths which match the invalidation globs.
    ///
    pub fn matching_invalidation_globs(&self, paths: &HashSet<PathBuf>) -> Vec<PathBuf> {
        let mut matched = paths
            .iter()
            .filter(|path| {
                self.invalidation_globs
                    .iter()
                    .any(|pattern| pattern.matches_path(path))
            })
            .cloned()
            .collect::<Vec<_>>();
        matched.sort();
        matched
    }

    pub fn invalidation_globs_triggered(&self) -> &AsyncLatch {
        &self.invalidation_globs_triggered
    }

    fn invalidate_from_predicate<P: Fn(&Path) -> bool>(
        &self,
        caller: InvalidateCaller,
        predicate: P,
    ) -> usize {
        let result = self.graph.invalidate_from_roots(true, |node| {
            node.fs_subject().is_some_and(|path| predicate(path))
        });
        debug!(
            "invalidation ({:?}): cleared {} and dirtied {} nodes",
            caller, result.cleared, result.dirtied
        );
        result.cleared + result.dirtied
    }
}

impl Invalidatable for InvalidatableGraph {
    fn invalidate(&self, paths: &HashSet<PathBuf>, caller: InvalidateCaller) -> usize {
        let matched = self.matching_invalidation_globs(paths);
        if !matched.is_empty() {
            debug!("Invalidation globs matched changed paths: {matched:?}");
            self.invalidation_globs_triggered.trigger();
        }
        self.invalidate_from_predicate(caller, |path| paths.contains(path))
    }

    fn invalidate_all(&self, caller: InvalidateCaller) -> usize {
        if !self.invalidation_globs.is_empty() {
            self.invalidation_globs_triggered.trigger();
        }
        self.invalidate_from_predicate(caller, |_| true)
    }
}

impl Deref for InvalidatableGraph {
    type Target = Graph<NodeKey>;

    fn deref(&self) -> &Graph<NodeKey> {
        &self.graph
    }
}

///
/// The context that every Node runs with: the shared Core, and the Session that requested it.
///
#[derive(Clone)]
pub struct SessionCore {
    pub core: Arc<Core>,
    pub session: Session,
}

impl SessionCore {
    pub fn new(session: Session) -> Self {
        Self {
            core: session.core().clone(),
            session,
        }
    }
}
