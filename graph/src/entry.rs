// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::mem;
use std::sync::atomic;
use std::sync::Arc;

use async_value::{AsyncValue, AsyncValueReceiver, AsyncValueSender};
use log::trace;
use parking_lot::Mutex;
use workunit_store::RunId;

use crate::context::Context;
use crate::node::{EntryId, Node, NodeError};

///
/// A token that uniquely identifies one run of a Node in the Graph. Each run of a Node has a
/// different RunToken associated with it. When a run completes, if the current RunToken of its
/// Node no longer matches the RunToken of the spawned work (because the Node was cleared or
/// restarted), the work is discarded.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct RunToken(u32);

impl RunToken {
    fn initial() -> RunToken {
        RunToken(0)
    }

    fn next(self) -> RunToken {
        RunToken(self.0 + 1)
    }
}

///
/// A token associated with a Node that is incremented whenever its output value has changed.
/// Dependents record the Generation of each dependency they consumed, which allows a dirty
/// dependent to be "cleaned" (rather than re-run) if none of its dependencies changed.
///
/// Unlike the RunToken (which is incremented whenever a Node re-runs), the Generation is only
/// incremented when the output of a Node differs from its previous output.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Generation(u32);

impl Generation {
    fn initial() -> Generation {
        Generation(0)
    }

    fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

///
/// Interrupts delivered to a running Node via its AsyncValue.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum NodeInterrupt {
    /// A dependency changed: the Node should restart.
    Dirtied,
}

pub(crate) type NodeResult<N> = Result<<N as Node>::Item, <N as Node>::Error>;

///
/// The output of a Node as observed by a requester: its result, its Generation, and whether the
/// result is only valid for the current run.
///
pub(crate) type NodeOutput<N> = (NodeResult<N>, Generation, bool);

///
/// The memoized result of a completed Node, tagged with whether it may be reused.
///
#[derive(Debug)]
pub(crate) enum EntryResult<N: Node> {
    /// A value that can be reused until it is invalidated.
    Clean(NodeResult<N>),
    /// A value that was invalidated. It may only be reused after its dependencies have been
    /// checked for changes.
    Dirty(NodeResult<N>),
    /// A value from an uncacheable Node, which may only be reused within the same run.
    Uncacheable(NodeResult<N>, RunId),
    /// A value that depended on uncacheable Nodes. It may be reused within the same run, and
    /// cleaned in a later run.
    UncacheableDependencies(NodeResult<N>, RunId),
}

impl<N: Node> EntryResult<N> {
    fn new(
        result: NodeResult<N>,
        context: &Context<N>,
        dirty: bool,
        cacheable: bool,
        has_uncacheable_deps: bool,
    ) -> EntryResult<N> {
        if dirty {
            EntryResult::Dirty(result)
        } else if !cacheable {
            EntryResult::Uncacheable(result, context.run_id())
        } else if has_uncacheable_deps {
            EntryResult::UncacheableDependencies(result, context.run_id())
        } else {
            EntryResult::Clean(result)
        }
    }

    fn is_clean(&self, context: &Context<N>) -> bool {
        match self {
            EntryResult::Clean(..) => true,
            EntryResult::Uncacheable(_, run_id)
            | EntryResult::UncacheableDependencies(_, run_id) => context.run_id() == *run_id,
            EntryResult::Dirty(..) => false,
        }
    }

    /// True if dependents of this result may only reuse their own results within this run.
    fn is_run_scoped(&self) -> bool {
        !matches!(self, EntryResult::Clean(..))
    }

    fn can_be_cleaned(&self) -> bool {
        !matches!(self, EntryResult::Uncacheable(..))
    }

    fn dirty(&mut self) {
        match self {
            EntryResult::Clean(result)
            | EntryResult::UncacheableDependencies(result, _)
            | EntryResult::Uncacheable(result, _) => {
                *self = EntryResult::Dirty(result.clone());
            }
            EntryResult::Dirty(..) => {}
        }
    }

    fn result(&self) -> &NodeResult<N> {
        match self {
            EntryResult::Clean(result)
            | EntryResult::Dirty(result)
            | EntryResult::Uncacheable(result, _)
            | EntryResult::UncacheableDependencies(result, _) => result,
        }
    }

    fn into_result(self) -> NodeResult<N> {
        match self {
            EntryResult::Clean(result)
            | EntryResult::Dirty(result)
            | EntryResult::Uncacheable(result, _)
            | EntryResult::UncacheableDependencies(result, _) => result,
        }
    }
}

pub(crate) enum EntryState<N: Node> {
    // A Node that has either been explicitly cleared, or has not yet started Running. The
    // previous_result is not a valid value for this Entry: it is preserved only to decide whether
    // the Generation should change the next time the Node completes.
    NotStarted {
        run_token: RunToken,
        generation: Generation,
        previous_result: Option<EntryResult<N>>,
    },
    // A Node that is running (or cleaning, if `is_cleaning`). A non-restartable Node that is
    // dirtied while running completes as dirty.
    Running {
        run_token: RunToken,
        generation: Generation,
        pending_value: AsyncValue<NodeOutput<N>, NodeInterrupt>,
        previous_result: Option<EntryResult<N>>,
        is_cleaning: bool,
        dirty: bool,
    },
    // A Node that has completed, and then possibly been marked dirty. A dirty Node stays in this
    // state until it is next requested.
    Completed {
        run_token: RunToken,
        generation: Generation,
        result: EntryResult<N>,
        dep_generations: Vec<(EntryId, Generation)>,
    },
}

impl<N: Node> EntryState<N> {
    fn initial() -> EntryState<N> {
        EntryState::NotStarted {
            run_token: RunToken::initial(),
            generation: Generation::initial(),
            previous_result: None,
        }
    }
}

///
/// An Entry and its adjacencies.
///
#[derive(Clone)]
pub struct Entry<N: Node> {
    node: Arc<N>,
    state: Arc<Mutex<EntryState<N>>>,
}

impl<N: Node> Entry<N> {
    ///
    /// Creates an Entry without starting it. The EntryId of an Entry is not known until it has
    /// been added to the Graph, and the EntryId is required in order to run it.
    ///
    pub(crate) fn new(node: N) -> Entry<N> {
        Entry {
            node: Arc::new(node),
            state: Arc::new(Mutex::new(EntryState::initial())),
        }
    }

    pub fn node(&self) -> &N {
        &self.node
    }

    ///
    /// If the Node has completed, and its result is valid for the given Context, returns a clone
    /// of its result.
    ///
    pub fn peek(&self, context: &Context<N>) -> Option<NodeResult<N>> {
        match *self.state.lock() {
            EntryState::Completed { ref result, .. } if result.is_clean(context) => {
                Some(result.result().clone())
            }
            _ => None,
        }
    }

    pub(crate) fn is_clean(&self, context: &Context<N>) -> bool {
        match *self.state.lock() {
            EntryState::NotStarted {
                ref previous_result,
                ..
            } => previous_result
                .as_ref()
                .map(|r| r.is_clean(context))
                .unwrap_or(true),
            EntryState::Running { dirty, .. } => !dirty,
            EntryState::Completed { ref result, .. } => result.is_clean(context),
        }
    }

    /// A short name for the state of this Entry, for rendering.
    pub(crate) fn state_name(&self, context: &Context<N>) -> &'static str {
        match *self.state.lock() {
            EntryState::NotStarted { .. } => "not_started",
            EntryState::Running { .. } => "running",
            EntryState::Completed { ref result, .. } => {
                match (result.result(), result.is_clean(context)) {
                    (_, false) => "dirty",
                    (Ok(_), true) => "completed",
                    (Err(_), true) => "failed",
                }
            }
        }
    }

    ///
    /// Spawns the execution of the Node on the Graph's Executor. The spawned task runs outside of
    /// any lock, and calls back into the Entry to store its result.
    ///
    /// If `previous_dep_generations` is set, the task first attempts to "clean" the Entry by
    /// checking whether any dependency has changed since the previous run, and only re-runs the
    /// Node if one has.
    ///
    fn spawn_node_execution(
        context_factory: &Context<N>,
        entry: Entry<N>,
        entry_id: EntryId,
        run_token: RunToken,
        generation: Generation,
        previous_dep_generations: Option<Vec<(EntryId, Generation)>>,
        previous_result: Option<EntryResult<N>>,
    ) -> (EntryState<N>, AsyncValueReceiver<NodeOutput<N>>) {
        let run_token = run_token.next();
        let is_cleaning = previous_dep_generations.is_some();
        let (pending_value, mut sender, receiver) = AsyncValue::new();

        let context_factory = context_factory.clone();
        let executor = context_factory.graph().executor().clone();
        let _join = executor.native_spawn(async move {
            let mut run_token = run_token;
            let mut previous_dep_generations = previous_dep_generations;
            loop {
                let context = context_factory.clone_for(entry_id);
                let run = Self::run_or_clean(
                    entry.clone(),
                    context,
                    entry_id,
                    run_token,
                    previous_dep_generations.take(),
                );
                let outcome = tokio::select! {
                    interrupt = sender.interrupted() => Err(interrupt),
                    completed = run => Ok(completed),
                };

                match outcome {
                    Ok((result, context)) => {
                        entry.complete(&context, run_token, sender, result);
                        return;
                    }
                    Err(Some(NodeInterrupt::Dirtied)) => {
                        if let Some(next_run_token) = entry.restart(run_token) {
                            trace!("Restarting {} after a dependency changed.", entry.node());
                            run_token = next_run_token;
                            continue;
                        }
                        return;
                    }
                    Err(None) => {
                        // Every requester has gone away, or the Entry was cleared.
                        entry.cancel(run_token);
                        return;
                    }
                }
            }
        });

        (
            EntryState::Running {
                run_token,
                generation,
                pending_value,
                previous_result,
                is_cleaning,
                dirty: false,
            },
            receiver,
        )
    }

    ///
    /// Either cleans the Node (returning `None` for its result, to indicate that the previous
    /// result should be reused) or runs it. Returns the Context that recorded the dependencies
    /// of whichever of the two happened.
    ///
    async fn run_or_clean(
        entry: Entry<N>,
        context: Context<N>,
        entry_id: EntryId,
        run_token: RunToken,
        previous_dep_generations: Option<Vec<(EntryId, Generation)>>,
    ) -> (Option<NodeResult<N>>, Context<N>) {
        if let Some(previous_dep_generations) = previous_dep_generations {
            let cleaned = context
                .graph()
                .attempt_cleaning(entry_id, &previous_dep_generations, &context)
                .await;
            if cleaned {
                context
                    .stats()
                    .cleaning_succeeded
                    .fetch_add(1, atomic::Ordering::SeqCst);
                trace!("Cleaned {}.", entry.node());
                return (None, context);
            }
            context
                .stats()
                .cleaning_failed
                .fetch_add(1, atomic::Ordering::SeqCst);
            trace!("Failed to clean {}: re-running.", entry.node());
        }

        // A fresh Context, since dependencies recorded while cleaning must not be kept.
        let context = context.clone_for(entry_id);
        context.graph().clear_deps(entry_id, run_token);
        context.stats().ran.fetch_add(1, atomic::Ordering::SeqCst);
        let result = entry.node().clone().run(context.clone()).await;
        (Some(result), context)
    }

    ///
    /// Returns the output of the Node, starting (or cleaning) it if necessary, or attaching to an
    /// existing run if one is in progress.
    ///
    pub(crate) async fn get_node_result(
        &self,
        context: &Context<N>,
        entry_id: EntryId,
    ) -> NodeOutput<N> {
        let receiver = {
            let mut state = self.state.lock();

            // Fast path: a clean completed result.
            if let EntryState::Completed {
                ref result,
                generation,
                ..
            } = *state
            {
                if result.is_clean(context) {
                    return (result.result().clone(), generation, result.is_run_scoped());
                }
            }

            let (next_state, receiver) = match mem::replace(&mut *state, EntryState::initial()) {
                EntryState::NotStarted {
                    run_token,
                    generation,
                    previous_result,
                } => Self::spawn_node_execution(
                    context,
                    self.clone(),
                    entry_id,
                    run_token,
                    generation,
                    None,
                    previous_result,
                ),
                EntryState::Running {
                    run_token,
                    generation,
                    pending_value,
                    previous_result,
                    is_cleaning,
                    dirty,
                } => {
                    if let Some(receiver) = pending_value.receiver() {
                        (
                            EntryState::Running {
                                run_token,
                                generation,
                                pending_value,
                                previous_result,
                                is_cleaning,
                                dirty,
                            },
                            receiver,
                        )
                    } else {
                        // The previous run was abandoned by all of its requesters, but has not
                        // yet noticed: start over.
                        Self::spawn_node_execution(
                            context,
                            self.clone(),
                            entry_id,
                            run_token,
                            generation,
                            None,
                            previous_result,
                        )
                    }
                }
                EntryState::Completed {
                    run_token,
                    generation,
                    result,
                    dep_generations,
                } => {
                    trace!(
                        "Re-validating {}: it was dirty or from a previous run.",
                        self.node
                    );
                    let previous_dep_generations = if result.can_be_cleaned() {
                        Some(dep_generations)
                    } else {
                        None
                    };
                    Self::spawn_node_execution(
                        context,
                        self.clone(),
                        entry_id,
                        run_token,
                        generation,
                        previous_dep_generations,
                        Some(result),
                    )
                }
            };
            *state = next_state;
            receiver
        };

        // A missing value means that the run was cancelled or the Entry was cleared.
        receiver
            .recv()
            .await
            .unwrap_or_else(|| (Err(N::Error::invalidated()), Generation::initial(), true))
    }

    ///
    /// Stores the result of a run (or the outcome of cleaning, if `result` is None), unless the
    /// run has been superseded.
    ///
    fn complete(
        &self,
        context: &Context<N>,
        result_run_token: RunToken,
        sender: AsyncValueSender<NodeOutput<N>, NodeInterrupt>,
        result: Option<NodeResult<N>>,
    ) {
        let mut state = self.state.lock();

        let (run_token, generation, previous_result, dirty) =
            match mem::replace(&mut *state, EntryState::initial()) {
                EntryState::Running {
                    run_token,
                    generation,
                    previous_result,
                    dirty,
                    ..
                } if run_token == result_run_token => {
                    (run_token, generation, previous_result, dirty)
                }
                other => {
                    trace!(
                        "Not completing {}: its run was superseded.",
                        self.node
                    );
                    *state = other;
                    return;
                }
            };

        let dep_state = context.complete(&self.node);

        let (result, generation) = match (result, previous_result) {
            (None, Some(previous_result)) => {
                // Cleaned: the previous value is still valid.
                (previous_result.into_result(), generation)
            }
            (None, None) => (
                Err(N::Error::generic(format!(
                    "{} was cleaned without a previous result.",
                    self.node
                ))),
                generation.next(),
            ),
            (Some(Err(e)), previous_result) if e == N::Error::invalidated() => {
                // Invalidation is never memoized: dropping the sender notifies waiters.
                *state = EntryState::NotStarted {
                    run_token,
                    generation,
                    previous_result,
                };
                return;
            }
            (Some(result), previous_result) => {
                let unchanged = previous_result
                    .as_ref()
                    .map(|previous| previous.result() == &result)
                    .unwrap_or(false);
                let generation = if unchanged {
                    generation
                } else {
                    generation.next()
                };
                (result, generation)
            }
        };

        let cacheable = self.node.cacheable()
            && result
                .as_ref()
                .map(|item| self.node.cacheable_item(item))
                .unwrap_or(true);
        let entry_result = EntryResult::new(
            result.clone(),
            context,
            dirty,
            cacheable,
            dep_state.has_uncacheable_deps,
        );

        sender.send((result, generation, entry_result.is_run_scoped()));
        *state = EntryState::Completed {
            run_token,
            generation,
            result: entry_result,
            dep_generations: dep_state.generations,
        };
    }

    ///
    /// Moves a running Entry to a new RunToken, so that it may be re-run without losing its
    /// waiters. Returns None if the given run has been superseded.
    ///
    fn restart(&self, current_run_token: RunToken) -> Option<RunToken> {
        match *self.state.lock() {
            EntryState::Running {
                ref mut run_token,
                ref mut is_cleaning,
                ref mut dirty,
                ..
            } if *run_token == current_run_token => {
                *run_token = run_token.next();
                *is_cleaning = false;
                *dirty = false;
                Some(*run_token)
            }
            _ => None,
        }
    }

    ///
    /// Returns a running Entry to NotStarted after its run was abandoned.
    ///
    fn cancel(&self, current_run_token: RunToken) {
        let mut state = self.state.lock();
        *state = match mem::replace(&mut *state, EntryState::initial()) {
            EntryState::Running {
                run_token,
                generation,
                previous_result,
                ..
            } if run_token == current_run_token => {
                trace!("Canceled {}: no requesters remain.", self.node);
                EntryState::NotStarted {
                    run_token,
                    generation,
                    previous_result,
                }
            }
            other => other,
        };
    }

    ///
    /// Clears the state of this Node, forcing it to be recomputed. A running computation is
    /// abandoned, and its waiters observe `Invalidated`.
    ///
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        let (run_token, generation, mut previous_result) =
            match mem::replace(&mut *state, EntryState::initial()) {
                EntryState::NotStarted {
                    run_token,
                    generation,
                    previous_result,
                }
                | EntryState::Running {
                    run_token,
                    generation,
                    previous_result,
                    ..
                } => (run_token, generation, previous_result),
                EntryState::Completed {
                    run_token,
                    generation,
                    result,
                    ..
                } => (run_token, generation, Some(result)),
            };

        trace!("Clearing {}.", self.node);
        if let Some(previous_result) = previous_result.as_mut() {
            previous_result.dirty();
        }

        // Bumping the RunToken causes any work that is still running to be discarded.
        *state = EntryState::NotStarted {
            run_token: run_token.next(),
            generation,
            previous_result,
        };
    }

    ///
    /// Marks this Entry as dirty: a completed result will be re-validated before it is reused,
    /// and a running restartable Node is restarted.
    ///
    pub(crate) fn dirty(&self) {
        let mut state = self.state.lock();
        match *state {
            EntryState::Completed { ref mut result, .. } => result.dirty(),
            EntryState::Running {
                ref mut pending_value,
                ref mut dirty,
                ..
            } => {
                // If the run completes before it observes the interrupt, it completes as dirty.
                *dirty = true;
                if self.node.restartable() {
                    let _ = pending_value.try_interrupt(NodeInterrupt::Dirtied);
                }
            }
            EntryState::NotStarted { .. } => {}
        }
    }
}

impl<N: Node> std::fmt::Debug for Entry<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Entry({})", self.node)
    }
}
