// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future;
use graph::CompoundNode;
use internment::Intern;
use rule_graph::DependencyKey;
use workunit_store::{Metric, RunningWorkunit};

use super::{select, NodeKey, NodeResult, Params};
use crate::context::Context;
use crate::tasks::{self, Rule};
use crate::values::{throw, throw_kind, Failure, ThrowKind, TypeId, Value};

#[derive(Derivative, Clone)]
#[derivative(Eq, PartialEq, Hash)]
pub struct Task {
    pub params: Params,
    pub(super) task: Intern<tasks::Task>,
    // The Params and the Task struct are sufficient to uniquely identify it.
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    pub(super) entry: Intern<rule_graph::EntryWithDeps<Rule>>,
}

impl Task {
    pub(super) async fn run_node(
        self,
        context: Context,
        workunit: &mut RunningWorkunit,
    ) -> NodeResult<Value> {
        let params = self.params;
        let deps = {
            // While waiting for dependencies, mark ourselves blocking.
            let _blocking_token = workunit.blocking();
            let edges = &context
                .core
                .rule_graph()
                .edges_for_inner(&rule_graph::Entry::WithDeps(self.entry))
                .expect("edges for task exist.");
            future::try_join_all(
                self.task
                    .clause
                    .iter()
                    .map(|dependency_key| {
                        let entry = edges.entry_for(dependency_key).unwrap_or_else(|| {
                            panic!(
                                "{:?} did not declare a dependency on {dependency_key:?}",
                                self.task
                            )
                        });
                        select(context.clone(), params.clone(), entry.clone())
                    })
                    .collect::<Vec<_>>(),
            )
            .await?
        };

        workunit.increment_counter(Metric::RuleExecutions, 1);

        let task_context = TaskContext {
            context: context.clone(),
            params,
            task: self.task,
            entry: self.entry,
            invalidated: Arc::new(AtomicBool::new(false)),
        };
        let invalidated = task_context.invalidated.clone();

        let result = self.task.func.call(task_context, deps).await;

        // An invalidated dependency cannot be caught by the rule body: if any Get observed one,
        // the body's own result is discarded.
        if invalidated.load(Ordering::SeqCst) {
            return Err(Failure::Invalidated);
        }

        let result_val = result?;
        if !self.task.products().contains(&result_val.type_id()) {
            return Err(throw_kind(
                ThrowKind::IncorrectProduct,
                format!(
                    "{:?} returned a result value that did not satisfy its constraints: {:?}",
                    self.task.func, result_val
                ),
            ));
        }

        Ok(result_val)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task {{ func: {}, params: {}, product: {}, cacheable: {} }}",
            self.task.func, self.params, self.task.product, self.task.cacheable,
        )
    }
}

impl CompoundNode<NodeKey> for Task {
    type Item = Value;
}

impl From<Task> for NodeKey {
    fn from(n: Task) -> Self {
        NodeKey::Task(Box::new(n))
    }
}

///
/// A request from a running rule body for the `output` type, computed with the given `inputs` as
/// additional params.
///
/// A Get must have been declared (as `add_get(output, input_types)`) by the rule that issues it.
///
#[derive(Clone, Debug)]
pub struct Get {
    pub output: TypeId,
    pub inputs: Vec<Value>,
}

impl Get {
    pub fn new(output: TypeId, inputs: Vec<Value>) -> Get {
        Get { output, inputs }
    }
}

impl fmt::Display for Get {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let input_types = self
            .inputs
            .iter()
            .map(|v| v.type_id().to_string())
            .collect::<Vec<_>>();
        write!(f, "Get({}, [{}])", self.output, input_types.join(", "))
    }
}

///
/// The handle that a running rule body uses to request its declared Gets.
///
#[derive(Clone)]
pub struct TaskContext {
    context: Context,
    params: Params,
    task: Intern<tasks::Task>,
    entry: Intern<rule_graph::EntryWithDeps<Rule>>,
    invalidated: Arc<AtomicBool>,
}

impl TaskContext {
    ///
    /// Requests the value for the given Get, and suspends until it has completed.
    ///
    /// A `Failure::Throw` may be handled by the caller. `Failure::Invalidated` is also returned,
    /// but the outcome of the rule is then `Invalidated` regardless of what the body returns.
    ///
    pub async fn get(&self, get: Get) -> NodeResult<Value> {
        let result = self.get_inner(get).await;
        if let Err(Failure::Invalidated) = result {
            self.invalidated.store(true, Ordering::SeqCst);
        }
        result
    }

    ///
    /// Requests all of the given Gets concurrently, returning their values in request order, or
    /// the first failure.
    ///
    pub async fn multi_get(&self, gets: Vec<Get>) -> NodeResult<Vec<Value>> {
        future::try_join_all(gets.into_iter().map(|get| self.get(get))).await
    }

    ///
    /// The id of the current run of the Session that this rule is running in.
    ///
    pub fn run_id(&self) -> u32 {
        self.context.run_id().0
    }

    async fn get_inner(&self, get: Get) -> NodeResult<Value> {
        let interns = &self.context.core.interns;
        let keys = get
            .inputs
            .iter()
            .map(|value| interns.key_insert(value.clone()))
            .collect::<Vec<_>>();
        let get_params = Params::new(keys.clone()).map_err(throw)?;
        let dependency_key = DependencyKey::new_with_params(get.output, get_params.type_ids());

        let edges = self
            .context
            .core
            .rule_graph()
            .edges_for_inner(&rule_graph::Entry::WithDeps(self.entry))
            .ok_or_else(|| throw(format!("No edges for task {:?} exist!", self.task.func)))?;

        // Find the entry for the Get.
        let entry = edges.entry_for(&dependency_key).cloned().ok_or_else(|| {
            throw(format!(
                "{get} was not declared by {:?}: declared Gets are [{}].",
                self.task.func,
                self.task
                    .gets
                    .iter()
                    .map(|g| g.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            ))
        })?;

        let mut params = self.params.clone();
        params.extend(keys);
        select(self.context.clone(), params, entry).await
    }
}
