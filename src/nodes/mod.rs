// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use internment::Intern;
use rule_graph::DependencyKey;
use workunit_store::{in_workunit, Level};

use crate::context::{Context, SessionCore};
use crate::fs::{DirectoryListing, FileContent};
use crate::process::ProcessResult;
use crate::tasks::Rule;
use crate::values::{throw, throw_kind, Failure, Params, ThrowKind, TypeId, Value};
use graph::{Node, NodeError};

// Sub-modules for the different node kinds.
mod execute_process;
mod read_file;
mod root;
mod run_id;
mod scandir;
mod session_values;
mod task;

// Re-export symbols for each kind of node.
pub use self::execute_process::ExecuteProcess;
pub use self::read_file::ReadFile;
pub use self::root::Root;
pub use self::run_id::RunId;
pub use self::scandir::Scandir;
pub use self::session_values::SessionValues;
pub use self::task::{Get, Task, TaskContext};

pub use crate::values::NodeResult;

///
/// Computes the given Entry of the RuleGraph for the given Params, which are first restricted to
/// those that the Entry consumes.
///
fn select(
    context: Context,
    mut params: Params,
    entry: rule_graph::Entry<Rule>,
) -> BoxFuture<'static, NodeResult<Value>> {
    params.retain(|k| match &entry {
        rule_graph::Entry::Param(type_id) => type_id == k.type_id(),
        rule_graph::Entry::WithDeps(with_deps) => with_deps.params().contains(k.type_id()),
    });
    async move {
        match entry {
            rule_graph::Entry::WithDeps(wd) => match wd.as_ref() {
                rule_graph::EntryWithDeps::Rule(rule_entry) => match rule_entry.rule() {
                    Rule::Task(task) => {
                        context
                            .get(Task {
                                params,
                                task: *task,
                                entry: wd,
                            })
                            .await
                    }
                    Rule::Intrinsic(intrinsic) => {
                        let values = future::try_join_all(
                            intrinsic
                                .inputs
                                .iter()
                                .map(|dependency_key| {
                                    select_product(
                                        context.clone(),
                                        params.clone(),
                                        dependency_key,
                                        "intrinsic",
                                        wd,
                                    )
                                })
                                .collect::<Vec<_>>(),
                        )
                        .await?;
                        context
                            .core
                            .rule_index
                            .intrinsics()
                            .run(intrinsic, context.clone(), values)
                            .await
                    }
                },
                rule_graph::EntryWithDeps::Root(_) => {
                    panic!("Not a runtime-executable entry! {wd:?}")
                }
            },
            rule_graph::Entry::Param(type_id) => {
                if let Some(key) = params.find(type_id) {
                    Ok(key.to_value())
                } else {
                    Err(throw(format!(
                        "Expected a Param of type {type_id} to be present, but had only: {params}",
                    )))
                }
            }
        }
    }
    .boxed()
}

fn select_product(
    context: Context,
    params: Params,
    dependency_key: &DependencyKey<TypeId>,
    caller_description: &str,
    entry: Intern<rule_graph::EntryWithDeps<Rule>>,
) -> BoxFuture<'static, NodeResult<Value>> {
    let entry = context
        .core
        .rule_graph()
        .edges_for_inner(&rule_graph::Entry::WithDeps(entry))
        .ok_or_else(|| {
            throw(format!(
                "Tried to request {dependency_key} for {caller_description} but found no edges"
            ))
        })
        .and_then(|edges| {
            edges.entry_for(dependency_key).cloned().ok_or_else(|| {
                throw(format!(
                    "{caller_description} did not declare a dependency on {dependency_key}"
                ))
            })
        });
    match entry {
        Ok(entry) => select(context, params, entry),
        Err(failure) => future::err(failure).boxed(),
    }
}

///
/// There is large variance in the sizes of the members of this enum, so a few of them are boxed.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum NodeKey {
    ExecuteProcess(ExecuteProcess),
    ReadFile(ReadFile),
    Scandir(Scandir),
    Root(Box<Root>),
    SessionValues(SessionValues),
    RunId(RunId),
    Task(Box<Task>),
}

impl NodeKey {
    ///
    /// The path (relative to the build root) that this Node reads, if it is a filesystem
    /// operation. These Nodes are the roots of invalidation when files change.
    ///
    pub fn fs_subject(&self) -> Option<&Path> {
        match self {
            NodeKey::ReadFile(s) => Some(s.0.as_ref()),
            NodeKey::Scandir(s) => Some(s.0.as_ref()),

            // Not FS operations:
            // Explicitly listed so that if people add new NodeKeys they need to consider whether
            // their NodeKey represents an FS operation, and accordingly whether they need to add it
            // to the above list or the below list.
            &NodeKey::ExecuteProcess { .. }
            | &NodeKey::Root { .. }
            | &NodeKey::SessionValues { .. }
            | &NodeKey::RunId { .. }
            | &NodeKey::Task { .. } => None,
        }
    }

    fn workunit_level(&self) -> Level {
        match self {
            NodeKey::Task(ref task) => task.task.display_info.level,
            NodeKey::ExecuteProcess(..) => {
                // NB: The Node for a Process is rendered at Debug (rather than at Process.level)
                // until it has acquired a slot to run in.
                Level::Debug
            }
            _ => Level::Trace,
        }
    }

    ///
    /// Provides the `name` field in workunits associated with this node. These names
    /// should be friendly to machine-parsing (i.e. "my_node" rather than "My awesome node!").
    ///
    pub fn workunit_name(&self) -> &'static str {
        match self {
            NodeKey::Task(ref task) => &task.task.as_ref().display_info.name,
            NodeKey::ExecuteProcess(..) => "process",
            NodeKey::ReadFile(..) => "read_file",
            NodeKey::Scandir(..) => "scandir",
            NodeKey::Root(..) => "root",
            NodeKey::SessionValues(..) => "session_values",
            NodeKey::RunId(..) => "run_id",
        }
    }

    ///
    /// Nodes optionally have a user-facing description (distinct from their Debug and Display
    /// implementations), which says what the engine is currently doing.
    ///
    fn workunit_desc(&self) -> Option<String> {
        match self {
            NodeKey::Task(ref task) => {
                let task_desc = task.task.display_info.desc.as_ref()?;
                if task.params.is_empty() {
                    Some(task_desc.to_owned())
                } else {
                    Some(format!("{task_desc} - {}", task.params))
                }
            }
            NodeKey::ExecuteProcess(epr) => {
                // NB: See Self::workunit_level for more information on why this is prefixed.
                Some(format!("Scheduling: {}", epr.process.description))
            }
            NodeKey::ReadFile(ReadFile(path)) => {
                Some(format!("Reading file: {}", path.as_ref().display()))
            }
            NodeKey::Scandir(Scandir(path)) => {
                Some(format!("Reading directory: {}", path.as_ref().display()))
            }
            NodeKey::Root(..) | NodeKey::SessionValues(..) | NodeKey::RunId(..) => None,
        }
    }

    async fn maybe_watch(&self, context: &Context) -> NodeResult<()> {
        if let Some((path, watcher)) = self.fs_subject().zip(context.core.watcher.as_ref()) {
            watcher.watch(path.to_path_buf()).await.map_err(throw)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Node for NodeKey {
    type Context = SessionCore;

    type Item = NodeOutput;
    type Error = Failure;

    async fn run(self, context: Context) -> Result<NodeOutput, Failure> {
        let workunit_name = self.workunit_name();
        let workunit_desc = self.workunit_desc();

        in_workunit!(
            workunit_name,
            self.workunit_level(),
            desc = workunit_desc.clone(),
            |workunit| async move {
                // Ensure that we have installed filesystem watches before Nodes which inspect the
                // filesystem.
                let maybe_watch = self.maybe_watch(&context).await;

                let mut result = match self {
                    NodeKey::ExecuteProcess(n) => n
                        .run_node(context, workunit)
                        .await
                        .map(|r| NodeOutput::ProcessResult(Arc::new(r))),
                    NodeKey::ReadFile(n) => n
                        .run_node(context, workunit)
                        .await
                        .map(|c| NodeOutput::FileContent(Arc::new(c))),
                    NodeKey::Scandir(n) => n
                        .run_node(context, workunit)
                        .await
                        .map(|l| NodeOutput::DirectoryListing(Arc::new(l))),
                    NodeKey::Root(n) => n.run_node(context).await.map(NodeOutput::Value),
                    NodeKey::SessionValues(n) => n.run_node(context).await.map(NodeOutput::Value),
                    NodeKey::RunId(n) => n.run_node(context).await.map(NodeOutput::Value),
                    NodeKey::Task(n) => n.run_node(context, workunit).await.map(NodeOutput::Value),
                };

                // If both the Node and the watch failed, prefer the Node's error message (we have
                // little control over the error messages of the watch API).
                if let (Ok(_), Err(e)) = (&result, maybe_watch) {
                    result = Err(e);
                }

                // If the node failed, expand the Failure with a new frame.
                result.map_err(|failure| failure.with_pushed_frame(workunit_name, workunit_desc))
            }
        )
        .await
    }

    fn cacheable(&self) -> bool {
        match self {
            NodeKey::Task(s) => s.task.cacheable,
            NodeKey::ExecuteProcess(ep) => {
                ep.process.cache_scope != crate::process::ProcessCacheScope::PerSession
            }
            &NodeKey::SessionValues(_) | &NodeKey::RunId(_) => false,
            _ => true,
        }
    }

    fn cacheable_item(&self, output: &NodeOutput) -> bool {
        match (self, output) {
            (NodeKey::ExecuteProcess(ref ep), NodeOutput::ProcessResult(ref process_result)) => {
                match ep.process.cache_scope {
                    crate::process::ProcessCacheScope::Always => true,
                    crate::process::ProcessCacheScope::Successful => {
                        process_result.exit_code == 0
                    }
                    crate::process::ProcessCacheScope::PerSession => false,
                }
            }
            _ => true,
        }
    }

    fn cyclic_error(path: &[&NodeKey]) -> Failure {
        let mut path = path.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        if let Some(first) = path.first_mut() {
            *first += " <-";
        }
        throw_kind(
            ThrowKind::Cycle,
            format!(
                "The dependency graph contained a cycle:\n  {}",
                path.join("\n  ")
            ),
        )
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match self {
            NodeKey::ExecuteProcess(s) => write!(f, "Process({})", s.process.description),
            NodeKey::ReadFile(s) => write!(f, "ReadFile({})", s.0.as_ref().display()),
            NodeKey::Scandir(s) => write!(f, "Scandir({})", s.0.as_ref().display()),
            NodeKey::Root(s) => write!(f, "Select({}, {})", s.params, s.product),
            NodeKey::Task(task) => {
                let params = task
                    .params
                    .keys()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>();
                write!(
                    f,
                    "@rule({}({}))",
                    task.task.display_info.name,
                    params.join(", ")
                )
            }
            &NodeKey::SessionValues(_) => write!(f, "SessionValues"),
            &NodeKey::RunId(_) => write!(f, "RunId"),
        }
    }
}

impl NodeError for Failure {
    fn invalidated() -> Failure {
        Failure::Invalidated
    }

    fn generic(message: String) -> Failure {
        throw(message)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeOutput {
    FileContent(Arc<FileContent>),
    DirectoryListing(Arc<DirectoryListing>),
    ProcessResult(Arc<ProcessResult>),
    Value(Value),
}

impl TryFrom<NodeOutput> for Value {
    type Error = ();

    fn try_from(nr: NodeOutput) -> Result<Self, ()> {
        match nr {
            NodeOutput::Value(v) => Ok(v),
            _ => Err(()),
        }
    }
}
