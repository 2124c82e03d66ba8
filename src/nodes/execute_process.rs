// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use graph::CompoundNode;
use log::debug;
use workunit_store::{Metric, RunningWorkunit, WorkunitMetadata};

use super::{NodeKey, NodeOutput, NodeResult};
use crate::context::Context;
use crate::process::{self, Process, ProcessResult};
use crate::values::{throw, ThrowKind};

/// A Node that represents a process to execute.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ExecuteProcess {
    pub process: Box<Process>,
}

impl ExecuteProcess {
    pub(super) async fn run_node(
        self,
        context: Context,
        workunit: &mut RunningWorkunit,
    ) -> NodeResult<ProcessResult> {
        let request = self.process;

        let _permit = {
            let _blocking_token = workunit.blocking();
            context
                .core
                .process_semaphore
                .acquire()
                .await
                .map_err(|e| throw(format!("Failed to acquire a process slot: {e}")))?
        };

        // Now that a slot has been acquired, render the workunit at the level of the Process.
        workunit.update_metadata(|initial| WorkunitMetadata {
            desc: Some(request.description.clone()),
            level: request.level,
            ..initial
        });
        workunit.increment_counter(Metric::LocalProcessExecutionRequests, 1);

        debug!("Running local process: {:?}", request.argv);
        let result = process::run_local(&request, &context.core.build_root).await;
        match &result {
            Ok(res) if res.exit_code != 0 => {
                workunit.increment_counter(Metric::LocalProcessExecutionFailures, 1);
            }
            Err(failure) if failure.throw_kind() == Some(ThrowKind::Timeout) => {
                workunit.increment_counter(Metric::LocalProcessExecutionTimeouts, 1);
            }
            _ => {}
        }
        result
    }
}

impl CompoundNode<NodeKey> for ExecuteProcess {
    type Item = Arc<ProcessResult>;
}

impl From<ExecuteProcess> for NodeKey {
    fn from(n: ExecuteProcess) -> Self {
        NodeKey::ExecuteProcess(n)
    }
}

impl TryFrom<NodeOutput> for Arc<ProcessResult> {
    type Error = ();

    fn try_from(nr: NodeOutput) -> Result<Self, ()> {
        match nr {
            NodeOutput::ProcessResult(v) => Ok(v),
            _ => Err(()),
        }
    }
}
