// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use graph::CompoundNode;
use workunit_store::{Metric, RunningWorkunit};

use super::{NodeKey, NodeOutput, NodeResult};
use crate::context::Context;
use crate::fs::{self, FileContent, RelativePath};
use crate::values::throw;

///
/// A Node that represents reading the content of a file, relative to the build root.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ReadFile(pub RelativePath);

impl ReadFile {
    pub(super) async fn run_node(
        self,
        context: Context,
        workunit: &mut RunningWorkunit,
    ) -> NodeResult<FileContent> {
        workunit.increment_counter(Metric::FileReads, 1);
        fs::read_file(&context.core.build_root, self.0.as_ref())
            .await
            .map_err(throw)
    }
}

impl CompoundNode<NodeKey> for ReadFile {
    type Item = Arc<FileContent>;
}

impl From<ReadFile> for NodeKey {
    fn from(n: ReadFile) -> Self {
        NodeKey::ReadFile(n)
    }
}

impl TryFrom<NodeOutput> for Arc<FileContent> {
    type Error = ();

    fn try_from(nr: NodeOutput) -> Result<Self, ()> {
        match nr {
            NodeOutput::FileContent(v) => Ok(v),
            _ => Err(()),
        }
    }
}
